//! Instruction capture from flags, files or the operator's editor.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

const DEFAULT_EDITOR: &str = "nano";

/// Where the operator's instruction comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionSource {
    Message(String),
    File(PathBuf),
    Editor,
}

/// Read the instruction text. Empty text is returned as-is.
pub fn read_instruction(source: &InstructionSource, workdir: &Path) -> Result<String> {
    match source {
        InstructionSource::Message(text) => Ok(text.clone()),
        InstructionSource::File(path) => fs::read_to_string(path)
            .with_context(|| format!("read instruction file {}", path.display())),
        InstructionSource::Editor => {
            let argv = editor_command(
                std::env::var("VISUAL").ok().as_deref(),
                std::env::var("EDITOR").ok().as_deref(),
            );
            capture_with_editor(&argv, workdir)
        }
    }
}

/// `$VISUAL`, then `$EDITOR`, then nano, split on whitespace.
pub fn editor_command(visual: Option<&str>, editor: Option<&str>) -> Vec<String> {
    let chosen = [visual, editor]
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
        .unwrap_or(DEFAULT_EDITOR);
    chosen.split_whitespace().map(str::to_string).collect()
}

/// Open `argv` on a fresh `AI_TASK_*.txt` file in `workdir` and return what
/// the operator saved. The temp file is removed afterwards.
pub fn capture_with_editor(argv: &[String], workdir: &Path) -> Result<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("editor command is empty"))?;
    let file = tempfile::Builder::new()
        .prefix("AI_TASK_")
        .suffix(".txt")
        .tempfile_in(workdir)
        .with_context(|| format!("create instruction file in {}", workdir.display()))?;

    debug!(editor = %program, path = %file.path().display(), "opening editor");
    let status = Command::new(program)
        .args(args)
        .arg(file.path())
        .status()
        .with_context(|| format!("launch editor {program}"))?;
    if !status.success() {
        return Err(anyhow!("editor {program} exited with {:?}", status.code()));
    }
    fs::read_to_string(file.path())
        .with_context(|| format!("read instruction file {}", file.path().display()))
}
