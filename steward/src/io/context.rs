//! Project context pack and per-request attachments.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use super::config::ContextConfig;
use super::prompt::Attachment;
use crate::core::path::display_slash;

const HEADER: &str = "=== PROJECT CONTEXT (READ-ONLY) ===";
const SKIPPED_DIRS: [&str; 3] = ["target", "__pycache__", "node_modules"];

/// Which project directories feed the context pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ContextScope {
    /// Specs, docs and code.
    #[default]
    Full,
    Code,
    /// Specs and docs only.
    Specs,
    /// No project files.
    Minimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextPack {
    pub text: String,
    pub included: Vec<String>,
    /// Files left out because they would exceed the budget or were unreadable.
    pub omitted: Vec<String>,
}

/// Gather project files for `scope` in a stable order: specs, docs, code.
///
/// `excluded` holds absolute directories that never contribute (staging,
/// ledgers, sessions).
pub fn build_context_pack(
    root: &Path,
    config: &ContextConfig,
    scope: ContextScope,
    excluded: &[PathBuf],
) -> Result<ContextPack> {
    let markdown = ["md".to_string()];
    let mut sources: Vec<(&[String], &[String])> = Vec::new();
    if matches!(scope, ContextScope::Full | ContextScope::Specs) {
        sources.push((config.spec_dirs.as_slice(), &markdown[..]));
        sources.push((config.doc_dirs.as_slice(), &markdown[..]));
    }
    if matches!(scope, ContextScope::Full | ContextScope::Code) {
        sources.push((config.code_dirs.as_slice(), config.code_extensions.as_slice()));
    }

    let mut pack = ContextPack::default();
    let mut blocks = vec![HEADER.to_string()];
    let mut used = HEADER.len();
    for (dirs, extensions) in sources {
        for dir in dirs {
            for path in collect_files(&root.join(dir), extensions, excluded) {
                let rel = display_slash(path.strip_prefix(root).unwrap_or(&path));
                if pack.included.contains(&rel) {
                    continue;
                }
                let content = match fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(err) => {
                        warn!(path = %rel, err = %err, "skipping unreadable context file");
                        pack.omitted.push(rel);
                        continue;
                    }
                };
                let block = format!("<file path='{rel}'>\n{content}\n</file>");
                if used + block.len() > config.budget_bytes {
                    pack.omitted.push(rel);
                    continue;
                }
                used += block.len() + 2;
                blocks.push(block);
                pack.included.push(rel);
            }
        }
    }

    if pack.included.is_empty() && pack.omitted.is_empty() {
        return Ok(pack);
    }
    if !pack.omitted.is_empty() {
        blocks.push(format!(
            "[omitted over budget or unreadable: {}]",
            pack.omitted.join(", ")
        ));
    }
    pack.text = blocks.join("\n\n");
    debug!(
        included = pack.included.len(),
        omitted = pack.omitted.len(),
        bytes = pack.text.len(),
        "context pack built"
    );
    Ok(pack)
}

/// Read attached files in order; any unreadable file is an error.
pub fn read_attachments(root: &Path, files: &[PathBuf]) -> Result<Vec<Attachment>> {
    files
        .iter()
        .map(|file| {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                root.join(file)
            };
            let content = fs::read_to_string(&path)
                .with_context(|| format!("read attached file {}", path.display()))?;
            Ok(Attachment {
                path: display_slash(path.strip_prefix(root).unwrap_or(file)),
                content,
            })
        })
        .collect()
}

fn collect_files(dir: &Path, extensions: &[String], excluded: &[PathBuf]) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped(entry, excluded))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|allowed| allowed == ext))
        })
        .map(DirEntry::into_path)
        .collect()
}

fn is_skipped(entry: &DirEntry, excluded: &[PathBuf]) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.')
        || SKIPPED_DIRS.contains(&name.as_ref())
        || excluded.iter().any(|dir| entry.path().starts_with(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    fn project() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "specs/b.md", "spec b");
        write(root, "specs/a.md", "spec a");
        write(root, "impl-docs/guide.md", "guide");
        write(root, "src/main.rs", "fn main() {}");
        write(root, "src/notes.txt", "ignored");
        write(root, "src/.hidden/x.rs", "hidden");
        write(root, "src/__pycache__/m.py", "cache");
        temp
    }

    #[test]
    fn full_scope_orders_specs_docs_code() {
        let temp = project();
        let pack = build_context_pack(
            temp.path(),
            &ContextConfig::default(),
            ContextScope::Full,
            &[],
        )
        .expect("pack");
        assert_eq!(
            pack.included,
            vec!["specs/a.md", "specs/b.md", "impl-docs/guide.md", "src/main.rs"]
        );
        assert!(pack.text.starts_with(HEADER));
        assert!(pack.text.contains("<file path='src/main.rs'>\nfn main() {}\n</file>"));
    }

    #[test]
    fn scopes_select_directories() {
        let temp = project();
        let config = ContextConfig::default();
        let code = build_context_pack(temp.path(), &config, ContextScope::Code, &[]).expect("code");
        assert_eq!(code.included, vec!["src/main.rs"]);
        let specs =
            build_context_pack(temp.path(), &config, ContextScope::Specs, &[]).expect("specs");
        assert_eq!(specs.included.len(), 3);
        let minimal =
            build_context_pack(temp.path(), &config, ContextScope::Minimal, &[]).expect("min");
        assert_eq!(minimal, ContextPack::default());
    }

    #[test]
    fn budget_omits_files_that_do_not_fit() {
        let temp = project();
        let config = ContextConfig {
            budget_bytes: 120,
            ..ContextConfig::default()
        };
        let pack =
            build_context_pack(temp.path(), &config, ContextScope::Full, &[]).expect("pack");
        assert!(!pack.omitted.is_empty());
        assert!(pack.text.contains("[omitted over budget or unreadable:"));
    }

    #[test]
    fn excluded_dirs_are_skipped() {
        let temp = project();
        write(temp.path(), "src/staged/gen.rs", "generated");
        let pack = build_context_pack(
            temp.path(),
            &ContextConfig::default(),
            ContextScope::Code,
            &[temp.path().join("src").join("staged")],
        )
        .expect("pack");
        assert_eq!(pack.included, vec!["src/main.rs"]);
    }

    #[test]
    fn unreadable_attachment_aborts() {
        let temp = project();
        let ok = read_attachments(temp.path(), &[PathBuf::from("specs/a.md")]).expect("read");
        assert_eq!(ok[0].path, "specs/a.md");
        assert_eq!(ok[0].content, "spec a");

        let err = read_attachments(
            temp.path(),
            &[PathBuf::from("specs/a.md"), PathBuf::from("missing.md")],
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("read attached file"));
    }
}
