//! Human-readable session transcript.
//!
//! Everything steward shows on the console goes through here so the
//! transcript is a verbatim mirror of the session. Lines are timestamped
//! and tagged by source.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

const WRAPPER: &str = "[WRAPPER] >> ";
const ERROR: &str = "[ERROR]   !! ";
const PROMPT: &str = "[PROMPT]  >> ";
const USER: &str = "[USER]    << ";

#[derive(Debug, Clone)]
pub struct Transcript {
    path: PathBuf,
    /// Also print to the console.
    echo: bool,
}

impl Transcript {
    pub fn open(path: impl Into<PathBuf>, session_id: &str, echo: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create transcript dir {}", parent.display()))?;
        }
        let transcript = Self { path, echo };
        let header = format!(
            "\n===== session {session_id} started {} =====\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );
        transcript.append_raw(&header)?;
        Ok(transcript)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Steward's own status output.
    pub fn wrapper(&self, message: &str) -> Result<()> {
        self.emit(WRAPPER, message, false)
    }

    pub fn error(&self, message: &str) -> Result<()> {
        self.emit(ERROR, message, true)
    }

    /// Text sent to, or received from, the model.
    pub fn prompt(&self, message: &str) -> Result<()> {
        self.emit(PROMPT, message, false)
    }

    /// Operator input, including text captured from an editor.
    pub fn user(&self, message: &str) -> Result<()> {
        self.emit(USER, message, false)
    }

    /// A question left open on the console line for the operator's answer.
    pub fn ask(&self, question: &str) -> Result<()> {
        let line = format!("[{}] {PROMPT}{question}", Utc::now().format("%H:%M:%S"));
        if self.echo {
            print!("{line} ");
            std::io::stdout().flush().context("flush console")?;
        }
        self.append_raw(&format!("{line}\n"))
    }

    /// Console-facing output, such as a script's captured streams, recorded
    /// verbatim without tags.
    pub fn raw(&self, text: &str) -> Result<()> {
        if self.echo {
            print!("{text}");
        }
        self.append_raw(text)
    }

    fn emit(&self, tag: &str, message: &str, to_stderr: bool) -> Result<()> {
        let stamp = Utc::now().format("%H:%M:%S");
        let mut block = String::new();
        for line in message.lines() {
            block.push_str(&format!("[{stamp}] {tag}{line}\n"));
        }
        if message.is_empty() {
            block.push_str(&format!("[{stamp}] {tag}\n"));
        }
        if self.echo {
            if to_stderr {
                eprint!("{block}");
            } else {
                print!("{block}");
            }
        }
        self.append_raw(&block)
    }

    fn append_raw(&self, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open transcript {}", self.path.display()))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("write transcript {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_tagged_and_appended() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("s").join("transcript.log");
        let transcript = Transcript::open(&path, "sid", false).expect("open");

        transcript.user("line one\nline two").expect("user");
        transcript.error("boom").expect("error");

        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.contains("===== session sid started"));
        assert!(contents.contains("[USER]    << line one"));
        assert!(contents.contains("[USER]    << line two"));
        assert!(contents.contains("[ERROR]   !! boom"));
    }

    #[test]
    fn questions_and_raw_output_are_recorded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("transcript.log");
        let transcript = Transcript::open(&path, "sid", false).expect("open");

        transcript.ask("apply a.md? [y/n/abort]").expect("ask");
        transcript.raw("--- stdout ---\nok\n").expect("raw");

        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.contains("[PROMPT]  >> apply a.md? [y/n/abort]\n"));
        assert!(contents.ends_with("--- stdout ---\nok\n"));
    }

    #[test]
    fn reopening_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("transcript.log");
        Transcript::open(&path, "a", false)
            .expect("open")
            .wrapper("first")
            .expect("write");
        Transcript::open(&path, "b", false).expect("reopen");

        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.contains("[WRAPPER] >> first"));
        assert!(contents.contains("session b started"));
    }
}
