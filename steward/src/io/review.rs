//! Operator review of a step's staged files and the all-or-nothing merge
//! into the project tree.

use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use similar::TextDiff;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::transcript::Transcript;
use crate::core::path::display_slash;

const MAX_DIFF_LINES: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Destination relative to the project root.
    pub rel: PathBuf,
    pub staged_path: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    Rejected(String),
    Aborted,
}

pub trait Reviewer {
    /// Verdict for one file. Anything shown to the operator goes through
    /// `transcript`.
    fn decide(&mut self, file: &StagedFile, transcript: &Transcript) -> Result<Verdict>;
}

/// Approves everything (`--yes`).
pub struct AutoApprove;

impl Reviewer for AutoApprove {
    fn decide(&mut self, _file: &StagedFile, _transcript: &Transcript) -> Result<Verdict> {
        Ok(Verdict::Approve)
    }
}

/// Asks on a line-oriented terminal until it gets `y`, `n` or `abort`.
///
/// The question is shown through the transcript, so it reaches the console
/// only when the transcript echoes.
pub struct ConsoleReviewer<R> {
    input: R,
}

impl<R: BufRead> ConsoleReviewer<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl<R: BufRead> Reviewer for ConsoleReviewer<R> {
    fn decide(&mut self, file: &StagedFile, transcript: &Transcript) -> Result<Verdict> {
        loop {
            transcript.ask(&format!("apply {}? [y/n/abort]", display_slash(&file.rel)))?;
            let mut line = String::new();
            if self.input.read_line(&mut line).context("read review answer")? == 0 {
                return Ok(Verdict::Abort);
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(Verdict::Approve),
                "n" | "no" => return Ok(Verdict::Reject),
                "a" | "abort" | "q" => return Ok(Verdict::Abort),
                _ => continue,
            }
        }
    }
}

/// List a step's staged files, sorted, with their project destinations.
pub fn collect_staged(step_dir: &Path, project_root: &Path) -> Result<Vec<StagedFile>> {
    if !step_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(step_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk staging dir {}", step_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(step_dir)
            .with_context(|| format!("staged path outside {}", step_dir.display()))?
            .to_path_buf();
        files.push(StagedFile {
            destination: project_root.join(&rel),
            staged_path: entry.into_path(),
            rel,
        });
    }
    Ok(files)
}

/// Show each file's diff and collect verdicts. The first `n` or `abort`
/// ends the review.
pub fn review_step(
    files: &[StagedFile],
    reviewer: &mut dyn Reviewer,
    transcript: &Transcript,
) -> Result<ReviewDecision> {
    for file in files {
        let new = fs::read_to_string(&file.staged_path)
            .with_context(|| format!("read staged {}", file.staged_path.display()))?;
        let old = match fs::read_to_string(&file.destination) {
            Ok(old) => Some(old),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read {}", file.destination.display()));
            }
        };
        let rel = display_slash(&file.rel);
        transcript.wrapper(&format!("--- {rel}\n{}", compact_diff(old.as_deref(), &new)))?;

        let verdict = reviewer.decide(file, transcript)?;
        transcript.user(&format!("{rel}: {verdict:?}"))?;
        match verdict {
            Verdict::Approve => {}
            Verdict::Reject => return Ok(ReviewDecision::Rejected(rel)),
            Verdict::Abort => return Ok(ReviewDecision::Aborted),
        }
    }
    Ok(ReviewDecision::Approved)
}

/// Unified diff of a staged file against its destination, capped at
/// `MAX_DIFF_LINES` lines.
pub fn compact_diff(old: Option<&str>, new: &str) -> String {
    let mut out = match old {
        None => format!("(new file, {} lines)\n", new.lines().count()),
        Some(old) if old == new => return "(unchanged)\n".to_string(),
        Some(_) => String::new(),
    };
    let diff = TextDiff::from_lines(old.unwrap_or(""), new);
    let unified = diff.unified_diff().context_radius(3).to_string();
    let lines: Vec<&str> = unified.lines().collect();
    for line in lines.iter().take(MAX_DIFF_LINES) {
        out.push_str(line);
        out.push('\n');
    }
    if lines.len() > MAX_DIFF_LINES {
        out.push_str(&format!("... ({} more lines)\n", lines.len() - MAX_DIFF_LINES));
    }
    out
}

/// Copy every staged file into place, or none of them.
///
/// Each file is first written to a temporary sibling of its destination.
/// Only when all temporaries exist are they renamed over the destinations.
/// Existing destinations are backed up first; if any rename fails, the
/// files already moved are restored from their backups (or removed when
/// they were new) and directories created for the merge are removed again.
/// Staged files are left untouched.
pub fn apply_atomically(files: &[StagedFile]) -> Result<Vec<PathBuf>> {
    let mut created_dirs: Vec<PathBuf> = Vec::new();
    let prepared = prepare(files, &mut created_dirs);
    let pending = match prepared {
        Ok(pending) => pending,
        Err(err) => {
            remove_created_dirs(&created_dirs);
            return Err(err);
        }
    };

    let mut moved: Vec<(&StagedFile, Option<NamedTempFile>)> = Vec::with_capacity(pending.len());
    let mut failure = None;
    let mut pending = pending.into_iter();
    for (tmp, file) in pending.by_ref() {
        let backup = match backup_existing(&file.destination) {
            Ok(backup) => backup,
            Err(err) => {
                failure = Some(err);
                break;
            }
        };
        if let Err(err) = tmp.persist(&file.destination) {
            warn!(path = %file.destination.display(), "rename into place failed, rolling back");
            failure = Some(anyhow!(
                "replace {}: {}",
                file.destination.display(),
                err.error
            ));
            break;
        }
        debug!(path = %file.destination.display(), "applied");
        moved.push((file, backup));
    }
    // Unused temporaries go before their directories are removed.
    drop(pending);

    if let Some(err) = failure {
        roll_back(moved, &created_dirs);
        return Err(err);
    }
    Ok(moved.into_iter().map(|(file, _)| file.rel.clone()).collect())
}

fn prepare<'a>(
    files: &'a [StagedFile],
    created_dirs: &mut Vec<PathBuf>,
) -> Result<Vec<(NamedTempFile, &'a StagedFile)>> {
    let mut pending = Vec::with_capacity(files.len());
    for file in files {
        if file.destination.is_dir() {
            return Err(anyhow!(
                "destination is a directory {}",
                file.destination.display()
            ));
        }
        let parent = file
            .destination
            .parent()
            .ok_or_else(|| anyhow!("destination has no parent {}", file.destination.display()))?;
        let mut missing: Vec<PathBuf> = parent
            .ancestors()
            .take_while(|dir| !dir.exists())
            .map(Path::to_path_buf)
            .collect();
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        created_dirs.append(&mut missing);
        let contents = fs::read(&file.staged_path)
            .with_context(|| format!("read staged {}", file.staged_path.display()))?;
        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("create temp file in {}", parent.display()))?;
        tmp.write_all(&contents)
            .with_context(|| format!("write temp for {}", file.destination.display()))?;
        pending.push((tmp, file));
    }
    Ok(pending)
}

/// Copy an existing destination aside; `None` when there is nothing to keep.
fn backup_existing(destination: &Path) -> Result<Option<NamedTempFile>> {
    if !destination.is_file() {
        return Ok(None);
    }
    let parent = destination
        .parent()
        .ok_or_else(|| anyhow!("destination has no parent {}", destination.display()))?;
    let backup = tempfile::Builder::new()
        .prefix(".steward-backup")
        .tempfile_in(parent)
        .with_context(|| format!("create backup in {}", parent.display()))?;
    fs::copy(destination, backup.path())
        .with_context(|| format!("back up {}", destination.display()))?;
    Ok(Some(backup))
}

fn roll_back(moved: Vec<(&StagedFile, Option<NamedTempFile>)>, created_dirs: &[PathBuf]) {
    for (file, backup) in moved.into_iter().rev() {
        let restored = match backup {
            Some(backup) => backup
                .persist(&file.destination)
                .map(|_| ())
                .map_err(|err| err.error),
            None => fs::remove_file(&file.destination),
        };
        if let Err(err) = restored {
            warn!(path = %file.destination.display(), err = %err, "rollback failed");
        }
    }
    remove_created_dirs(created_dirs);
}

/// Remove directories this merge created, deepest first, if still empty.
fn remove_created_dirs(created_dirs: &[PathBuf]) {
    let mut dirs = created_dirs.to_vec();
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        let _ = fs::remove_dir(&dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Scripted(Vec<Verdict>);

    impl Reviewer for Scripted {
        fn decide(&mut self, _file: &StagedFile, _transcript: &Transcript) -> Result<Verdict> {
            Ok(self.0.remove(0))
        }
    }

    fn staged_project() -> (tempfile::TempDir, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let step_dir = temp.path().join("artifacts").join("step_1");
        fs::create_dir_all(step_dir.join("src")).expect("mkdir");
        fs::write(step_dir.join("src").join("b.py"), "b = 2\n").expect("write b");
        fs::write(step_dir.join("a.md"), "# A\n").expect("write a");
        (temp, step_dir)
    }

    fn transcript(root: &Path) -> Transcript {
        Transcript::open(root.join("t.log"), "s", false).expect("transcript")
    }

    #[test]
    fn collects_sorted_files_with_destinations() {
        let (temp, step_dir) = staged_project();
        let files = collect_staged(&step_dir, temp.path()).expect("collect");
        let rels: Vec<_> = files.iter().map(|f| display_slash(&f.rel)).collect();
        assert_eq!(rels, vec!["a.md", "src/b.py"]);
        assert_eq!(files[1].destination, temp.path().join("src").join("b.py"));
    }

    #[test]
    fn diff_marks_only_changed_lines() {
        let diff = compact_diff(Some("a\nb\nc\nd\n"), "X\nb\nc\nY\n");
        let changed: Vec<&str> = diff
            .lines()
            .filter(|line| line.starts_with('-') || line.starts_with('+'))
            .collect();
        assert_eq!(changed, vec!["-a", "+X", "-d", "+Y"]);
        assert!(diff.contains(" b\n"));
        assert!(diff.starts_with("@@"));
        assert_eq!(compact_diff(Some("x"), "x"), "(unchanged)\n");
        let created = compact_diff(None, "1\n2\n");
        assert!(created.starts_with("(new file, 2 lines)"));
        assert!(created.contains("+1\n+2\n"));
    }

    #[test]
    fn long_diff_is_capped() {
        let new: String = (0..1000).map(|n| format!("{n}\n")).collect();
        let diff = compact_diff(None, &new);
        assert!(diff.lines().count() <= MAX_DIFF_LINES + 2);
        assert!(diff.trim_end().ends_with("more lines)"));
    }

    #[test]
    fn any_rejection_stops_review() {
        let (temp, step_dir) = staged_project();
        let files = collect_staged(&step_dir, temp.path()).expect("collect");
        let transcript = transcript(temp.path());

        let mut reviewer = Scripted(vec![Verdict::Approve, Verdict::Reject]);
        let decision = review_step(&files, &mut reviewer, &transcript).expect("review");
        assert_eq!(decision, ReviewDecision::Rejected("src/b.py".to_string()));

        let mut reviewer = Scripted(vec![Verdict::Abort]);
        let decision = review_step(&files, &mut reviewer, &transcript).expect("review");
        assert_eq!(decision, ReviewDecision::Aborted);
    }

    #[test]
    fn console_reviewer_reprompts_and_treats_eof_as_abort() {
        let file = StagedFile {
            rel: PathBuf::from("x.txt"),
            staged_path: PathBuf::from("s"),
            destination: PathBuf::from("d"),
        };
        let temp = tempfile::tempdir().expect("tempdir");
        let transcript = transcript(temp.path());
        let mut reviewer = ConsoleReviewer::new(Cursor::new("maybe\nY\n"));
        assert_eq!(
            reviewer.decide(&file, &transcript).expect("decide"),
            Verdict::Approve
        );
        let mut reviewer = ConsoleReviewer::new(Cursor::new(""));
        assert_eq!(
            reviewer.decide(&file, &transcript).expect("decide"),
            Verdict::Abort
        );
        let logged = fs::read_to_string(transcript.path()).expect("transcript");
        assert_eq!(logged.matches("apply x.txt? [y/n/abort]").count(), 3);
    }

    #[test]
    fn apply_merges_all_and_keeps_staged_copies() {
        let (temp, step_dir) = staged_project();
        fs::write(temp.path().join("a.md"), "old\n").expect("existing");
        let files = collect_staged(&step_dir, temp.path()).expect("collect");

        let applied = apply_atomically(&files).expect("apply");

        assert_eq!(applied.len(), 2);
        assert_eq!(fs::read_to_string(temp.path().join("a.md")).expect("a"), "# A\n");
        assert_eq!(
            fs::read_to_string(temp.path().join("src").join("b.py")).expect("b"),
            "b = 2\n"
        );
        assert!(step_dir.join("a.md").is_file());
    }

    #[test]
    fn apply_failure_merges_nothing() {
        let (temp, step_dir) = staged_project();
        // `src` exists as a file, so `src/b.py` cannot be created.
        fs::write(temp.path().join("src"), "blocker").expect("blocker");
        let files = collect_staged(&step_dir, temp.path()).expect("collect");

        assert!(apply_atomically(&files).is_err());

        assert!(!temp.path().join("a.md").exists());
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }

    #[test]
    fn directory_in_the_way_merges_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let step_dir = temp.path().join("artifacts").join("step_1");
        fs::create_dir_all(&step_dir).expect("mkdir");
        fs::write(step_dir.join("a.md"), "# A\n").expect("write a");
        fs::write(step_dir.join("z.txt"), "z\n").expect("write z");
        fs::create_dir_all(temp.path().join("z.txt")).expect("dir z");
        fs::write(temp.path().join("z.txt").join("keep"), "keep").expect("keep");
        let files = collect_staged(&step_dir, temp.path()).expect("collect");

        assert!(apply_atomically(&files).is_err());

        assert!(!temp.path().join("a.md").exists());
        assert!(temp.path().join("z.txt").join("keep").is_file());
    }

    #[test]
    fn roll_back_restores_replaced_and_removes_new_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let existing = StagedFile {
            rel: PathBuf::from("a.md"),
            staged_path: PathBuf::from("unused"),
            destination: temp.path().join("a.md"),
        };
        let fresh = StagedFile {
            rel: PathBuf::from("new/b.md"),
            staged_path: PathBuf::from("unused"),
            destination: temp.path().join("new").join("b.md"),
        };
        fs::write(&existing.destination, "old\n").expect("old");
        let backup = backup_existing(&existing.destination)
            .expect("backup")
            .expect("has backup");
        fs::write(&existing.destination, "new\n").expect("replace");
        fs::create_dir_all(temp.path().join("new")).expect("new dir");
        fs::write(&fresh.destination, "b\n").expect("fresh");

        roll_back(
            vec![(&existing, Some(backup)), (&fresh, None)],
            &[temp.path().join("new")],
        );

        assert_eq!(
            fs::read_to_string(&existing.destination).expect("restored"),
            "old\n"
        );
        assert!(!temp.path().join("new").exists());
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(".steward-backup"))
            .collect();
        assert!(leftovers.is_empty(), "backups left: {leftovers:?}");
    }
}
