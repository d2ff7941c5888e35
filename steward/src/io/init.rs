//! Project layout and `steward init` scaffolding.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::config::{StewardConfig, load_config, write_config};
use crate::core::ids::SessionId;

/// Canonical paths within a steward-managed project.
#[derive(Debug, Clone)]
pub struct StewardPaths {
    pub root: PathBuf,
    pub steward_dir: PathBuf,
    pub config_path: PathBuf,
    pub ledger_dir: PathBuf,
    /// Fine-grained event stream.
    pub events_path: PathBuf,
    /// Coarse transaction stream.
    pub audit_log_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub manifests_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl StewardPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let steward_dir = root.join(".steward");
        let ledger_dir = root.join("ledger");
        Self {
            config_path: steward_dir.join("config.toml"),
            steward_dir,
            events_path: ledger_dir.join("events.jsonl"),
            audit_log_path: ledger_dir.join("audit_log.jsonl"),
            ledger_dir,
            sessions_dir: root.join("sessions"),
            manifests_dir: root.join("manifests"),
            gitignore_path: root.join(".gitignore"),
            root,
        }
    }

    pub fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.sessions_dir.join(session.date())
    }

    pub fn transcript_path(&self, session: &SessionId) -> PathBuf {
        self.session_dir(session).join("transcript.log")
    }

    pub fn raw_exchanges_dir(&self, session: &SessionId) -> PathBuf {
        self.session_dir(session).join("raw_exchanges")
    }

    pub fn manifest_path(&self, session: &SessionId) -> PathBuf {
        self.manifests_dir
            .join(format!("session_{session}_manifest.json"))
    }

    pub fn staging_root(&self, config: &StewardConfig) -> PathBuf {
        self.root.join(&config.staging_dir)
    }

    pub fn sandbox_root(&self, config: &StewardConfig) -> PathBuf {
        self.root.join(&config.sandbox.root)
    }
}

/// Create the steward layout in `root`.
///
/// Fails if `.steward/` already exists unless `force` is set, in which case
/// the config is reset to defaults. Ledgers are never truncated.
pub fn init_project(root: &Path, force: bool) -> Result<StewardPaths> {
    let paths = StewardPaths::new(root);
    if paths.steward_dir.exists() && !force {
        return Err(anyhow!(
            "steward init: .steward already exists (use --force to overwrite)"
        ));
    }
    if paths.steward_dir.exists() && !paths.steward_dir.is_dir() {
        return Err(anyhow!(
            "steward init: .steward exists but is not a directory"
        ));
    }

    let config = StewardConfig::default();
    write_config(&paths.config_path, &config)?;

    for dir in [
        &paths.ledger_dir,
        &paths.sessions_dir,
        &paths.manifests_dir,
        &paths.staging_root(&config),
        &paths.sandbox_root(&config),
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    touch(&paths.events_path)?;
    touch(&paths.audit_log_path)?;
    ensure_gitignored(&paths.gitignore_path, &config.staging_dir)?;

    debug!(root = %root.display(), "initialized steward project");
    Ok(paths)
}

/// Load the config of an initialized project.
pub fn open_project(root: &Path) -> Result<(StewardPaths, StewardConfig)> {
    let paths = StewardPaths::new(root);
    if !paths.steward_dir.is_dir() {
        return Err(anyhow!(
            "{} is not a steward project (run `steward init`)",
            root.display()
        ));
    }
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn touch(path: &Path) -> Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    Ok(())
}

fn ensure_gitignored(gitignore: &Path, staging_dir: &str) -> Result<()> {
    let entry = format!("{}/", staging_dir.trim_end_matches('/'));
    let existing = match fs::read_to_string(gitignore) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", gitignore.display()));
        }
    };
    if existing.lines().any(|line| line.trim() == entry) {
        return Ok(());
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&entry);
    updated.push('\n');
    fs::write(gitignore, updated).with_context(|| format!("write {}", gitignore.display()))
}
