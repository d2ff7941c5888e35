//! Per-invocation wiring of the audit recorder, content store and sandbox.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::info;

use crate::core::ids::SessionId;
use crate::io::audit::AuditRecorder;
use crate::io::config::StewardConfig;
use crate::io::content_store::ContentStore;
use crate::io::init::{StewardPaths, open_project};
use crate::io::prompt::{PromptEngine, SandboxBrief};
use crate::io::sandbox::Sandbox;

/// Everything one steward invocation shares across steps.
pub struct Session {
    pub paths: StewardPaths,
    pub config: StewardConfig,
    pub id: SessionId,
    pub recorder: AuditRecorder,
    pub store: ContentStore,
    pub sandbox: Sandbox,
    pub prompts: PromptEngine,
}

impl Session {
    /// Open a session on an initialized project. `echo` mirrors the
    /// transcript to the console.
    pub fn open(root: &Path, echo: bool) -> Result<Self> {
        let (paths, config) = open_project(root)?;
        let id = SessionId::generate();
        let recorder = AuditRecorder::open(&paths, &id, echo)?;
        let store = ContentStore::new(&paths.root, paths.staging_root(&config));
        let sandbox = Sandbox::new(&paths.root, &config.sandbox)?;
        info!(session = %id, root = %root.display(), "session opened");
        Ok(Self {
            paths,
            config,
            id,
            recorder,
            store,
            sandbox,
            prompts: PromptEngine::new(),
        })
    }

    pub fn sandbox_brief(&self) -> SandboxBrief {
        SandboxBrief {
            sandbox_root: self.config.sandbox.root.clone(),
            script_types: self.config.sandbox.interpreters.keys().cloned().collect(),
            timeout_secs: self.config.sandbox.timeout_secs,
            max_loops: self.config.max_loops,
        }
    }

    /// Steward-owned directories that never feed the project context.
    pub fn excluded_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.paths.staging_root(&self.config),
            self.paths.ledger_dir.clone(),
            self.paths.sessions_dir.clone(),
            self.paths.manifests_dir.clone(),
            self.paths.steward_dir.clone(),
        ]
    }

    /// Write this session's manifest; `None` if it could not be stored.
    pub fn write_manifest(&mut self) -> Result<Option<PathBuf>> {
        let manifest_path = self.paths.manifest_path(&self.id);
        self.store
            .write_manifest(&self.id, &manifest_path, &self.recorder)
    }
}
