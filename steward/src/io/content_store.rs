//! Step-scoped artifact staging and session manifests.
//!
//! Accepted artifacts are written below `<staging-root>/<step-id>/`, never
//! into the versioned tree. Each write is hashed from the bytes written and
//! recorded as a `file_write` event. A failed write is logged and skipped;
//! the rest of the step carries on.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::audit::{AuditRecorder, LedgerEvent, timestamp_utc};
use crate::core::ids::{SessionId, StepId};
use crate::core::path::display_slash;
use crate::core::response::ProposedArtifact;
use crate::core::types::{ActionKind, Actor};

/// A staged file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Destination relative to the project root.
    pub path: PathBuf,
    pub staged_path: PathBuf,
    /// Staged location relative to the project root, `/`-separated.
    pub staged_ref: String,
    pub sha256: String,
    pub step_id: StepId,
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub session_id: String,
    pub timestamp: String,
    pub artifacts: Vec<ManifestEntry>,
}

pub struct ContentStore {
    project_root: PathBuf,
    staging_root: PathBuf,
    /// Staged refs written this session, in write order.
    written: Vec<(String, PathBuf)>,
}

impl ContentStore {
    pub fn new(project_root: impl Into<PathBuf>, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            staging_root: staging_root.into(),
            written: Vec::new(),
        }
    }

    pub fn step_dir(&self, step: &StepId) -> PathBuf {
        self.staging_root.join(step.as_str())
    }

    /// Stage every proposed artifact for `step`, skipping ones that fail.
    ///
    /// Only ledger write errors are returned.
    pub fn stage(
        &mut self,
        step: &StepId,
        iteration: u32,
        exchange_ref: Option<&str>,
        proposed: &[ProposedArtifact],
        recorder: &AuditRecorder,
    ) -> Result<Vec<Artifact>> {
        let step_dir = self.step_dir(step);
        let mut staged = Vec::with_capacity(proposed.len());
        for artifact in proposed {
            let staged_path = step_dir.join(&artifact.path);
            let staged_ref = self.project_ref(&staged_path);
            match write_staged(&staged_path, artifact.content.as_bytes()) {
                Ok(()) => {
                    let digest = sha256_hex(artifact.content.as_bytes());
                    recorder.log_event(
                        LedgerEvent::new(Actor::Orchestrator, ActionKind::FileWrite)
                            .artifact(staged_ref.clone())
                            .exchange(exchange_ref)
                            .step(step)
                            .sha256(digest.clone())
                            .detail(format!(
                                "destination {}, iteration {iteration}",
                                display_slash(&artifact.path)
                            )),
                    )?;
                    debug!(path = %staged_ref, "staged artifact");
                    self.written.push((staged_ref.clone(), staged_path.clone()));
                    staged.push(Artifact {
                        path: artifact.path.clone(),
                        staged_path,
                        staged_ref,
                        sha256: digest,
                        step_id: step.clone(),
                        iteration,
                    });
                }
                Err(err) => {
                    warn!(path = %staged_ref, err = %err, "artifact write failed, skipping");
                    recorder.log_storage_failure(&staged_ref, Some(step), &err)?;
                }
            }
        }
        Ok(staged)
    }

    /// Write the end-of-session manifest and reset tracking.
    ///
    /// Digests are recomputed from disk; files that vanished are left out.
    /// Returns `None` when the manifest itself could not be stored.
    pub fn write_manifest(
        &mut self,
        session: &SessionId,
        manifest_path: &Path,
        recorder: &AuditRecorder,
    ) -> Result<Option<PathBuf>> {
        let mut entries: Vec<ManifestEntry> = Vec::new();
        for (staged_ref, staged_path) in std::mem::take(&mut self.written) {
            if entries.iter().any(|entry| entry.path == staged_ref) {
                continue;
            }
            match file_sha256(staged_path.as_path()) {
                Ok(Some(sha256)) => entries.push(ManifestEntry {
                    path: staged_ref,
                    sha256,
                }),
                Ok(None) => debug!(path = %staged_ref, "tracked file missing, skipped"),
                Err(err) => {
                    warn!(path = %staged_ref, err = %err, "cannot hash tracked file");
                    recorder.log_storage_failure(&staged_ref, None, &err)?;
                }
            }
        }

        let manifest = Manifest {
            session_id: session.to_string(),
            timestamp: timestamp_utc(),
            artifacts: entries,
        };
        let manifest_ref = self.project_ref(manifest_path);
        if let Err(err) = write_json_atomic(manifest_path, &manifest) {
            warn!(path = %manifest_ref, err = %err, "manifest write failed");
            recorder.log_storage_failure(&manifest_ref, None, &err)?;
            return Ok(None);
        }
        recorder.log_event(
            LedgerEvent::new(Actor::Orchestrator, ActionKind::ManifestWritten)
                .artifacts(manifest.artifacts.iter().map(|entry| entry.path.clone()))
                .detail(manifest_ref),
        )?;
        Ok(Some(manifest_path.to_path_buf()))
    }

    fn project_ref(&self, path: &Path) -> String {
        match path.strip_prefix(&self.project_root) {
            Ok(rel) => display_slash(rel),
            Err(_) => path.display().to_string(),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file, or `None` if it does not exist.
pub fn file_sha256(path: &Path) -> Result<Option<String>> {
    match fs::read(path) {
        Ok(contents) => Ok(Some(sha256_hex(&contents))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn write_staged(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create staging dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write artifact {}", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(value).context("serialize manifest")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))
}
