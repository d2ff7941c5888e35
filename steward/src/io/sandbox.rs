//! Sandboxed script executor.
//!
//! A script may run only if it canonicalizes to a regular file strictly
//! inside the sandbox root and its extension maps to a configured
//! interpreter. The child is spawned directly from an argument vector (no
//! shell), with a cleared environment, null stdin, the project root as its
//! working directory and a hard wall-clock timeout.
//!
//! Script paths are taken relative to the sandbox root. A path that starts
//! with the sandbox root's own project-relative prefix (for example
//! `workbench/scripts/check.py`) has that prefix stripped once first, so
//! both the bare and the fully-qualified spelling name the same file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use super::audit::{AuditRecorder, LedgerEvent};
use super::config::SandboxConfig;
use super::process::run_command_with_timeout;
use crate::core::execution::{BlockReason, ExecutionOutcome, ExecutionRecord, ExecutionStatus};
use crate::core::ids::StepId;
use crate::core::path::{display_slash, escapes_lexically};
use crate::core::types::{ActionKind, Actor};

/// Environment variables passed through to scripts.
const PASSTHROUGH_ENV: [&str; 3] = ["PATH", "HOME", "LANG"];

/// A script that passed every precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScript {
    /// Canonical absolute path.
    pub path: PathBuf,
    /// Project-relative, `/`-separated.
    pub display: String,
    pub interpreter: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    project_root: PathBuf,
    root: PathBuf,
    root_prefix: String,
    interpreters: BTreeMap<String, Vec<String>>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl Sandbox {
    /// Build a sandbox rooted at `config.root` under `project_root`,
    /// creating the directory if needed.
    pub fn new(project_root: &Path, config: &SandboxConfig) -> Result<Self> {
        let project_root = project_root
            .canonicalize()
            .with_context(|| format!("canonicalize project root {}", project_root.display()))?;
        let configured = project_root.join(&config.root);
        fs::create_dir_all(&configured)
            .with_context(|| format!("create sandbox root {}", configured.display()))?;
        let root = configured
            .canonicalize()
            .with_context(|| format!("canonicalize sandbox root {}", configured.display()))?;
        Ok(Self {
            project_root,
            root,
            root_prefix: normalize_separators(&config.root)
                .trim_matches('/')
                .to_string(),
            interpreters: config.interpreters.clone(),
            timeout: config.timeout(),
            output_limit_bytes: config.output_limit_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check every precondition, in order, without side effects.
    pub fn resolve(&self, raw: &str) -> Result<ResolvedScript, BlockReason> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(BlockReason::EmptyPath);
        }
        if trimmed.starts_with('/') || trimmed.starts_with('\\') || Path::new(trimmed).is_absolute()
        {
            return Err(BlockReason::AbsolutePath(trimmed.to_string()));
        }

        let relative = self.strip_root_prefix(trimmed);
        if escapes_lexically(&relative) {
            return Err(BlockReason::OutsideSandbox(trimmed.to_string()));
        }

        let canonical = self
            .root
            .join(&relative)
            .canonicalize()
            .map_err(|_| BlockReason::NotFound(trimmed.to_string()))?;
        // Component-wise containment on the resolved path catches symlinks.
        if canonical == self.root || !canonical.starts_with(&self.root) {
            return Err(BlockReason::OutsideSandbox(trimmed.to_string()));
        }
        if !canonical.is_file() {
            return Err(BlockReason::NotAFile(trimmed.to_string()));
        }

        let interpreter = canonical
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.interpreters.get(ext))
            .filter(|argv| !argv.is_empty())
            .cloned()
            .ok_or_else(|| BlockReason::UnsupportedScriptType(trimmed.to_string()))?;

        let display = canonical
            .strip_prefix(&self.project_root)
            .map(display_slash)
            .unwrap_or_else(|_| canonical.display().to_string());
        Ok(ResolvedScript {
            path: canonical,
            display,
            interpreter,
        })
    }

    /// Resolve `raw`, logging an `execution_blocked` event on rejection.
    ///
    /// The outer `Result` only fails when the ledger cannot be written.
    pub fn authorize(
        &self,
        raw: &str,
        step: Option<&StepId>,
        recorder: &AuditRecorder,
    ) -> Result<Result<ResolvedScript, BlockReason>> {
        match self.resolve(raw) {
            Ok(script) => Ok(Ok(script)),
            Err(reason) => {
                recorder.log_execution_blocked(step, raw, &reason)?;
                Ok(Err(reason))
            }
        }
    }

    /// Run an authorized script and log a `script_executed` event.
    ///
    /// A script that cannot be started counts as a failed run; its error is
    /// reported in `stderr` so the model can react to it.
    #[instrument(skip_all, fields(script = %script.display))]
    pub fn run(
        &self,
        script: &ResolvedScript,
        args: &[String],
        step: Option<&StepId>,
        recorder: &AuditRecorder,
    ) -> Result<ExecutionOutcome> {
        let mut cmd = Command::new(&script.interpreter[0]);
        cmd.args(&script.interpreter[1..])
            .arg(&script.path)
            .args(args)
            .current_dir(&self.project_root)
            .env_clear();
        for key in PASSTHROUGH_ENV {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }

        let record = match run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
        {
            Ok(output) => {
                let status = if output.timed_out {
                    ExecutionStatus::Timeout
                } else if output.status.success() {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Failure
                };
                ExecutionRecord {
                    script: script.display.clone(),
                    args: args.to_vec(),
                    status,
                    exit_code: if output.timed_out {
                        None
                    } else {
                        output.status.code()
                    },
                    stdout: output.stdout_lossy(),
                    stderr: output.stderr_lossy(),
                    duration_ms: output.elapsed.as_millis() as u64,
                    truncated: output.truncated(),
                }
            }
            Err(err) => {
                warn!(err = %err, "script could not be started");
                ExecutionRecord {
                    script: script.display.clone(),
                    args: args.to_vec(),
                    status: ExecutionStatus::Failure,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("{err:#}"),
                    duration_ms: 0,
                    truncated: false,
                }
            }
        };

        info!(status = ?record.status, exit_code = ?record.exit_code, duration_ms = record.duration_ms, "script finished");
        let mut event = LedgerEvent::new(Actor::Orchestrator, ActionKind::ScriptExecuted)
            .artifact(record.script.clone())
            .detail(format!(
                "status={:?} exit_code={} duration_ms={} truncated={}",
                record.status,
                record.reported_exit_code(),
                record.duration_ms,
                record.truncated
            ));
        if let Some(step) = step {
            event = event.step(step);
        }
        recorder.log_event(event)?;
        Ok(ExecutionOutcome::from_record(record))
    }

    /// Authorize and run in one call.
    pub fn execute(
        &self,
        raw: &str,
        args: &[String],
        step: Option<&StepId>,
        recorder: &AuditRecorder,
    ) -> Result<ExecutionOutcome> {
        match self.authorize(raw, step, recorder)? {
            Ok(script) => self.run(&script, args, step, recorder),
            Err(reason) => Ok(ExecutionOutcome::Blocked(reason)),
        }
    }

    fn strip_root_prefix(&self, raw: &str) -> String {
        let normalized = normalize_separators(raw);
        let normalized = normalized.trim_start_matches("./");
        if !self.root_prefix.is_empty()
            && let Some(rest) = normalized
                .strip_prefix(self.root_prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
        {
            return rest.to_string();
        }
        normalized.to_string()
    }
}

fn normalize_separators(raw: &str) -> String {
    raw.replace('\\', "/")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::ids::SessionId;
    use crate::io::audit::read_jsonl;
    use crate::io::init::{StewardPaths, init_project};

    struct Fixture {
        temp: tempfile::TempDir,
        paths: StewardPaths,
        recorder: AuditRecorder,
        sandbox: Sandbox,
    }

    fn fixture(timeout_secs: u64) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), false).expect("init");
        let recorder =
            AuditRecorder::open(&paths, &SessionId::generate(), false).expect("recorder");
        let mut config = SandboxConfig {
            timeout_secs,
            output_limit_bytes: 1024,
            ..SandboxConfig::default()
        };
        config
            .interpreters
            .insert("sh".to_string(), vec!["sh".to_string()]);
        let sandbox = Sandbox::new(temp.path(), &config).expect("sandbox");
        Fixture {
            temp,
            paths,
            recorder,
            sandbox,
        }
    }

    fn write_script(fx: &Fixture, name: &str, body: &str) {
        let path = fx.sandbox.root().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("script dir");
        }
        fs::write(path, body).expect("write script");
    }

    fn blocked(fx: &Fixture, raw: &str) -> BlockReason {
        match fx.sandbox.execute(raw, &[], None, &fx.recorder).expect("execute") {
            ExecutionOutcome::Blocked(reason) => reason,
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn runs_script_with_args_from_project_root() {
        let fx = fixture(5);
        write_script(&fx, "hello.sh", "echo \"hi $1\"; pwd; echo warn >&2\n");

        let outcome = fx
            .sandbox
            .execute("hello.sh", &["there".to_string()], None, &fx.recorder)
            .expect("execute");

        let ExecutionOutcome::Completed(record) = outcome else {
            panic!("expected completion");
        };
        let cwd = fx.temp.path().canonicalize().expect("canonical");
        assert_eq!(record.stdout, format!("hi there\n{}\n", cwd.display()));
        assert_eq!(record.stderr, "warn\n");
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.script, "workbench/scripts/hello.sh");

        let (events, _) = read_jsonl::<LedgerEvent>(&fx.paths.events_path).expect("events");
        assert_eq!(events.last().map(|e| e.action_type), Some(ActionKind::ScriptExecuted));
    }

    #[test]
    fn nonzero_exit_is_failure_not_block() {
        let fx = fixture(5);
        write_script(&fx, "fail.sh", "exit 7\n");
        let outcome = fx
            .sandbox
            .execute("fail.sh", &[], None, &fx.recorder)
            .expect("execute");
        let ExecutionOutcome::Failed(record) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(record.exit_code, Some(7));
    }

    #[test]
    fn timeout_kills_script() {
        let fx = fixture(1);
        write_script(&fx, "slow.sh", "exec sleep 10\n");
        let outcome = fx
            .sandbox
            .execute("slow.sh", &[], None, &fx.recorder)
            .expect("execute");
        let ExecutionOutcome::TimedOut(record) = outcome else {
            panic!("expected timeout");
        };
        assert_eq!(record.status, ExecutionStatus::Timeout);
        assert_eq!(record.reported_exit_code(), 124);
    }

    #[test]
    fn traversal_and_absolute_paths_are_blocked() {
        let fx = fixture(5);
        assert!(matches!(
            blocked(&fx, "../../etc/passwd"),
            BlockReason::OutsideSandbox(_)
        ));
        assert!(matches!(
            blocked(&fx, "sub/../../../x.sh"),
            BlockReason::OutsideSandbox(_)
        ));
        assert!(matches!(
            blocked(&fx, "/etc/passwd"),
            BlockReason::AbsolutePath(_)
        ));
        assert_eq!(blocked(&fx, "  "), BlockReason::EmptyPath);

        let (events, _) = read_jsonl::<LedgerEvent>(&fx.paths.events_path).expect("events");
        let blocked_events = events
            .iter()
            .filter(|e| e.action_type == ActionKind::ExecutionBlocked)
            .count();
        assert_eq!(blocked_events, 4);
    }

    #[test]
    fn symlink_out_of_sandbox_is_blocked() {
        let fx = fixture(5);
        let outside = fx.temp.path().join("outside.sh");
        fs::write(&outside, "echo pwned\n").expect("write outside");
        std::os::unix::fs::symlink(&outside, fx.sandbox.root().join("link.sh"))
            .expect("symlink");

        assert!(matches!(
            blocked(&fx, "link.sh"),
            BlockReason::OutsideSandbox(_)
        ));
    }

    #[test]
    fn missing_directory_and_unknown_type_are_blocked() {
        let fx = fixture(5);
        fs::create_dir_all(fx.sandbox.root().join("dir.sh")).expect("dir");
        write_script(&fx, "notes.txt", "hello");

        assert!(matches!(blocked(&fx, "nope.sh"), BlockReason::NotFound(_)));
        assert!(matches!(blocked(&fx, "dir.sh"), BlockReason::NotAFile(_)));
        assert!(matches!(
            blocked(&fx, "notes.txt"),
            BlockReason::UnsupportedScriptType(_)
        ));
    }

    #[test]
    fn prefixed_and_bare_paths_resolve_identically() {
        let fx = fixture(5);
        write_script(&fx, "tools/check.sh", "true\n");

        let bare = fx.sandbox.resolve("tools/check.sh").expect("bare");
        let prefixed = fx
            .sandbox
            .resolve("workbench/scripts/tools/check.sh")
            .expect("prefixed");
        let dotted = fx
            .sandbox
            .resolve("./workbench/scripts/tools/check.sh")
            .expect("dotted");
        assert_eq!(bare, prefixed);
        assert_eq!(bare, dotted);
    }
}
