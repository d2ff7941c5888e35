//! Test-only doubles: a scripted model and a throwaway steward project.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::types::TokenUsage;
use crate::io::audit::{LedgerEvent, Transaction, read_jsonl};
use crate::io::config::{StewardConfig, load_config, write_config};
use crate::io::init::{StewardPaths, init_project};
use crate::io::model::{ModelClient, ModelReply, ModelRequest};
use crate::session::Session;

/// Replays queued replies in order and remembers every request.
///
/// An exhausted queue is a transport failure, so a test that expects fewer
/// calls than it scripted still fails loudly on the extra one.
#[derive(Default)]
pub struct ScriptedModelClient {
    replies: RefCell<VecDeque<Result<ModelReply, String>>>,
    requests: RefCell<Vec<ModelRequest>>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply with a fixed 100/50 token usage.
    pub fn reply(self, content: impl Into<String>) -> Self {
        self.replies.borrow_mut().push_back(Ok(ModelReply {
            content: content.into(),
            usage: TokenUsage::new(100, 50),
        }));
        self
    }

    /// Queue a transport failure.
    pub fn fail(self, message: impl Into<String>) -> Self {
        self.replies.borrow_mut().push_back(Err(message.into()));
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.borrow().clone()
    }
}

impl ModelClient for ScriptedModelClient {
    fn complete(&self, request: &ModelRequest) -> Result<ModelReply> {
        self.requests.borrow_mut().push(request.clone());
        match self.replies.borrow_mut().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted model has no reply left")),
        }
    }
}

/// Build a response document the way the model is told to answer.
pub fn response_json(
    thought: &str,
    artifacts: &[(&str, &str)],
    next_action: Option<(&str, &str)>,
) -> String {
    let artifacts: Vec<Value> = artifacts
        .iter()
        .map(|(path, content)| json!({"path": path, "operation": "create", "content": content}))
        .collect();
    let next_action = next_action.map_or(Value::Null, |(script, continuation)| {
        json!({
            "type": "exec_and_chain",
            "target_script": script,
            "continuation_prompt": continuation,
        })
    });
    json!({
        "thought_process": thought,
        "artifacts": artifacts,
        "next_action": next_action,
    })
    .to_string()
}

/// An initialized project in a temp dir, configured to run `.sh` scripts.
pub struct TestProject {
    _dir: TempDir,
    pub paths: StewardPaths,
}

impl TestProject {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Start from the test config and let `edit` adjust it.
    pub fn with_config(edit: impl FnOnce(&mut StewardConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = init_project(dir.path(), false).expect("init project");
        let mut config = load_config(&paths.config_path).expect("load config");
        config
            .sandbox
            .interpreters
            .insert("sh".to_string(), vec!["sh".to_string()]);
        config.sandbox.timeout_secs = 5;
        edit(&mut config);
        write_config(&paths.config_path, &config).expect("write config");
        fs::create_dir_all(paths.sandbox_root(&config)).expect("sandbox root");
        Self { _dir: dir, paths }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn config(&self) -> StewardConfig {
        load_config(&self.paths.config_path).expect("load config")
    }

    pub fn session(&self) -> Session {
        Session::open(self.root(), false).expect("open session")
    }

    /// Write a script into the sandbox root and return its sandbox-relative
    /// name.
    pub fn write_script(&self, name: &str, body: &str) -> String {
        let path = self.paths.sandbox_root(&self.config()).join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("script dir");
        }
        fs::write(&path, body).expect("write script");
        name.to_string()
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parent dir");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.root().join(rel)).ok()
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        read_jsonl(&self.paths.events_path).expect("read events").0
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        read_jsonl(&self.paths.audit_log_path)
            .expect("read transactions")
            .0
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
