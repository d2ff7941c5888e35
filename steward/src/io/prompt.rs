//! Prompt assembly for model requests.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::execution::ExecutionRecord;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const USER_TEMPLATE: &str = include_str!("prompts/user.md");
const CONTINUATION_TEMPLATE: &str = include_str!("prompts/continuation.md");

/// A file the operator attached for this request only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub path: String,
    pub content: String,
}

/// Sandbox facts the system prompt advertises to the model.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxBrief {
    pub sandbox_root: String,
    pub script_types: Vec<String>,
    pub timeout_secs: u64,
    pub max_loops: u32,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("user", USER_TEMPLATE)
            .expect("user template should be valid");
        env.add_template("continuation", CONTINUATION_TEMPLATE)
            .expect("continuation template should be valid");
        Self { env }
    }

    pub fn render_system(&self, brief: &SandboxBrief) -> Result<String> {
        let template = self.env.get_template("system")?;
        let script_types = brief
            .script_types
            .iter()
            .map(|ext| format!("`.{ext}`"))
            .collect::<Vec<_>>();
        Ok(template.render(context! {
            sandbox_root => brief.sandbox_root.trim_end_matches('/'),
            script_types => script_types,
            timeout_secs => brief.timeout_secs,
            max_loops => brief.max_loops,
        })?)
    }

    /// First-turn prompt: instruction, attachments, then project context.
    pub fn render_user(
        &self,
        instruction: &str,
        attachments: &[Attachment],
        project_context: &str,
    ) -> Result<String> {
        let template = self.env.get_template("user")?;
        Ok(template.render(context! {
            instruction => instruction.trim(),
            attachments => attachments,
            context => (!project_context.trim().is_empty()).then(|| project_context.trim()),
        })?)
    }

    /// Follow-up prompt after a chained execution.
    pub fn render_continuation(
        &self,
        instruction: &str,
        continuation: &str,
        record: &ExecutionRecord,
        iteration: u32,
        max_loops: u32,
    ) -> Result<String> {
        let template = self.env.get_template("continuation")?;
        Ok(template.render(context! {
            instruction => instruction.trim(),
            continuation => continuation.trim(),
            record => record,
            exit_code => record.reported_exit_code(),
            iteration => iteration,
            max_loops => max_loops,
        })?)
    }
}
