//! Model client abstraction.
//!
//! The [`ModelClient`] trait decouples the Rebound loop from the actual model
//! service. Production talks to an external bridge command; tests use
//! scripted clients that return canned replies without spawning anything.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::config::ModelConfig;
use super::process::run_command_with_timeout;
use crate::core::types::TokenUsage;

/// One request to the model service; also the bridge's stdin payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub content: String,
    pub usage: TokenUsage,
}

pub trait ModelClient {
    /// Send one request. Any error is a transport failure.
    fn complete(&self, request: &ModelRequest) -> Result<ModelReply>;
}

/// Client that pipes each request through an external bridge command.
pub struct CommandModelClient {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandModelClient {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: config.timeout(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl ModelClient for CommandModelClient {
    #[instrument(skip_all, fields(model = %request.model, timeout_secs = self.timeout.as_secs()))]
    fn complete(&self, request: &ModelRequest) -> Result<ModelReply> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("model.command is empty"))?;
        let payload = serde_json::to_vec(request).context("serialize model request")?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        info!(program = %program, "calling model bridge");
        let output = run_command_with_timeout(
            cmd,
            Some(&payload),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run model bridge {program}"))?;

        if output.timed_out {
            warn!("model bridge timed out");
            return Err(anyhow!("model bridge timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(exit_code = ?output.status.code(), "model bridge failed");
            return Err(anyhow!(
                "model bridge failed with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "model reply exceeded {} bytes",
                self.output_limit_bytes
            ));
        }

        let reply = parse_bridge_output(&output.stdout_lossy());
        debug!(total_tokens = reply.usage.total_tokens, "model replied");
        Ok(reply)
    }
}

/// Interpret bridge stdout: a `{content, usage}` envelope, or plain text.
pub fn parse_bridge_output(stdout: &str) -> ModelReply {
    let envelope = serde_json::from_str::<Value>(stdout.trim()).ok();
    let content = envelope
        .as_ref()
        .and_then(|value| value.get("content"))
        .and_then(Value::as_str);
    match (content, envelope.as_ref()) {
        (Some(content), Some(value)) => ModelReply {
            content: content.to_string(),
            usage: value.get("usage").map(parse_usage).unwrap_or_default(),
        },
        _ => ModelReply {
            content: stdout.to_string(),
            usage: TokenUsage::default(),
        },
    }
}

fn parse_usage(usage: &Value) -> TokenUsage {
    let count = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| usage.get(*key).and_then(Value::as_u64))
    };
    let input = count(&["input_tokens", "prompt_tokens"]).unwrap_or(0);
    let output = count(&["output_tokens", "completion_tokens"]).unwrap_or(0);
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: count(&["total_tokens"]).unwrap_or(input + output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_with_openai_style_usage() {
        let stdout = json!({
            "content": "{\"thought_process\": \"\"}",
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        })
        .to_string();
        let reply = parse_bridge_output(&stdout);
        assert_eq!(reply.content, "{\"thought_process\": \"\"}");
        assert_eq!(reply.usage, TokenUsage::new(12, 3));
    }

    #[test]
    fn envelope_keeps_reported_total() {
        let stdout = r#"{"content": "x", "usage": {"input_tokens": 1, "output_tokens": 2, "total_tokens": 10}}"#;
        assert_eq!(parse_bridge_output(stdout).usage.total_tokens, 10);
    }

    #[test]
    fn plain_text_has_zero_usage() {
        let reply = parse_bridge_output("just text\n");
        assert_eq!(reply.content, "just text\n");
        assert_eq!(reply.usage, TokenUsage::default());

        // A bare response document is content, not an envelope.
        let raw = r#"{"thought_process": "t", "artifacts": []}"#;
        assert_eq!(parse_bridge_output(raw).content, raw);
    }

    #[cfg(unix)]
    #[test]
    fn bridge_command_receives_request_on_stdin() {
        let client = CommandModelClient {
            command: vec!["cat".to_string()],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        };
        let request = ModelRequest {
            model: "m".to_string(),
            system: "s".to_string(),
            user: "u".to_string(),
        };
        let reply = client.complete(&request).expect("complete");
        let echoed: ModelRequest = serde_json::from_str(&reply.content).expect("echoed request");
        assert_eq!(echoed, request);
    }

    #[cfg(unix)]
    #[test]
    fn failing_bridge_is_transport_error() {
        let client = CommandModelClient {
            command: vec!["false".to_string()],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 100,
        };
        let request = ModelRequest {
            model: "m".to_string(),
            system: String::new(),
            user: String::new(),
        };
        assert!(client.complete(&request).is_err());

        let missing = CommandModelClient {
            command: vec!["steward-no-such-bridge".to_string()],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 100,
        };
        assert!(missing.complete(&request).is_err());
    }
}
