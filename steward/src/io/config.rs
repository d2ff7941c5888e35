//! Steward configuration stored under `.steward/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Steward configuration (TOML).
///
/// Meant to be edited by hand. Every field has a default so a partial file,
/// or no file at all, is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StewardConfig {
    /// Upper bound on model calls (and chained executions) per step.
    pub max_loops: u32,

    /// Project-relative root under which each step stages its artifacts.
    pub staging_dir: String,

    pub sandbox: SandboxConfig,
    pub model: ModelConfig,
    pub context: ContextConfig,
    pub pricing: PricingConfig,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Project-relative directory that every executed script must live in.
    pub root: String,
    pub timeout_secs: u64,
    /// Per-stream capture limit for script stdout/stderr.
    pub output_limit_bytes: usize,
    /// Script extension -> argv prefix used to launch it.
    pub interpreters: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Bridge command (argv) that talks to the model service.
    pub command: Vec<String>,
    pub alias: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub spec_dirs: Vec<String>,
    pub doc_dirs: Vec<String>,
    pub code_dirs: Vec<String>,
    pub code_extensions: Vec<String>,
    pub budget_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    /// Cost per one million input tokens.
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub push: bool,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            max_loops: 5,
            staging_dir: "artifacts".to_string(),
            sandbox: SandboxConfig::default(),
            model: ModelConfig::default(),
            context: ContextConfig::default(),
            pricing: PricingConfig::default(),
            git: GitConfig::default(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut interpreters = BTreeMap::new();
        interpreters.insert("py".to_string(), vec!["python3".to_string()]);
        Self {
            root: "workbench/scripts".to_string(),
            timeout_secs: 60,
            output_limit_bytes: 64 * 1024,
            interpreters,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: vec!["steward-model".to_string()],
            alias: "gpt-4o".to_string(),
            timeout_secs: 300,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            spec_dirs: vec!["specs".to_string()],
            doc_dirs: vec!["impl-docs".to_string()],
            code_dirs: vec!["src".to_string()],
            code_extensions: ["rs", "py", "toml"].map(String::from).to_vec(),
            budget_bytes: 200_000,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl StewardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_loops == 0 {
            return Err(anyhow!("max_loops must be > 0"));
        }
        if self.staging_dir.trim().is_empty() {
            return Err(anyhow!("staging_dir must not be empty"));
        }
        if self.sandbox.root.trim().is_empty() {
            return Err(anyhow!("sandbox.root must not be empty"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        for (ext, argv) in &self.sandbox.interpreters {
            if argv.is_empty() || argv[0].trim().is_empty() {
                return Err(anyhow!(
                    "sandbox.interpreters.{ext} must be a non-empty array"
                ));
            }
        }
        if self.model.command.is_empty() || self.model.command[0].trim().is_empty() {
            return Err(anyhow!("model.command must be a non-empty array"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.output_limit_bytes == 0 {
            return Err(anyhow!("model.output_limit_bytes must be > 0"));
        }
        if self.pricing.input_per_1m < 0.0 || self.pricing.output_per_1m < 0.0 {
            return Err(anyhow!("pricing rates must be >= 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StewardConfig::default()`.
pub fn load_config(path: &Path) -> Result<StewardConfig> {
    if !path.exists() {
        let cfg = StewardConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: StewardConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &StewardConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, StewardConfig::default());
        assert_eq!(cfg.max_loops, 5);
        assert_eq!(cfg.sandbox.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".steward").join("config.toml");
        let mut cfg = StewardConfig::default();
        cfg.sandbox
            .interpreters
            .insert("sh".to_string(), vec!["sh".to_string()]);
        cfg.pricing.input_per_1m = 2.5;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_loops = 2\n[sandbox]\ntimeout_secs = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_loops, 2);
        assert_eq!(cfg.sandbox.timeout_secs, 5);
        assert_eq!(cfg.sandbox.root, "workbench/scripts");
        assert_eq!(cfg.model, ModelConfig::default());
    }

    #[test]
    fn rejects_zero_loop_bound() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_loops = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_loops"));
    }
}
