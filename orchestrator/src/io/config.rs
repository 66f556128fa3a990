//! Engine configuration stored under `<state_dir>/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;

/// Orchestrator configuration (TOML).
///
/// Edited by operators; missing fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retry bounds for executor and validation failures.
    pub retry: RetryPolicy,

    pub executors: ExecutorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorsConfig {
    pub agent: CommandConfig,
    pub skill: CommandConfig,
}

/// External command backing one task kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    /// Argv of the command; empty means the kind has no command executor.
    pub command: Vec<String>,

    /// Wall-clock budget per attempt in seconds.
    pub timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for ExecutorsConfig {
    fn default() -> Self {
        Self {
            agent: CommandConfig {
                command: vec![
                    "codex".to_string(),
                    "exec".to_string(),
                    "--skip-git-repo-check".to_string(),
                    "-".to_string(),
                ],
                ..CommandConfig::default()
            },
            skill: CommandConfig::default(),
        }
    }
}

impl CommandConfig {
    fn validate(&self, label: &str) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(anyhow!("executors.{label}.timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("executors.{label}.output_limit_bytes must be > 0"));
        }
        if self.command.first().is_some_and(|program| program.trim().is_empty()) {
            return Err(anyhow!("executors.{label}.command must start with a program"));
        }
        Ok(())
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate().map_err(|msg| anyhow!(msg))?;
        self.executors.agent.validate("agent")?;
        self.executors.skill.validate("skill")?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
