//! Task executor abstraction and the command-backed executor.
//!
//! The [`TaskExecutor`] trait decouples the context from whatever performs a
//! task: an in-process Rust closure, or an external command for `agent` and
//! `skill` tasks. Tests use scripted executors that return predetermined
//! outputs without spawning processes.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::json_extract::{decode_text, extract_first_json};
use crate::core::task::{TaskDefinition, TaskPayload};
use crate::core::types::{EffectId, RunId};
use crate::io::config::CommandConfig;
use crate::io::paths::EffectPaths;
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::prompt::PromptRenderer;

/// One attempt at executing a task effect.
#[derive(Debug, Clone, Copy)]
pub struct TaskRequest<'a> {
    pub run_id: &'a RunId,
    pub effect_id: &'a EffectId,
    pub task: &'a TaskDefinition,
    pub payload: &'a TaskPayload,
    /// 1-based attempt number within the current attempt budget.
    pub attempt: u32,
    /// Artifact directory of the effect, when the journal is filesystem-backed.
    pub artifacts: Option<&'a EffectPaths>,
}

/// Performs the work behind a task and returns its raw JSON output.
///
/// Output is validated against the task's schema by the caller, never here.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, request: &TaskRequest<'_>) -> Result<Value>;
}

impl<F> TaskExecutor for F
where
    F: Fn(&TaskRequest<'_>) -> Result<Value> + Send + Sync,
{
    fn execute(&self, request: &TaskRequest<'_>) -> Result<Value> {
        self(request)
    }
}

/// Executor that spawns a configured command per attempt.
///
/// The command receives the rendered prompt (agent tasks) or the payload JSON
/// (other kinds) on stdin, plus these environment variables:
/// `ORCHESTRATOR_INPUT`, `ORCHESTRATOR_RESULT`, `ORCHESTRATOR_RUN_ID` and
/// `ORCHESTRATOR_EFFECT_ID`. The result is read from `result.json` when the
/// command wrote one, otherwise from the first JSON value on stdout.
pub struct CommandExecutor {
    config: CommandConfig,
    prompts: PromptRenderer,
}

impl CommandExecutor {
    pub fn new(config: CommandConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("command executor needs a non-empty command"));
        }
        Ok(Self {
            config,
            prompts: PromptRenderer::new()?,
        })
    }

    fn stdin_for(&self, request: &TaskRequest<'_>, artifacts: &EffectPaths) -> Result<Vec<u8>> {
        match request.payload {
            TaskPayload::Agent(invocation) => {
                let prompt = self
                    .prompts
                    .render_agent(invocation, Some(&artifacts.result_path))?;
                fs::write(&artifacts.prompt_path, &prompt)
                    .with_context(|| format!("write prompt {}", artifacts.prompt_path.display()))?;
                Ok(prompt.into_bytes())
            }
            payload => {
                let mut buf = serde_json::to_vec_pretty(payload).context("serialize payload")?;
                buf.push(b'\n');
                Ok(buf)
            }
        }
    }
}

impl TaskExecutor for CommandExecutor {
    #[instrument(skip_all, fields(task = %request.task.name, effect_id = %request.effect_id, attempt = request.attempt))]
    fn execute(&self, request: &TaskRequest<'_>) -> Result<Value> {
        let artifacts = request.artifacts.ok_or_else(|| {
            anyhow!(
                "task '{}' uses a command executor, which needs a filesystem journal",
                request.task.name
            )
        })?;
        fs::create_dir_all(&artifacts.dir)
            .with_context(|| format!("create effect dir {}", artifacts.dir.display()))?;
        if artifacts.result_path.exists() {
            debug!(path = %artifacts.result_path.display(), "removing stale result");
            fs::remove_file(&artifacts.result_path)
                .with_context(|| format!("remove {}", artifacts.result_path.display()))?;
        }

        let stdin = self.stdin_for(request, artifacts)?;
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("command executor needs a non-empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&artifacts.dir)
            .env("ORCHESTRATOR_INPUT", &artifacts.input_path)
            .env("ORCHESTRATOR_RESULT", &artifacts.result_path)
            .env("ORCHESTRATOR_RUN_ID", request.run_id.as_str())
            .env("ORCHESTRATOR_EFFECT_ID", request.effect_id.as_str());

        info!(program = %program, "starting executor command");
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output =
            run_command_with_timeout(cmd, Some(&stdin), timeout, self.config.output_limit_bytes)
                .with_context(|| format!("run executor command '{program}'"))?;
        write_executor_log(
            &artifacts.executor_log_path,
            &output,
            self.config.output_limit_bytes,
        )?;

        if output.timed_out {
            warn!(timeout_secs = self.config.timeout_secs, "executor command timed out");
            return Err(anyhow!("executor command timed out after {timeout:?}"));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "executor command failed");
            return Err(anyhow!(
                "executor command failed with status {:?}: {}",
                output.status.code(),
                tail(&decode_text(&output.stderr), 400)
            ));
        }

        if artifacts.result_path.exists() {
            debug!("reading result.json");
            return read_result(&artifacts.result_path);
        }
        extract_first_json(&decode_text(&output.stdout))
            .ok_or_else(|| anyhow!("executor command produced no JSON result"))
    }
}

fn read_result(path: &Path) -> Result<Value> {
    let raw = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(decode_text(&raw).trim()).with_context(|| format!("parse {}", path.display()))
}

fn tail(text: &str, max_chars: usize) -> &str {
    let text = text.trim();
    match text.char_indices().rev().nth(max_chars) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

fn write_executor_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create executor log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.truncated_notice("stdout"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.truncated_notice("stderr"));
    if output.timed_out {
        buf.push_str("\n[executor timed out]\n");
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = buf.len() - cut;
        buf.truncate(cut);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }

    fs::write(path, buf).with_context(|| format!("write executor log {}", path.display()))
}
