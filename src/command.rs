//! Shell-command tasks and engines.
//!
//! Plan tasks and remediation engines both run `sh -c <command>`. A
//! non-zero exit fails the task with the tail of stderr. A started command
//! runs to exit even if the run is cancelled; the child is killed only when
//! its task times out.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::core::{handler_fn, TaskContext, TaskHandler};
use crate::orchestration::Engine;

/// Trailing stderr lines kept in a failure message.
const STDERR_TAIL_LINES: usize = 20;

/// A shell command with its working directory and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub command: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Task handler running this command.
    pub fn into_handler(self) -> TaskHandler {
        handler_fn(move |ctx: TaskContext| {
            let command = self.clone();
            async move { command.run(&ctx, &command.command).await }
        })
    }

    /// Run `script` (usually `self.command` after substitution) under `ctx`.
    pub async fn run(&self, ctx: &TaskContext, script: &str) -> anyhow::Result<Value> {
        debug!(task = %ctx.task_id, command = script, "ShellCommand::run");
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .env("WAVEGATE_RUN_ID", ctx.run_id.to_string())
            .env("WAVEGATE_PHASE", &ctx.phase)
            .env("WAVEGATE_TASK_ID", ctx.task_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{script}`"))?;

        // Run cancellation does not interrupt a started command; only the
        // executor's timeout aborts it, and dropping the child kills it.
        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("failed to wait for `{script}`"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let stderr = tail(&stderr, STDERR_TAIL_LINES);
            if stderr.is_empty() {
                bail!("`{script}` exited with {code}");
            }
            bail!("`{script}` exited with {code}: {stderr}");
        }

        Ok(json!({
            "exitCode": output.status.code(),
            "stdout": stdout.trim(),
        }))
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Remediation engine for one stage, running a command template.
///
/// `{entity}` and `{stage}` in the template are replaced from the task
/// params before the command runs.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    stage: String,
    template: ShellCommand,
}

impl CommandEngine {
    pub const VERSION: &'static str = "command";

    pub fn new(stage: impl Into<String>, template: ShellCommand) -> Self {
        Self {
            stage: stage.into(),
            template,
        }
    }

    pub fn render(&self, ctx: &TaskContext) -> String {
        let entity = ctx.param("entity").unwrap_or_default();
        let stage = ctx.param("stage").unwrap_or(&self.stage);
        self.template
            .command
            .replace("{entity}", entity)
            .replace("{stage}", stage)
    }
}

#[async_trait]
impl Engine for CommandEngine {
    fn name(&self) -> &str {
        &self.stage
    }

    fn version(&self) -> &str {
        Self::VERSION
    }

    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        let script = self.render(&ctx);
        self.template.run(&ctx, &script).await
    }
}
