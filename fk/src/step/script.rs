//! Script step executor
//!
//! Runs a local command, captures exit code and output, and fails the
//! step on a nonzero exit. The command is killed on cancellation or when
//! the configured timeout expires.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::StepError;
use super::traits::{StepExecutor, StepResult};
use crate::context::ExecutionContext;
use crate::domain::Step;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct ScriptConfig {
    command: String,
    args: Vec<String>,
    timeout_ms: u64,
    working_dir: Option<String>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            timeout_ms: 30_000,
            working_dir: None,
        }
    }
}

/// Executor for `script` steps
pub struct ScriptExecutor;

#[async_trait]
impl StepExecutor for ScriptExecutor {
    fn type_name(&self) -> &'static str {
        "script"
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let config: ScriptConfig = serde_json::from_value(step.config.clone())
            .map_err(|e| StepError::invalid_config(e.to_string()))?;
        if config.command.is_empty() {
            return Err(StepError::invalid_config("command is required"));
        }

        let command = ctx.interpolate(&config.command);
        let args: Vec<String> = config.args.iter().map(|a| ctx.interpolate(a)).collect();

        let mut cmd = Command::new(&command);
        cmd.args(&args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(ctx.interpolate(dir));
        }
        cmd.kill_on_drop(true);

        debug!(step_id = %step.id, %command, "running script step");
        let start = Instant::now();
        let child = cmd.spawn()?;

        let output = tokio::select! {
            result = child.wait_with_output() => result?,
            () = cancel.cancelled() => return Err(StepError::Cancelled),
            () = tokio::time::sleep(Duration::from_millis(config.timeout_ms)) => {
                return Err(StepError::TimedOut { ms: config.timeout_ms });
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        let result = serde_json::json!({
            "exit-code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "duration-ms": duration_ms,
        });

        if output.status.success() {
            Ok(StepResult::success(result))
        } else {
            let mut failed = StepResult::failure(format!("{command} exited with code {exit_code}"));
            failed.output = result;
            Ok(failed)
        }
    }
}
