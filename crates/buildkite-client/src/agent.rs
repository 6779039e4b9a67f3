//! `buildkite-agent` subprocess binding
//!
//! Every call runs the agent binary once, captures its output and enforces a
//! per-call timeout. The child is killed if the calling task is cancelled.

use crate::error::{BuildkiteError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};
use unblock_core::{AgentClient, StepState};

/// Default agent binary, resolved through `PATH`.
pub const AGENT_PROGRAM: &str = "buildkite-agent";

/// Upper bound on a single agent call.
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Control agent of the step running the gate
#[derive(Debug, Clone)]
pub struct BuildkiteAgent {
    program: PathBuf,
    timeout: Duration,
}

impl Default for BuildkiteAgent {
    fn default() -> Self {
        Self {
            program: PathBuf::from(AGENT_PROGRAM),
            timeout: AGENT_TIMEOUT,
        }
    }
}

impl BuildkiteAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run this binary instead of `buildkite-agent` from `PATH`
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the agent with `args` and return its stdout.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let command = format!("{} {}", self.program.display(), args.join(" "));
        debug!(command = %command, "Running buildkite-agent command");

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BuildkiteError::Spawn {
                command: command.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BuildkiteError::Timeout {
                command: command.clone(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|source| BuildkiteError::Output {
                command: command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let exit_code = output.status.code();
            debug!(
                command = %command,
                exit_code = ?exit_code,
                stdout = %stdout,
                stderr = %stderr,
                "buildkite-agent output"
            );
            error!(command = %command, exit_code = ?exit_code, "buildkite-agent command failed");
            return Err(BuildkiteError::CommandFailed {
                command,
                exit_code,
                stderr,
            });
        }

        Ok(stdout)
    }
}

fn trim_output(output: &str) -> String {
    output.trim_end_matches(['\n', '\r']).to_string()
}

#[async_trait]
impl AgentClient for BuildkiteAgent {
    async fn get_self_label(&self) -> unblock_core::Result<String> {
        debug!("Getting own step label");
        let out = self.run(&["step", "get", "label"]).await?;
        Ok(trim_output(&out))
    }

    async fn update_self_label(&self, label: &str) -> unblock_core::Result<()> {
        debug!(label = %label, "Updating own step label");
        self.run(&["step", "update", "label", label]).await?;
        Ok(())
    }

    async fn get_step_state(&self, step_key: &str) -> unblock_core::Result<StepState> {
        debug!(step_key = %step_key, "Getting step state");
        let out = self
            .run(&["step", "get", "state", "--step", step_key])
            .await?;
        Ok(StepState::parse(&out))
    }
}
