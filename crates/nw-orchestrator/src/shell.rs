//! Command runner bound to one router
//!
//! Wraps the pool with a fixed session, device and timeout, and applies the
//! failure classification table to every command's stderr.

use std::sync::Arc;
use std::time::Duration;

use nw_core::config::ShapingConfig;
use nw_core::error::WardenError;
use nw_core::types::{CommandOutput, DeviceId, Phase, SessionId};

use crate::commands::{classify, Classification, RemoteCommand};
use crate::connection::ConnectionPool;

/// Handle for running commands on a single router
#[derive(Clone)]
pub struct DeviceShell {
    pool: Arc<ConnectionPool>,
    session: SessionId,
    device: DeviceId,
    timeout: Duration,
}

impl DeviceShell {
    pub fn new(
        pool: Arc<ConnectionPool>,
        session: SessionId,
        device: DeviceId,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            session,
            device,
            timeout,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Run a command without classifying its stderr
    pub async fn raw(&self, command: &str) -> Result<CommandOutput, WardenError> {
        tracing::debug!("[{}] $ {}", self.device, first_line(command));
        self.pool
            .execute(&self.session, &self.device, command, self.timeout)
            .await
    }

    /// Run a command, treating success-equivalent errors as success
    pub async fn run(
        &self,
        phase: Phase,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, WardenError> {
        let rendered = command.to_string();
        let output = self.raw(&rendered).await?;
        match classify(&output.stderr) {
            Classification::Clean => Ok(output),
            Classification::Equivalent(outcome) => {
                tracing::debug!(
                    "[{}] {:?} during {}: {}",
                    self.device,
                    outcome,
                    phase,
                    output.stderr.trim()
                );
                Ok(output)
            }
            Classification::Failure(line) => Err(WardenError::CommandFailure {
                phase,
                command: first_line(&rendered).to_string(),
                stderr: line,
            }),
        }
    }

    /// Run commands in order, stopping at the first failure
    pub async fn run_all<'a, I>(&self, phase: Phase, commands: I) -> Result<(), WardenError>
    where
        I: IntoIterator<Item = &'a RemoteCommand>,
    {
        for command in commands {
            self.run(phase, command).await?;
        }
        Ok(())
    }

    /// Run every command, logging failures instead of returning them.
    ///
    /// Returns how many commands failed. An expired session still aborts.
    pub async fn run_best_effort<'a, I>(
        &self,
        phase: Phase,
        commands: I,
    ) -> Result<usize, WardenError>
    where
        I: IntoIterator<Item = &'a RemoteCommand>,
    {
        let mut failures = 0;
        for command in commands {
            match self.run(phase, command).await {
                Ok(_) => {}
                Err(err @ WardenError::SessionExpired(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!("[{}] Ignoring failure during {}: {}", self.device, phase, err);
                    failures += 1;
                }
            }
        }
        Ok(failures)
    }

    /// Interfaces to shape: the configured list, or every non-loopback interface
    pub async fn interfaces(&self, shaping: &ShapingConfig) -> Result<Vec<String>, WardenError> {
        if !shaping.interfaces.is_empty() {
            return Ok(shaping.interfaces.clone());
        }
        let output = self.run(Phase::Probe, &RemoteCommand::ListInterfaces).await?;
        Ok(parse_interfaces(&output.stdout))
    }
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or(command)
}

/// Parse `ls /sys/class/net` output
pub(crate) fn parse_interfaces(stdout: &str) -> Vec<String> {
    stdout
        .split_whitespace()
        .filter(|name| *name != "lo")
        .map(str::to_string)
        .collect()
}
