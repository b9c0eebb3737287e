//! Control of the hosted server process.
//!
//! The process manager lives outside this crate; [`ProcessLifecycle`] is the
//! capability it exposes. [`CommandProcessLifecycle`] drives it through
//! configured shell-free command templates.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::ServerId;

/// How often `stop_and_wait` re-checks `is_running`.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    async fn stop(&self, server_id: ServerId) -> Result<()>;

    async fn start(&self, server_id: ServerId) -> Result<()>;

    async fn is_running(&self, server_id: ServerId) -> bool;
}

/// Stop a server and wait until it reports not running.
///
/// Fails with `ServerStopTimeout` if the process is still up after `timeout`,
/// or `Cancelled` if `cancel` fires first.
pub async fn stop_and_wait(
    lifecycle: &dyn ProcessLifecycle,
    server_id: ServerId,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let wait = async {
        lifecycle.stop(server_id).await?;
        while lifecycle.is_running(server_id).await {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        Ok::<(), AppError>(())
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(AppError::Cancelled(format!(
            "stop of server {} cancelled",
            server_id
        ))),
        result = tokio::time::timeout(timeout, wait) => match result {
            Ok(inner) => inner,
            Err(_) => Err(AppError::ServerStopTimeout(server_id, timeout.as_secs())),
        },
    }
}

/// Start a server, giving up after `timeout` or when `cancel` fires.
pub async fn start_within(
    lifecycle: &dyn ProcessLifecycle,
    server_id: ServerId,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AppError::Cancelled(format!(
            "start of server {} cancelled",
            server_id
        ))),
        result = tokio::time::timeout(timeout, lifecycle.start(server_id)) => match result {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Process(format!(
                "start of server {} did not finish within {}s",
                server_id,
                timeout.as_secs_f64()
            ))),
        },
    }
}

/// Start a server again after a job stopped it. The attempt is bounded by
/// `timeout` and, while it has not fired yet, by the job's `deadline`. Once
/// the deadline has passed the start still gets one attempt bounded by
/// `timeout`.
pub async fn restart_within(
    lifecycle: &dyn ProcessLifecycle,
    server_id: ServerId,
    timeout: Duration,
    deadline: &CancellationToken,
) -> Result<()> {
    let cancel = if deadline.is_cancelled() {
        CancellationToken::new()
    } else {
        deadline.clone()
    };
    start_within(lifecycle, server_id, timeout, &cancel).await
}

/// Ask whether a server is running, giving up after `timeout` or when
/// `cancel` fires.
pub async fn is_running_within(
    lifecycle: &dyn ProcessLifecycle,
    server_id: ServerId,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AppError::Cancelled(format!(
            "status check of server {} cancelled",
            server_id
        ))),
        result = tokio::time::timeout(timeout, lifecycle.is_running(server_id)) => {
            result.map_err(|_| AppError::Process(format!(
                "status check of server {} did not finish within {}s",
                server_id,
                timeout.as_secs_f64()
            )))
        }
    }
}

/// Default bound on one external command.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs external commands to stop, start and probe servers.
///
/// Each template is split on whitespace; `{id}` in any argument is replaced by
/// the server id. The status command exiting with 0 means the server is running.
/// A command still running after the timeout is killed.
#[derive(Debug, Clone)]
pub struct CommandProcessLifecycle {
    stop_cmd: String,
    start_cmd: String,
    status_cmd: String,
    timeout: Duration,
}

impl CommandProcessLifecycle {
    pub fn new(
        stop_cmd: impl Into<String>,
        start_cmd: impl Into<String>,
        status_cmd: impl Into<String>,
    ) -> Self {
        Self {
            stop_cmd: stop_cmd.into(),
            start_cmd: start_cmd.into(),
            status_cmd: status_cmd.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a command to completion. The child is killed if the timeout passes.
    async fn output(&self, template: &str, server_id: ServerId, action: &str) -> Result<Output> {
        let mut cmd = Self::command(template, server_id)?;
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output.map_err(|e| {
                AppError::Process(format!("failed to {} server {}: {}", action, server_id, e))
            }),
            Err(_) => Err(AppError::Process(format!(
                "{} of server {} killed after {}s",
                action,
                server_id,
                self.timeout.as_secs_f64()
            ))),
        }
    }

    fn command(template: &str, server_id: ServerId) -> Result<Command> {
        let mut parts = template
            .split_whitespace()
            .map(|p| p.replace("{id}", &server_id.to_string()));
        let program = parts
            .next()
            .ok_or_else(|| AppError::Config("empty process command template".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(parts).kill_on_drop(true);
        Ok(cmd)
    }

    async fn run(&self, template: &str, server_id: ServerId, action: &str) -> Result<()> {
        let output = self.output(template, server_id, action).await?;

        if !output.status.success() {
            return Err(AppError::Process(format!(
                "{} of server {} exited with {}: {}",
                action,
                server_id,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessLifecycle for CommandProcessLifecycle {
    async fn stop(&self, server_id: ServerId) -> Result<()> {
        self.run(&self.stop_cmd, server_id, "stop").await
    }

    async fn start(&self, server_id: ServerId) -> Result<()> {
        self.run(&self.start_cmd, server_id, "start").await
    }

    async fn is_running(&self, server_id: ServerId) -> bool {
        match self.output(&self.status_cmd, server_id, "status check").await {
            Ok(output) => output.status.success(),
            Err(e) => {
                tracing::warn!(server_id, error = %e, "Status command failed");
                false
            }
        }
    }
}
