use std::future::Future;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ShellConfig;
use crate::scheduler::job::JobId;

/// What a handler returns: captured output on success, error text on failure.
pub type HandlerResult = std::result::Result<Option<String>, String>;

/// Everything a handler gets to see about the attempt it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub name: String,
    pub command: String,
    pub payload: serde_json::Value,
    pub attempt: u32,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        name: String,
        command: String,
        payload: serde_json::Value,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            name,
            command,
            payload,
            attempt,
            cancel,
        }
    }

    /// Checkpoint: true once the slot has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the slot is asked to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Runs one attempt of a job.
///
/// Handlers should check [`JobContext::is_cancelled`] (or await
/// [`JobContext::cancelled`]) at reasonable checkpoints. A handler that
/// ignores cancellation is reclaimed after the grace period.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext) -> HandlerResult;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler::new(f)
}

/// Runs a job's command through `sh -c`, optionally inside a Docker sandbox.
///
/// With a sandbox configured, each attempt runs in a throwaway container with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
///
/// Cancellation kills the child process.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    config: ShellConfig,
}

impl ShellExecutor {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, command: &str) -> Command {
        let Some(sandbox) = &self.config.sandbox else {
            let mut cmd = Command::new(&self.config.shell);
            cmd.arg("-c").arg(command);
            return cmd;
        };

        let mut args = vec!["run".to_string(), "--rm".to_string()];

        if sandbox.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = sandbox.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = sandbox.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push(sandbox.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(command.to_string());

        let mut cmd = Command::new("docker");
        cmd.args(&args);
        cmd
    }

    fn process_output(
        job_id: JobId,
        result: std::result::Result<std::process::Output, std::io::Error>,
    ) -> HandlerResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                tracing::debug!(job_id = %job_id, exit_code = ?exit_code, "Command exited");

                if output.status.success() {
                    Ok(if stdout.is_empty() { None } else { Some(stdout) })
                } else if stderr.trim().is_empty() {
                    Err(format!("Exit code: {:?}", exit_code))
                } else {
                    Err(stderr.trim_end().to_string())
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to spawn command");
                Err(e.to_string())
            }
        }
    }
}

#[async_trait]
impl JobHandler for ShellExecutor {
    async fn run(&self, ctx: JobContext) -> HandlerResult {
        tracing::info!(
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            command = %ctx.command,
            sandboxed = self.config.sandbox.is_some(),
            "Executing command"
        );

        let mut cmd = self.build_command(&ctx.command);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Self::process_output(ctx.job_id, Err(e)),
        };

        tokio::select! {
            result = child.wait_with_output() => Self::process_output(ctx.job_id, result),
            _ = ctx.cancelled() => {
                // Dropping the wait future drops the child, and kill_on_drop kills it.
                tracing::info!(job_id = %ctx.job_id, "Command cancelled");
                Err("cancelled".to_string())
            }
        }
    }
}
