use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::progress::{EncoderProgress, ProgressParser};
use super::{ExecutorError, ExecutorResult};

/// One invocation of the external encoder.
#[derive(Debug, Clone)]
pub struct EncoderJob {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub label: String,
    /// Tag used to cancel every job belonging to one session.
    pub owner: Option<String>,
    pub timeout: Option<Duration>,
    /// Cancelling this token cancels the job; the executor derives a child from it.
    pub parent: Option<CancellationToken>,
}

impl EncoderJob {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            label: label.into(),
            owner: None,
            timeout: None,
            parent: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn command_line(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub status: Option<i32>,
    pub stderr: String,
    pub elapsed: Duration,
}

impl EncoderOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Seam between the executor and the process that actually encodes.
#[async_trait::async_trait]
pub trait EncoderBackend: Send + Sync {
    async fn execute(
        &self,
        job: &EncoderJob,
        cancel: CancellationToken,
        progress: watch::Sender<EncoderProgress>,
    ) -> ExecutorResult<EncoderOutput>;
}

#[derive(Debug, Default)]
pub struct SystemEncoderBackend;

#[async_trait::async_trait]
impl EncoderBackend for SystemEncoderBackend {
    async fn execute(
        &self,
        job: &EncoderJob,
        cancel: CancellationToken,
        progress: watch::Sender<EncoderProgress>,
    ) -> ExecutorResult<EncoderOutput> {
        let started = Instant::now();
        let mut command = Command::new(&job.program);
        command
            .args(&job.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
            program: job.program.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let progress_task = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = ProgressParser::default();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(snapshot) = parser.feed(&line) {
                    let _ = progress.send(snapshot);
                }
            }
        });
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buffer).await;
            }
            buffer
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(ExecutorError::Io)?,
            _ = cancel.cancelled() => {
                debug!(label = %job.label, "killing cancelled encoder process");
                let _ = child.start_kill();
                let _ = child.wait().await;
                progress_task.abort();
                stderr_task.abort();
                return Err(ExecutorError::Cancelled);
            }
            _ = deadline(job.timeout) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                progress_task.abort();
                stderr_task.abort();
                return Err(ExecutorError::Timeout(job.timeout.unwrap_or_default()));
            }
        };

        let _ = progress_task.await;
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(EncoderOutput {
            status: status.code(),
            stderr: stderr.trim().to_string(),
            elapsed: started.elapsed(),
        })
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}
