//! Bounded pool for external encoder invocations.
//!
//! Jobs are admitted strictly in submission order: a single dispatcher task
//! pulls from an unbounded queue and waits for a free slot before starting the
//! next job. Every job is tracked in a registry keyed by [`JobId`] so callers
//! can cancel by id or by owner.

mod backend;
mod progress;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use backend::{EncoderBackend, EncoderJob, EncoderOutput, SystemEncoderBackend};
pub use progress::{EncoderProgress, ProgressParser};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("encoder job cancelled")]
    Cancelled,
    #[error("encoder job timed out after {0:?}")]
    Timeout(Duration),
    #[error("executor shut down before the job finished")]
    Shutdown,
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub label: String,
    pub owner: Option<String>,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
}

struct JobEntry {
    summary: JobSummary,
    token: CancellationToken,
}

type JobRegistry = Arc<Mutex<HashMap<JobId, JobEntry>>>;

struct QueuedJob {
    id: JobId,
    job: EncoderJob,
    token: CancellationToken,
    progress: watch::Sender<EncoderProgress>,
    reply: oneshot::Sender<ExecutorResult<EncoderOutput>>,
}

/// Handle to a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    progress: watch::Receiver<EncoderProgress>,
    reply: oneshot::Receiver<ExecutorResult<EncoderOutput>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn progress(&self) -> watch::Receiver<EncoderProgress> {
        self.progress.clone()
    }

    pub async fn wait(self) -> ExecutorResult<EncoderOutput> {
        self.reply.await.unwrap_or(Err(ExecutorError::Shutdown))
    }
}

#[derive(Clone)]
pub struct JobExecutor {
    queue: mpsc::UnboundedSender<QueuedJob>,
    jobs: JobRegistry,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("capacity", &self.capacity)
            .field("available", &self.slots.available_permits())
            .finish()
    }
}

impl JobExecutor {
    /// Must be called from within a tokio runtime; spawns the dispatcher.
    pub fn new(max_concurrent: usize, backend: Arc<dyn EncoderBackend>) -> Self {
        let capacity = max_concurrent.max(1);
        let slots = Arc::new(Semaphore::new(capacity));
        let jobs: JobRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (queue, receiver) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(receiver, slots.clone(), jobs.clone(), backend));
        Self {
            queue,
            jobs,
            slots,
            capacity,
        }
    }

    pub fn system(max_concurrent: usize) -> Self {
        Self::new(max_concurrent, Arc::new(SystemEncoderBackend))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn submit(&self, job: EncoderJob) -> JobHandle {
        let id = JobId::new();
        let token = job
            .parent
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let (progress_tx, progress_rx) = watch::channel(EncoderProgress::default());
        let (reply_tx, reply_rx) = oneshot::channel();

        self.lock_jobs().insert(
            id,
            JobEntry {
                summary: JobSummary {
                    id,
                    label: job.label.clone(),
                    owner: job.owner.clone(),
                    state: JobState::Queued,
                    submitted_at: Utc::now(),
                },
                token: token.clone(),
            },
        );

        let queued = QueuedJob {
            id,
            job,
            token,
            progress: progress_tx,
            reply: reply_tx,
        };
        if let Err(mpsc::error::SendError(rejected)) = self.queue.send(queued) {
            self.lock_jobs().remove(&rejected.id);
            let _ = rejected.reply.send(Err(ExecutorError::Shutdown));
        }

        JobHandle {
            id,
            progress: progress_rx,
            reply: reply_rx,
        }
    }

    /// Submits and waits; a non-zero exit becomes [`ExecutorError::CommandFailure`].
    pub async fn run(&self, job: EncoderJob) -> ExecutorResult<EncoderOutput> {
        let command = job.command_line();
        let output = self.submit(job).wait().await?;
        if !output.success() {
            return Err(ExecutorError::CommandFailure {
                command,
                status: output.status,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    pub fn cancel(&self, id: JobId) -> bool {
        match self.lock_jobs().get(&id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every queued or running job tagged with `owner`.
    pub fn cancel_owner(&self, owner: &str) -> usize {
        let jobs = self.lock_jobs();
        let mut cancelled = 0;
        for entry in jobs.values() {
            if entry.summary.owner.as_deref() == Some(owner) {
                entry.token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn active_jobs(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self
            .lock_jobs()
            .values()
            .map(|entry| entry.summary.clone())
            .collect();
        jobs.sort_by_key(|summary| summary.submitted_at);
        jobs
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn dispatch(
    mut receiver: mpsc::UnboundedReceiver<QueuedJob>,
    slots: Arc<Semaphore>,
    jobs: JobRegistry,
    backend: Arc<dyn EncoderBackend>,
) {
    while let Some(queued) = receiver.recv().await {
        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = queued.token.cancelled() => {
                debug!(job_id = %queued.id, label = %queued.job.label, "job cancelled while queued");
                remove_job(&jobs, queued.id);
                let _ = queued.reply.send(Err(ExecutorError::Cancelled));
                continue;
            }
        };

        if let Some(entry) = jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(&queued.id)
        {
            entry.summary.state = JobState::Running;
        }

        let backend = backend.clone();
        let jobs = jobs.clone();
        tokio::spawn(async move {
            let QueuedJob {
                id,
                job,
                token,
                progress,
                reply,
            } = queued;
            info!(job_id = %id, label = %job.label, owner = ?job.owner, "encoder job started");
            let result = if token.is_cancelled() {
                Err(ExecutorError::Cancelled)
            } else {
                backend.execute(&job, token, progress).await
            };
            match &result {
                Ok(output) => debug!(job_id = %id, status = ?output.status, elapsed = ?output.elapsed, "encoder job finished"),
                Err(err) => warn!(job_id = %id, label = %job.label, error = %err, "encoder job failed"),
            }
            remove_job(&jobs, id);
            drop(permit);
            let _ = reply.send(result);
        });
    }
}

fn remove_job(jobs: &JobRegistry, id: JobId) {
    jobs.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&id);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Sleeps for `hold`, or until cancelled, recording start order and peak concurrency.
    #[derive(Default)]
    struct RecordingBackend {
        hold: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
        fail_labels: Vec<String>,
    }

    #[async_trait::async_trait]
    impl EncoderBackend for RecordingBackend {
        async fn execute(
            &self,
            job: &EncoderJob,
            cancel: CancellationToken,
            progress: watch::Sender<EncoderProgress>,
        ) -> ExecutorResult<EncoderOutput> {
            self.started.lock().unwrap().push(job.label.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let outcome = tokio::select! {
                _ = tokio::time::sleep(self.hold) => Ok(()),
                _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome?;
            let _ = progress.send(EncoderProgress {
                finished: true,
                ..EncoderProgress::default()
            });
            let status = if self.fail_labels.contains(&job.label) { 1 } else { 0 };
            Ok(EncoderOutput {
                status: Some(status),
                stderr: String::new(),
                elapsed: self.hold,
            })
        }
    }

    fn job(label: &str) -> EncoderJob {
        EncoderJob::new("ffmpeg", vec!["-version".into()], label)
    }

    #[tokio::test]
    async fn admits_jobs_in_submission_order() {
        let backend = Arc::new(RecordingBackend {
            hold: Duration::from_millis(5),
            ..RecordingBackend::default()
        });
        let executor = JobExecutor::new(1, backend.clone());
        let handles: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|label| executor.submit(job(label)))
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(*backend.started.lock().unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn caps_concurrency() {
        let backend = Arc::new(RecordingBackend {
            hold: Duration::from_millis(30),
            ..RecordingBackend::default()
        });
        let executor = JobExecutor::new(2, backend.clone());
        let handles: Vec<_> = (0..6)
            .map(|idx| executor.submit(job(&format!("job-{idx}"))))
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
        assert_eq!(executor.available_slots(), 2);
        assert!(executor.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn cancel_releases_slot() {
        let backend = Arc::new(RecordingBackend {
            hold: Duration::from_secs(60),
            ..RecordingBackend::default()
        });
        let executor = JobExecutor::new(1, backend.clone());
        let running = executor.submit(job("long").with_owner("session-1"));
        let queued = executor.submit(job("queued").with_owner("session-1"));

        for _ in 0..100 {
            if backend.running.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(executor.active_jobs().len(), 2);
        assert_eq!(executor.cancel_owner("session-1"), 2);

        assert!(matches!(running.wait().await, Err(ExecutorError::Cancelled)));
        assert!(matches!(queued.wait().await, Err(ExecutorError::Cancelled)));
        for _ in 0..100 {
            if executor.available_slots() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(executor.available_slots(), 1);
        assert_eq!(*backend.started.lock().unwrap(), vec!["long"]);
    }

    #[tokio::test]
    async fn cancel_by_id_and_parent_token() {
        let backend = Arc::new(RecordingBackend {
            hold: Duration::from_secs(60),
            ..RecordingBackend::default()
        });
        let executor = JobExecutor::new(2, backend);
        let parent = CancellationToken::new();
        let first = executor.submit(job("first"));
        let second = executor.submit(job("second").with_parent(parent.clone()));

        assert!(executor.cancel(first.id()));
        assert!(matches!(first.wait().await, Err(ExecutorError::Cancelled)));
        parent.cancel();
        assert!(matches!(second.wait().await, Err(ExecutorError::Cancelled)));
    }

    #[tokio::test]
    async fn run_maps_non_zero_exit() {
        let backend = Arc::new(RecordingBackend {
            hold: Duration::from_millis(1),
            fail_labels: vec!["broken".into()],
            ..RecordingBackend::default()
        });
        let executor = JobExecutor::new(1, backend);
        let err = executor.run(job("broken")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::CommandFailure { status: Some(1), .. }));
        assert!(executor.run(job("fine")).await.is_ok());
    }
}
