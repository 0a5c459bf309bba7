//! Recording sessions: chunk intake, finalize orchestration and cleanup.
//!
//! The registry is the only owner of session state. Every mutation happens
//! under one short-lived lock and queues a write for the optional
//! [`SessionMirror`]; queued writes reach the mirror in mutation order. A
//! cache miss reads through to the mirror before a request is rejected as
//! unknown.

mod models;
mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{RecmuxConfig, WaiterSection};
use crate::executor::JobExecutor;
use crate::media::FfprobeProbe;
use crate::merge::{ChunkInput, MergeEngine, MergeError, MergeReport, MergeRequest, MergeResult};
use crate::storage::{validate_session_id, ChunkStorage, FsChunkStorage, StorageError};
use crate::validator::ChunkValidator;
use crate::waiter::{ChunkWaiter, WaitOutcome};

pub use models::{
    Chunk, FailureKind, RecordingSession, SessionSnapshot, SessionStats, SessionStatus,
};
pub use store::{
    SessionMirror, SqliteSessionStore, SqliteSessionStoreBuilder, StoreError, StoreResult,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {session_id} not found")]
    NotFound { session_id: String },
    #[error("session {session_id} is {status} and accepts no further changes")]
    Terminal {
        session_id: String,
        status: SessionStatus,
    },
    #[error("session {session_id} already exists and is {status}")]
    AlreadyExists {
        session_id: String,
        status: SessionStatus,
    },
    #[error("session {session_id} is already {status}")]
    AlreadyMerging {
        session_id: String,
        status: SessionStatus,
    },
    #[error("no chunks available for session {session_id}: {diagnosis}")]
    NoChunksAvailable {
        session_id: String,
        diagnosis: String,
    },
    #[error("merge exhausted for session {session_id}: {diagnosis}")]
    MergeExhausted {
        session_id: String,
        diagnosis: String,
    },
    #[error("session {session_id} was stopped")]
    Stopped { session_id: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
#[error("artifact delivery failed: {0}")]
pub struct SinkError(pub String);

/// Receives merged artifacts for long-term storage.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn deliver(&self, session_id: &str, result: &MergeResult) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub session_id: Option<String>,
    pub expected_chunks: Option<usize>,
    pub video_settings: Option<Value>,
}

impl NewSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_expected(mut self, expected_chunks: usize) -> Self {
        self.expected_chunks = Some(expected_chunks);
        self
    }

    pub fn with_video_settings(mut self, settings: Value) -> Self {
        self.video_settings = Some(settings);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub session_id: String,
    pub index: u32,
    pub size_bytes: u64,
    /// An earlier upload with the same index was superseded.
    pub replaced: bool,
    /// The bytes matched what was already stored.
    pub unchanged: bool,
    pub chunks_received: usize,
}

#[derive(Debug, Clone, Copy)]
enum MirrorScope {
    Session,
    Chunk(u32),
}

enum MirrorWrite {
    Session(RecordingSession),
    Chunk(RecordingSession, u32),
}

impl MirrorWrite {
    fn apply(&self, mirror: &dyn SessionMirror) -> StoreResult<()> {
        match self {
            MirrorWrite::Session(session) => mirror.save(session),
            MirrorWrite::Chunk(session, index) => mirror.save_chunk(session, *index),
        }
    }
}

struct SessionEntry {
    session: RecordingSession,
    cancel: CancellationToken,
    /// Uploads admitted but not yet recorded.
    uploads: usize,
    /// Serializes store-then-record for each chunk index.
    index_locks: HashMap<u32, Arc<AsyncMutex<()>>>,
    /// Mirror writes in mutation order.
    pending: Vec<MirrorWrite>,
    flush_gate: Arc<AsyncMutex<()>>,
}

impl SessionEntry {
    fn new(session: RecordingSession) -> Self {
        Self {
            session,
            cancel: CancellationToken::new(),
            uploads: 0,
            index_locks: HashMap::new(),
            pending: Vec::new(),
            flush_gate: Arc::new(AsyncMutex::new(())),
        }
    }

    fn queue_mirror_write(&mut self, scope: MirrorScope) {
        let snapshot = self.session.clone();
        let write = match scope {
            MirrorScope::Session => {
                // A full write supersedes everything queued before it.
                self.pending.clear();
                MirrorWrite::Session(snapshot)
            }
            MirrorScope::Chunk(index) => MirrorWrite::Chunk(snapshot, index),
        };
        self.pending.push(write);
    }
}

/// Holds an admitted upload open until it is recorded or abandoned.
struct UploadSlot<'a> {
    registry: &'a SessionRegistry,
    session_id: &'a str,
}

impl Drop for UploadSlot<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.registry.lock().get_mut(self.session_id) {
            entry.uploads = entry.uploads.saturating_sub(1);
        }
    }
}

type SessionTable = Arc<Mutex<HashMap<String, SessionEntry>>>;

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: SessionTable,
    storage: Arc<dyn ChunkStorage>,
    engine: MergeEngine,
    mirror: Option<Arc<dyn SessionMirror>>,
    sink: Option<Arc<dyn ArtifactSink>>,
    waiter: ChunkWaiter,
    waits: WaiterSection,
    keep_chunks_on_failure: bool,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.lock().len())
            .field("engine", &self.engine)
            .field("mirrored", &self.mirror.is_some())
            .field("waits", &self.waits)
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn ChunkStorage>, engine: MergeEngine) -> Self {
        let waits = WaiterSection::default();
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            storage,
            engine,
            mirror: None,
            sink: None,
            waiter: ChunkWaiter::new(waits.poll_interval()),
            waits,
            keep_chunks_on_failure: true,
        }
    }

    /// Wires the production stack: filesystem storage, ffprobe, the system
    /// encoder pool and, when configured, the SQLite mirror.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &RecmuxConfig) -> SessionResult<Self> {
        let probe = Arc::new(FfprobeProbe::new(
            &config.encoder.ffprobe,
            config.encoder.probe_timeout(),
        ));
        let validator = Arc::new(ChunkValidator::new(probe, config.validation.clone()));
        let engine = MergeEngine::new(
            JobExecutor::system(config.executor.max_concurrent_jobs),
            validator,
            config.encoder.clone(),
            config.merge.clone(),
            config.resolve_path(&config.paths.output_dir),
            config.resolve_path(&config.paths.temp_dir),
        );
        let storage = Arc::new(FsChunkStorage::new(
            config.resolve_path(&config.paths.storage_dir),
        ));
        let mut registry = Self::new(storage, engine)
            .with_waiting(config.waiter.clone())
            .keep_chunks_on_failure(config.merge.keep_chunks_on_failure);

        if let Some(db) = &config.paths.sessions_db {
            let path = config.resolve_path(db);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
            }
            let store = SqliteSessionStore::builder()
                .path(&path)
                .create_if_missing(true)
                .build()?;
            store.initialize()?;
            registry = registry.with_mirror(Arc::new(store));
        }
        Ok(registry)
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn SessionMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_waiting(mut self, waits: WaiterSection) -> Self {
        self.waiter = ChunkWaiter::new(waits.poll_interval());
        self.waits = waits;
        self
    }

    pub fn keep_chunks_on_failure(mut self, keep: bool) -> Self {
        self.keep_chunks_on_failure = keep;
        self
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    /// Creates a session, or returns the existing one unchanged when the id is
    /// already known and not terminal.
    pub async fn create_session(&self, request: NewSession) -> SessionResult<String> {
        let session_id = request
            .session_id
            .unwrap_or_else(|| format!("rec-{}", Uuid::new_v4().simple()));
        validate_session_id(&session_id)?;
        self.ensure_loaded(&session_id)?;

        let expected_chunks = {
            let mut sessions = self.lock();
            if let Some(entry) = sessions.get(&session_id) {
                let status = entry.session.status;
                if status.terminal() {
                    return Err(SessionError::AlreadyExists { session_id, status });
                }
                debug!(session_id = %session_id, %status, "session already exists; returning it unchanged");
                return Ok(session_id);
            }
            let mut entry = SessionEntry::new(RecordingSession::new(
                &session_id,
                request.expected_chunks,
                request.video_settings,
            ));
            if self.mirror.is_some() {
                entry.queue_mirror_write(MirrorScope::Session);
            }
            let expected = entry.session.expected_chunks;
            sessions.insert(session_id.clone(), entry);
            expected
        };
        info!(session_id = %session_id, ?expected_chunks, "recording session created");
        self.flush_mirror(&session_id).await;
        Ok(session_id)
    }

    pub async fn put_chunk(
        &self,
        session_id: &str,
        index: u32,
        bytes: &[u8],
    ) -> SessionResult<ChunkReceipt> {
        self.ensure_loaded(session_id)?;
        let index_lock = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| not_found(session_id))?;
            ensure_accepts_chunks(&entry.session)?;
            entry.uploads += 1;
            entry.index_locks.entry(index).or_default().clone()
        };
        let _slot = UploadSlot {
            registry: self,
            session_id,
        };
        let _writer = index_lock.lock().await;

        let written = self.storage.write(session_id, index, bytes).await?;
        let unchanged = written.unchanged;
        let size_bytes = written.chunk.size_bytes;
        let chunk = Chunk::from_stored(written.chunk, Utc::now());
        // Admission already happened; a sealed session still records the chunk.
        let receipt = self.update(session_id, MirrorScope::Chunk(index), |entry| {
            ensure_not_terminal(&entry.session)?;
            let replaced = entry.session.upsert_chunk(chunk).is_some();
            Ok(ChunkReceipt {
                session_id: session_id.to_string(),
                index,
                size_bytes,
                replaced,
                unchanged,
                chunks_received: entry.session.chunk_count(),
            })
        })
        .await?;
        debug!(
            session_id,
            index,
            size_bytes,
            replaced = receipt.replaced,
            chunks_received = receipt.chunks_received,
            "chunk received"
        );
        Ok(receipt)
    }

    pub async fn set_expected_chunks(&self, session_id: &str, expected: usize) -> SessionResult<()> {
        self.ensure_loaded(session_id)?;
        self.update(session_id, MirrorScope::Session, |entry| {
            ensure_accepts_chunks(&entry.session)?;
            entry.session.expected_chunks = Some(expected);
            entry.session.touch();
            Ok(())
        })
        .await
    }

    pub fn chunk_count(&self, session_id: &str) -> usize {
        self.lock()
            .get(session_id)
            .map(|entry| entry.session.chunk_count())
            .unwrap_or(0)
    }

    /// Waits for the expected chunk count (bounded by `max_wait`, or the
    /// configured default), merges whatever arrived and cleans up.
    pub async fn finalize(
        &self,
        session_id: &str,
        expected_total: Option<usize>,
        max_wait: Option<Duration>,
    ) -> SessionResult<MergeReport> {
        self.ensure_loaded(session_id)?;
        let (expected, cancel) = self
            .update(session_id, MirrorScope::Session, |entry| {
                let session = &mut entry.session;
                ensure_can_finalize(session)?;
                if expected_total.is_some() {
                    session.expected_chunks = expected_total;
                }
                session.status = SessionStatus::Finalizing;
                session.touch();
                Ok((session.expected_chunks, entry.cancel.clone()))
            })
            .await?;
        let max_wait =
            max_wait.unwrap_or_else(|| Duration::from_secs(self.waits.default_wait_seconds));
        info!(session_id, expected = ?expected, ?max_wait, "finalize requested");

        let mut short_wait: Option<WaitOutcome> = None;
        if let Some(expected) = expected {
            let waiting = self.waiter.wait_for(expected, max_wait, || {
                let observed = self.chunk_count(session_id);
                async move { observed }
            });
            let outcome = tokio::select! {
                outcome = waiting => outcome,
                _ = cancel.cancelled() => {
                    self.cleanup_failure(session_id).await;
                    return Err(stopped(session_id));
                }
            };
            if outcome.is_partial() {
                warn!(
                    session_id,
                    expected = outcome.expected,
                    observed = outcome.observed,
                    "chunk wait timed out; proceeding with a partial set"
                );
                short_wait = Some(outcome);
            }
        }

        // Seal intake, then let uploads admitted before the seal land.
        let sealed = self
            .update(session_id, MirrorScope::Session, |entry| {
                if entry.cancel.is_cancelled() || entry.session.was_stopped() {
                    return Err(stopped(session_id));
                }
                entry.session.status = SessionStatus::Merging;
                entry.session.touch();
                Ok(())
            })
            .await;
        if let Err(err) = sealed {
            if matches!(err, SessionError::Stopped { .. }) {
                self.cleanup_failure(session_id).await;
            }
            return Err(err);
        }
        if !self.drain_uploads(session_id, &cancel).await {
            self.cleanup_failure(session_id).await;
            return Err(stopped(session_id));
        }

        let inputs = self
            .update(session_id, MirrorScope::Session, |entry| {
                if entry.cancel.is_cancelled() || entry.session.was_stopped() {
                    return Err(stopped(session_id));
                }
                let session = &mut entry.session;
                let inputs: Vec<ChunkInput> = session
                    .chunks
                    .values()
                    .map(|chunk| ChunkInput {
                        index: chunk.index,
                        path: chunk.path.clone(),
                    })
                    .collect();
                if inputs.is_empty() {
                    let diagnosis = format!(
                        "0 of {} expected chunks arrived within {:.0}s",
                        session.expected_chunks.unwrap_or(0),
                        max_wait.as_secs_f64()
                    );
                    session.fail(FailureKind::Error, diagnosis.clone());
                    return Err(SessionError::NoChunksAvailable {
                        session_id: session_id.to_string(),
                        diagnosis,
                    });
                }
                Ok(inputs)
            })
            .await;
        let inputs = match inputs {
            Ok(inputs) => inputs,
            Err(err) => {
                if matches!(err, SessionError::Stopped { .. }) {
                    self.cleanup_failure(session_id).await;
                }
                return Err(err);
            }
        };

        let mut warnings = Vec::new();
        if let Some(outcome) = short_wait {
            if inputs.len() < outcome.expected {
                warnings.push(format!(
                    "waited {:.1}s and proceeded with {} of {} expected chunks",
                    outcome.waited.as_secs_f64(),
                    inputs.len(),
                    outcome.expected
                ));
            }
        }

        let request = MergeRequest::new(session_id, inputs)
            .with_expected(expected)
            .with_cancel(cancel);
        match self.engine.merge(request).await {
            Ok(mut report) => {
                warnings.append(&mut report.warnings);
                report.warnings = warnings;
                self.update(session_id, MirrorScope::Session, |entry| {
                    let session = &mut entry.session;
                    for validation in &report.validations {
                        if let Some(chunk) = session.chunks.get_mut(&validation.index) {
                            chunk.validation = Some(validation.result.clone());
                        }
                    }
                    if session.was_stopped() {
                        return Err(stopped(session_id));
                    }
                    session.status = SessionStatus::Completed;
                    session.last_result = Some(report.result.clone());
                    session.touch();
                    Ok(())
                })
                .await?;
                self.cleanup_success(session_id).await;
                self.deliver(session_id, &report.result).await;
                Ok(report)
            }
            Err(MergeError::Cancelled) => {
                self.fail_session(session_id, FailureKind::Stopped, "stopped during merge")
                    .await;
                self.cleanup_failure(session_id).await;
                Err(stopped(session_id))
            }
            Err(err) => {
                let (failure, reason) = match err {
                    MergeError::NoUsableChunks { diagnosis } => (
                        SessionError::NoChunksAvailable {
                            session_id: session_id.to_string(),
                            diagnosis: diagnosis.clone(),
                        },
                        diagnosis,
                    ),
                    MergeError::Exhausted { diagnosis, .. } => (
                        SessionError::MergeExhausted {
                            session_id: session_id.to_string(),
                            diagnosis: diagnosis.clone(),
                        },
                        diagnosis,
                    ),
                    other => {
                        let reason = other.to_string();
                        (SessionError::Merge(other), reason)
                    }
                };
                error!(session_id, %reason, "merge failed");
                self.fail_session(session_id, FailureKind::Error, reason).await;
                self.cleanup_failure(session_id).await;
                Err(failure)
            }
        }
    }

    /// [`finalize`](Self::finalize) in the background with the extended wait.
    pub fn finalize_async(
        &self,
        session_id: &str,
        expected_total: Option<usize>,
    ) -> SessionResult<JoinHandle<SessionResult<MergeReport>>> {
        self.ensure_loaded(session_id)?;
        {
            let sessions = self.lock();
            let entry = sessions.get(session_id).ok_or_else(|| not_found(session_id))?;
            ensure_can_finalize(&entry.session)?;
        }
        let registry = self.clone();
        let session_id = session_id.to_string();
        let max_wait = Duration::from_secs(self.waits.async_wait_seconds);
        Ok(tokio::spawn(async move {
            registry
                .finalize(&session_id, expected_total, Some(max_wait))
                .await
        }))
    }

    /// Cancels the session's encoder jobs and marks it failed as stopped.
    /// Returns how many jobs were cancelled.
    pub async fn stop_session(&self, session_id: &str) -> SessionResult<usize> {
        self.ensure_loaded(session_id)?;
        self.update(session_id, MirrorScope::Session, |entry| {
            ensure_not_terminal(&entry.session)?;
            entry.cancel.cancel();
            entry.session.fail(FailureKind::Stopped, "stopped by request");
            Ok(())
        })
        .await?;
        let cancelled = self.engine.executor().cancel_owner(session_id);
        info!(session_id, cancelled_jobs = cancelled, "session stopped");
        self.cleanup_failure(session_id).await;
        Ok(cancelled)
    }

    pub fn session_status(&self, session_id: &str) -> SessionResult<SessionSnapshot> {
        self.ensure_loaded(session_id)?;
        self.lock()
            .get(session_id)
            .map(|entry| entry.session.snapshot())
            .ok_or_else(|| not_found(session_id))
    }

    /// Every known session, in memory or mirrored, oldest first.
    pub fn list_sessions(&self) -> SessionResult<Vec<SessionSnapshot>> {
        let mut snapshots: HashMap<String, SessionSnapshot> = HashMap::new();
        if let Some(mirror) = &self.mirror {
            for session in mirror.list()? {
                snapshots.insert(session.session_id.clone(), session.snapshot());
            }
        }
        for (session_id, entry) in self.lock().iter() {
            snapshots.insert(session_id.clone(), entry.session.snapshot());
        }
        let mut snapshots: Vec<SessionSnapshot> = snapshots.into_values().collect();
        snapshots.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(snapshots)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pulls a session from the mirror into memory on a cache miss.
    fn ensure_loaded(&self, session_id: &str) -> SessionResult<()> {
        if self.lock().contains_key(session_id) {
            return Ok(());
        }
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        let Some(mut session) = mirror.load(session_id)? else {
            return Ok(());
        };
        if matches!(
            session.status,
            SessionStatus::Finalizing | SessionStatus::Merging
        ) {
            warn!(session_id, status = %session.status, "reopening session interrupted during finalize");
            session.status = if session.chunks.is_empty() {
                SessionStatus::Initialized
            } else {
                SessionStatus::Receiving
            };
        }
        debug!(session_id, "session restored from mirror");
        self.lock()
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry::new(session));
        Ok(())
    }

    /// Applies `change` under the lock, queueing a mirror write when it
    /// succeeded or moved the session to a new status, then flushes the queue.
    async fn update<T>(
        &self,
        session_id: &str,
        scope: MirrorScope,
        change: impl FnOnce(&mut SessionEntry) -> SessionResult<T>,
    ) -> SessionResult<T> {
        let result = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| not_found(session_id))?;
            let status_before = entry.session.status;
            let result = change(entry);
            let changed = result.is_ok() || entry.session.status != status_before;
            if changed && self.mirror.is_some() {
                entry.queue_mirror_write(scope);
            }
            result
        };
        self.flush_mirror(session_id).await;
        result
    }

    /// Drains the session's queued mirror writes on the blocking pool. The
    /// gate keeps one flusher per session, so writes land in queue order.
    async fn flush_mirror(&self, session_id: &str) {
        let Some(mirror) = self.mirror.clone() else {
            return;
        };
        let gate = {
            let sessions = self.lock();
            match sessions.get(session_id) {
                Some(entry) => entry.flush_gate.clone(),
                None => return,
            }
        };
        let _flushing = gate.lock().await;
        let pending = {
            let mut sessions = self.lock();
            match sessions.get_mut(session_id) {
                Some(entry) => std::mem::take(&mut entry.pending),
                None => return,
            }
        };
        if pending.is_empty() {
            return;
        }

        let written = tokio::task::spawn_blocking(move || {
            pending
                .iter()
                .filter_map(|write| write.apply(mirror.as_ref()).err())
                .map(|error| error.to_string())
                .collect::<Vec<String>>()
        })
        .await;
        match written {
            Ok(errors) => {
                for error in errors {
                    warn!(session_id, %error, "failed to mirror session");
                }
            }
            Err(error) => warn!(session_id, %error, "mirror write task failed"),
        }
    }

    /// Waits for uploads admitted before the seal to be recorded. Returns
    /// `false` when the session was stopped meanwhile.
    async fn drain_uploads(&self, session_id: &str, cancel: &CancellationToken) -> bool {
        let mut announced = false;
        loop {
            let in_flight = self
                .lock()
                .get(session_id)
                .map(|entry| entry.uploads)
                .unwrap_or(0);
            if in_flight == 0 {
                return true;
            }
            if !announced {
                debug!(session_id, in_flight, "waiting for in-flight uploads before merging");
                announced = true;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.waits.poll_interval()) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    async fn fail_session(&self, session_id: &str, kind: FailureKind, reason: impl Into<String>) {
        let reason = reason.into();
        let outcome = self
            .update(session_id, MirrorScope::Session, |entry| {
                if !entry.session.was_stopped() {
                    entry.session.fail(kind, reason);
                }
                Ok(())
            })
            .await;
        if let Err(error) = outcome {
            warn!(session_id, %error, "could not record session failure");
        }
    }

    async fn cleanup_success(&self, session_id: &str) {
        match self.storage.purge_session(session_id).await {
            Ok(removed) => debug!(session_id, removed, "consumed chunks removed"),
            Err(error) => warn!(session_id, %error, "failed to remove consumed chunks"),
        }
    }

    async fn cleanup_failure(&self, session_id: &str) {
        if self.keep_chunks_on_failure {
            debug!(session_id, "keeping chunks of failed session for diagnosis");
            return;
        }
        if let Err(error) = self.storage.purge_session(session_id).await {
            warn!(session_id, %error, "failed to remove chunks of failed session");
        }
    }

    async fn deliver(&self, session_id: &str, result: &MergeResult) {
        let Some(sink) = &self.sink else {
            return;
        };
        match sink.deliver(session_id, result).await {
            Ok(()) => info!(session_id, output = %result.output_path.display(), "artifact delivered"),
            Err(error) => warn!(session_id, %error, "artifact delivery failed; local artifact kept"),
        }
    }
}

fn not_found(session_id: &str) -> SessionError {
    SessionError::NotFound {
        session_id: session_id.to_string(),
    }
}

fn stopped(session_id: &str) -> SessionError {
    SessionError::Stopped {
        session_id: session_id.to_string(),
    }
}

fn ensure_not_terminal(session: &RecordingSession) -> SessionResult<()> {
    let status = session.status;
    if status.terminal() {
        return Err(SessionError::Terminal {
            session_id: session.session_id.clone(),
            status,
        });
    }
    Ok(())
}

fn ensure_accepts_chunks(session: &RecordingSession) -> SessionResult<()> {
    ensure_not_terminal(session)?;
    let status = session.status;
    if !status.accepts_chunks() {
        return Err(SessionError::AlreadyMerging {
            session_id: session.session_id.clone(),
            status,
        });
    }
    Ok(())
}

fn ensure_can_finalize(session: &RecordingSession) -> SessionResult<()> {
    ensure_not_terminal(session)?;
    let status = session.status;
    if !status.can_finalize() {
        return Err(SessionError::AlreadyMerging {
            session_id: session.session_id.clone(),
            status,
        });
    }
    Ok(())
}
