use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::merge::MergeResult;
use crate::storage::StoredChunk;
use crate::validator::ValidationResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initialized,
    Receiving,
    Finalizing,
    Merging,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initialized => "initialized",
            SessionStatus::Receiving => "receiving",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Merging => "merging",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// Late chunks are still welcome while the waiter runs.
    pub fn accepts_chunks(&self) -> bool {
        matches!(
            self,
            SessionStatus::Initialized | SessionStatus::Receiving | SessionStatus::Finalizing
        )
    }

    pub fn can_finalize(&self) -> bool {
        matches!(self, SessionStatus::Initialized | SessionStatus::Receiving)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(SessionStatus::Initialized),
            "receiving" => Ok(SessionStatus::Receiving),
            "finalizing" => Ok(SessionStatus::Finalizing),
            "merging" => Ok(SessionStatus::Merging),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Why a session ended in `failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Error,
    Stopped,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Stopped => "stopped",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(FailureKind::Error),
            "stopped" => Ok(FailureKind::Stopped),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: u32,
    pub size_bytes: u64,
    pub path: PathBuf,
    pub sha256: String,
    pub uploaded_at: DateTime<Utc>,
    pub validation: Option<ValidationResult>,
}

impl Chunk {
    pub fn from_stored(stored: StoredChunk, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            index: stored.index,
            size_bytes: stored.size_bytes,
            path: stored.path,
            sha256: stored.sha256,
            uploaded_at,
            validation: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub bytes_received: u64,
    pub chunks_received: usize,
    pub last_chunk_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub session_id: String,
    pub status: SessionStatus,
    pub failure: Option<FailureKind>,
    pub failure_reason: Option<String>,
    pub expected_chunks: Option<usize>,
    pub video_settings: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub chunks: BTreeMap<u32, Chunk>,
    pub stats: SessionStats,
    pub last_result: Option<MergeResult>,
}

impl RecordingSession {
    pub fn new(
        session_id: impl Into<String>,
        expected_chunks: Option<usize>,
        video_settings: Option<Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Initialized,
            failure: None,
            failure_reason: None,
            expected_chunks,
            video_settings,
            created_at: now,
            updated_at: now,
            chunks: BTreeMap::new(),
            stats: SessionStats::default(),
            last_result: None,
        }
    }

    /// Inserts or replaces the chunk at its index and returns the one replaced.
    pub fn upsert_chunk(&mut self, chunk: Chunk) -> Option<Chunk> {
        let uploaded_at = chunk.uploaded_at;
        let size = chunk.size_bytes;
        let previous = self.chunks.insert(chunk.index, chunk);
        if let Some(previous) = &previous {
            self.stats.bytes_received = self.stats.bytes_received.saturating_sub(previous.size_bytes);
        }
        self.stats.bytes_received += size;
        self.stats.chunks_received = self.chunks.len();
        self.stats.last_chunk_at = Some(uploaded_at);
        if self.status == SessionStatus::Initialized {
            self.status = SessionStatus::Receiving;
        }
        self.touch();
        previous
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn received_indices(&self) -> Vec<u32> {
        self.chunks.keys().copied().collect()
    }

    /// Indices below the expected count that have not arrived.
    pub fn missing_indices(&self) -> Vec<u32> {
        let Some(expected) = self.expected_chunks else {
            return Vec::new();
        };
        (0..expected as u32)
            .filter(|index| !self.chunks.contains_key(index))
            .collect()
    }

    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.failure = Some(kind);
        self.failure_reason = Some(reason.into());
        self.touch();
    }

    pub fn was_stopped(&self) -> bool {
        self.failure == Some(FailureKind::Stopped)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            status: self.status,
            failure: self.failure,
            failure_reason: self.failure_reason.clone(),
            expected_chunks: self.expected_chunks,
            received_indices: self.received_indices(),
            missing_indices: self.missing_indices(),
            stats: self.stats.clone(),
            video_settings: self.video_settings.clone(),
            last_result: self.last_result.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time view of a session for status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub failure: Option<FailureKind>,
    pub failure_reason: Option<String>,
    pub expected_chunks: Option<usize>,
    pub received_indices: Vec<u32>,
    pub missing_indices: Vec<u32>,
    pub stats: SessionStats,
    pub video_settings: Option<Value>,
    pub last_result: Option<MergeResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
