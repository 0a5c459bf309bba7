use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use thiserror::Error;

use super::models::{Chunk, FailureKind, RecordingSession, SessionStats, SessionStatus};
use crate::merge::MergeResult;

const SESSION_SCHEMA: &str = include_str!("../../../sql/sessions.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("session store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("session {session_id} has corrupt field {field}: {reason}")]
    Corrupt {
        session_id: String,
        field: &'static str,
        reason: String,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable copy of session metadata, consulted on registry cache misses.
pub trait SessionMirror: Send + Sync {
    /// Writes the session and replaces its chunk set.
    fn save(&self, session: &RecordingSession) -> StoreResult<()>;

    /// Writes the session row and the one chunk at `index`. Mirrors without
    /// row-level writes fall back to a full save.
    fn save_chunk(&self, session: &RecordingSession, _index: u32) -> StoreResult<()> {
        self.save(session)
    }

    fn load(&self, session_id: &str) -> StoreResult<Option<RecordingSession>>;

    /// Every mirrored session, oldest first.
    fn list(&self) -> StoreResult<Vec<RecordingSession>>;

    fn delete(&self, session_id: &str) -> StoreResult<bool>;
}

#[derive(Debug, Clone)]
pub struct SqliteSessionStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSessionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSessionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteSessionStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteSessionStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    path: PathBuf,
    flags: OpenFlags,
}

struct SessionRow {
    session_id: String,
    status: String,
    failure_kind: Option<String>,
    failure_reason: Option<String>,
    expected_chunks: Option<i64>,
    video_settings: Option<String>,
    bytes_received: i64,
    chunks_received: i64,
    last_chunk_at: Option<DateTime<Utc>>,
    last_result: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get("session_id")?,
            status: row.get("status")?,
            failure_kind: row.get("failure_kind")?,
            failure_reason: row.get("failure_reason")?,
            expected_chunks: row.get("expected_chunks")?,
            video_settings: row.get("video_settings")?,
            bytes_received: row.get("bytes_received")?,
            chunks_received: row.get("chunks_received")?,
            last_chunk_at: row.get("last_chunk_at")?,
            last_result: row.get("last_result")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_session(self, chunks: BTreeMap<u32, Chunk>) -> StoreResult<RecordingSession> {
        let corrupt = |field: &'static str, reason: String| StoreError::Corrupt {
            session_id: self.session_id.clone(),
            field,
            reason,
        };
        let status: SessionStatus = self
            .status
            .parse()
            .map_err(|reason| corrupt("status", reason))?;
        let failure: Option<FailureKind> = self
            .failure_kind
            .as_deref()
            .map(str::parse::<FailureKind>)
            .transpose()
            .map_err(|reason| corrupt("failure_kind", reason))?;
        let video_settings: Option<serde_json::Value> = self
            .video_settings
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let last_result: Option<MergeResult> = self
            .last_result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(RecordingSession {
            session_id: self.session_id,
            status,
            failure,
            failure_reason: self.failure_reason,
            expected_chunks: self.expected_chunks.map(|value| value.max(0) as usize),
            video_settings,
            created_at: self.created_at,
            updated_at: self.updated_at,
            chunks,
            stats: SessionStats {
                bytes_received: self.bytes_received.max(0) as u64,
                chunks_received: self.chunks_received.max(0) as usize,
                last_chunk_at: self.last_chunk_at,
            },
            last_result,
        })
    }
}

impl SqliteSessionStore {
    pub fn builder() -> SqliteSessionStoreBuilder {
        SqliteSessionStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteSessionStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        let read_only = self.flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY);
        configure_connection(&conn, read_only).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SESSION_SCHEMA)?;
        Ok(())
    }

    fn load_chunks(conn: &Connection, session_id: &str) -> StoreResult<BTreeMap<u32, Chunk>> {
        let mut stmt = conn.prepare(
            "SELECT chunk_index, size_bytes, path, sha256, uploaded_at, validation
             FROM session_chunks WHERE session_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, DateTime<Utc>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut chunks = BTreeMap::new();
        for row in rows {
            let (index, size, path, sha256, uploaded_at, validation) = row?;
            let index = index as u32;
            chunks.insert(
                index,
                Chunk {
                    index,
                    size_bytes: size.max(0) as u64,
                    path: PathBuf::from(path),
                    sha256,
                    uploaded_at,
                    validation: validation
                        .as_deref()
                        .map(serde_json::from_str)
                        .transpose()?,
                },
            );
        }
        Ok(chunks)
    }
}

fn upsert_session(tx: &Transaction<'_>, session: &RecordingSession) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO sessions (
            session_id, status, failure_kind, failure_reason, expected_chunks,
            video_settings, bytes_received, chunks_received, last_chunk_at, last_result,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(session_id) DO UPDATE SET
            status = excluded.status,
            failure_kind = excluded.failure_kind,
            failure_reason = excluded.failure_reason,
            expected_chunks = excluded.expected_chunks,
            video_settings = excluded.video_settings,
            bytes_received = excluded.bytes_received,
            chunks_received = excluded.chunks_received,
            last_chunk_at = excluded.last_chunk_at,
            last_result = excluded.last_result,
            updated_at = excluded.updated_at",
        params![
            &session.session_id,
            session.status.as_str(),
            session.failure.map(|kind| kind.as_str()),
            &session.failure_reason,
            session.expected_chunks.map(|value| value as i64),
            session
                .video_settings
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            session.stats.bytes_received as i64,
            session.stats.chunks_received as i64,
            session.stats.last_chunk_at,
            session
                .last_result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            session.created_at,
            session.updated_at,
        ],
    )?;
    Ok(())
}

fn upsert_chunk(tx: &Transaction<'_>, session_id: &str, chunk: &Chunk) -> StoreResult<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO session_chunks (
            session_id, chunk_index, size_bytes, path, sha256, uploaded_at, validation
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(session_id, chunk_index) DO UPDATE SET
            size_bytes = excluded.size_bytes,
            path = excluded.path,
            sha256 = excluded.sha256,
            uploaded_at = excluded.uploaded_at,
            validation = excluded.validation",
    )?;
    stmt.execute(params![
        session_id,
        chunk.index as i64,
        chunk.size_bytes as i64,
        chunk.path.to_string_lossy().to_string(),
        &chunk.sha256,
        chunk.uploaded_at,
        chunk
            .validation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    ])?;
    Ok(())
}

/// Read-only handles skip the pragmas that need a write lock.
fn configure_connection(conn: &Connection, read_only: bool) -> rusqlite::Result<()> {
    if !read_only {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\n\
             PRAGMA synchronous = NORMAL;\n",
        )?;
    }
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

impl SessionMirror for SqliteSessionStore {
    fn save(&self, session: &RecordingSession) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        upsert_session(&tx, session)?;
        tx.execute(
            "DELETE FROM session_chunks WHERE session_id = ?1",
            params![&session.session_id],
        )?;
        for chunk in session.chunks.values() {
            upsert_chunk(&tx, &session.session_id, chunk)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn save_chunk(&self, session: &RecordingSession, index: u32) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        upsert_session(&tx, session)?;
        match session.chunks.get(&index) {
            Some(chunk) => upsert_chunk(&tx, &session.session_id, chunk)?,
            None => {
                tx.execute(
                    "DELETE FROM session_chunks WHERE session_id = ?1 AND chunk_index = ?2",
                    params![&session.session_id, index as i64],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> StoreResult<Option<RecordingSession>> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT * FROM sessions WHERE session_id = ?1",
                params![session_id],
                SessionRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => {
                let chunks = Self::load_chunks(&conn, session_id)?;
                row.into_session(chunks).map(Some)
            }
            None => Ok(None),
        }
    }

    fn list(&self) -> StoreResult<Vec<RecordingSession>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM sessions ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map([], SessionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|row| {
                let chunks = Self::load_chunks(&conn, &row.session_id)?;
                row.into_session(chunks)
            })
            .collect()
    }

    fn delete(&self, session_id: &str) -> StoreResult<bool> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(removed > 0)
    }
}
