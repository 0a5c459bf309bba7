//! Durable chunk bytes on the local filesystem.
//!
//! Layout: `<root>/<session_id>/chunk_<index:06>.bin`. Writes land in a unique
//! `.part` file first and are renamed into place, so concurrent uploads of the
//! same index never leave a torn file behind; the last rename wins.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::debug;
use uuid::Uuid;

const CHUNK_PREFIX: &str = "chunk_";
const CHUNK_SUFFIX: &str = ".bin";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),
    #[error("chunk {index} of session {session_id} not found")]
    NotFound { session_id: String, index: u32 },
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChunk {
    pub index: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub chunk: StoredChunk,
    /// The same bytes were already stored under this index; nothing was written.
    pub unchanged: bool,
}

#[async_trait]
pub trait ChunkStorage: Send + Sync {
    async fn write(&self, session_id: &str, index: u32, bytes: &[u8]) -> StorageResult<WriteOutcome>;

    async fn read(&self, session_id: &str, index: u32) -> StorageResult<Vec<u8>>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, session_id: &str, index: u32) -> StorageResult<bool>;

    /// Stored chunks ordered by index.
    async fn list(&self, session_id: &str) -> StorageResult<Vec<StoredChunk>>;

    /// Removes every chunk of the session; returns how many were removed.
    async fn purge_session(&self, session_id: &str) -> StorageResult<usize>;
}

#[derive(Debug, Clone)]
pub struct FsChunkStorage {
    root: PathBuf,
}

impl FsChunkStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> StorageResult<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    pub fn chunk_path(&self, session_id: &str, index: u32) -> StorageResult<PathBuf> {
        Ok(self.session_dir(session_id)?.join(chunk_file_name(index)))
    }
}

#[async_trait]
impl ChunkStorage for FsChunkStorage {
    async fn write(&self, session_id: &str, index: u32, bytes: &[u8]) -> StorageResult<WriteOutcome> {
        let dir = self.session_dir(session_id)?;
        fs::create_dir_all(&dir).await.map_err(io_at(&dir))?;
        let path = dir.join(chunk_file_name(index));
        let sha256 = digest(bytes);

        if let Ok(existing) = fs::read(&path).await {
            if digest(&existing) == sha256 {
                debug!(session_id, index, "identical chunk re-upload; keeping stored copy");
                return Ok(WriteOutcome {
                    chunk: StoredChunk {
                        index,
                        path,
                        size_bytes: existing.len() as u64,
                        sha256,
                    },
                    unchanged: true,
                });
            }
        }

        let partial = dir.join(format!(
            "{}.{}.part",
            chunk_file_name(index),
            Uuid::new_v4().simple()
        ));
        fs::write(&partial, bytes).await.map_err(io_at(&partial))?;
        if let Err(source) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(StorageError::Io { source, path });
        }
        debug!(session_id, index, size = bytes.len(), "chunk stored");
        Ok(WriteOutcome {
            chunk: StoredChunk {
                index,
                path,
                size_bytes: bytes.len() as u64,
                sha256,
            },
            unchanged: false,
        })
    }

    async fn read(&self, session_id: &str, index: u32) -> StorageResult<Vec<u8>> {
        let path = self.chunk_path(session_id, index)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                session_id: session_id.to_string(),
                index,
            }),
            Err(source) => Err(StorageError::Io { source, path }),
        }
    }

    async fn delete(&self, session_id: &str, index: u32) -> StorageResult<bool> {
        let path = self.chunk_path(session_id, index)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::Io { source, path }),
        }
    }

    async fn list(&self, session_id: &str) -> StorageResult<Vec<StoredChunk>> {
        let dir = self.session_dir(session_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::Io { source, path: dir }),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_at(&dir))? {
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(parse_chunk_file_name) else {
                continue;
            };
            let path = entry.path();
            let bytes = fs::read(&path).await.map_err(io_at(&path))?;
            chunks.push(StoredChunk {
                index,
                path,
                size_bytes: bytes.len() as u64,
                sha256: digest(&bytes),
            });
        }
        chunks.sort_by_key(|chunk| chunk.index);
        Ok(chunks)
    }

    async fn purge_session(&self, session_id: &str) -> StorageResult<usize> {
        let dir = self.session_dir(session_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(StorageError::Io { source, path: dir }),
        };
        let mut stored = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_at(&dir))? {
            if entry
                .file_name()
                .to_str()
                .and_then(parse_chunk_file_name)
                .is_some()
            {
                stored += 1;
            }
        }
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(stored),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(StorageError::Io { source, path: dir }),
        }
    }
}

/// First `len` bytes of a chunk file; shorter files come back whole.
pub async fn read_header(path: &Path, len: usize) -> StorageResult<Vec<u8>> {
    let file = File::open(path).await.map_err(io_at(path))?;
    let mut header = Vec::with_capacity(len);
    file.take(len as u64)
        .read_to_end(&mut header)
        .await
        .map_err(io_at(path))?;
    Ok(header)
}

pub fn validate_session_id(session_id: &str) -> StorageResult<()> {
    let acceptable = !session_id.is_empty()
        && !session_id.starts_with('.')
        && session_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if acceptable {
        Ok(())
    } else {
        Err(StorageError::InvalidSessionId(session_id.to_string()))
    }
}

fn chunk_file_name(index: u32) -> String {
    format!("{CHUNK_PREFIX}{index:06}{CHUNK_SUFFIX}")
}

fn parse_chunk_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(CHUNK_PREFIX)?
        .strip_suffix(CHUNK_SUFFIX)?
        .parse()
        .ok()
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(hasher.finalize())
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError {
    let path = path.to_path_buf();
    move |source| StorageError::Io { source, path }
}
