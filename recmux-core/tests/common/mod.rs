#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use recmux_core::media::{MediaInfo, MediaProbe, ProbeError, ProbeResult};
use recmux_core::{
    ChunkValidator, EncoderBackend, EncoderJob, EncoderOutput, EncoderProgress, EncoderSection,
    ExecutorError, ExecutorResult, FsChunkStorage, JobExecutor, MergeEngine, MergeSection,
    SessionRegistry, ValidationSection, WaiterSection,
};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
pub const SEGMENT_ID: [u8; 4] = [0x18, 0x53, 0x80, 0x67];
pub const SECONDS_PER_MARKER: f64 = 2.0;
pub const REPAIRED_CHUNK_BYTES: usize = 1200;

/// An MP4-looking chunk: `ftyp` and `moov` boxes up front, filler after.
pub fn mp4_chunk(len: usize) -> Vec<u8> {
    let mut bytes = b"\x00\x00\x00\x18ftypisom\x00\x00\x02\x00".to_vec();
    bytes.extend_from_slice(b"\x00\x00\x00\x08moov");
    bytes.resize(len.max(bytes.len()), 0x11);
    bytes
}

pub fn webm_chunk(len: usize) -> Vec<u8> {
    let mut bytes = EBML_MAGIC.to_vec();
    bytes.extend_from_slice(&[0x9F, 0x42, 0x86, 0x81, 0x01]);
    bytes.extend_from_slice(&SEGMENT_ID);
    bytes.resize(len.max(bytes.len()), 0x22);
    bytes
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .filter(|window| *window == needle)
        .count()
}

/// Reports two seconds of video per container start marker in the file.
#[derive(Debug, Default)]
pub struct ContentProbe;

#[async_trait]
impl MediaProbe for ContentProbe {
    async fn probe(&self, path: &Path) -> ProbeResult<MediaInfo> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ProbeError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        let markers = count(&bytes, b"ftyp") + count(&bytes, &EBML_MAGIC);
        Ok(MediaInfo {
            duration_seconds: markers as f64 * SECONDS_PER_MARKER,
            codec: Some("h264".into()),
            width: Some(1280),
            height: Some(720),
            bitrate: None,
            has_video: markers > 0,
            has_audio: markers > 0,
            start_time: 0.0,
        })
    }
}

/// Stands in for ffmpeg: concatenates every `-i` input (expanding concat
/// manifests) into the last argument.
#[derive(Debug, Default)]
pub struct FakeEncoder {
    failing: Vec<String>,
    holding: Vec<String>,
    repairing: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs whose label starts with `prefix` exit non-zero.
    pub fn failing(mut self, prefix: &str) -> Self {
        self.failing.push(prefix.to_string());
        self
    }

    /// Jobs whose label starts with `prefix` block until cancelled.
    pub fn holding(mut self, prefix: &str) -> Self {
        self.holding.push(prefix.to_string());
        self
    }

    /// Jobs whose label starts with `prefix` write a fresh, well-formed MP4.
    pub fn repairing(mut self, prefix: &str) -> Self {
        self.repairing.push(prefix.to_string());
        self
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn matches(prefixes: &[String], label: &str) -> bool {
        prefixes.iter().any(|prefix| label.starts_with(prefix.as_str()))
    }
}

async fn expand_inputs(args: &[String]) -> std::io::Result<Vec<PathBuf>> {
    let concat = args
        .windows(2)
        .any(|pair| pair[0] == "-f" && pair[1] == "concat");
    let mut inputs = Vec::new();
    for pair in args.windows(2) {
        if pair[0] != "-i" {
            continue;
        }
        if concat {
            let manifest = tokio::fs::read_to_string(&pair[1]).await?;
            for line in manifest.lines() {
                if let Some(rest) = line.strip_prefix("file '") {
                    inputs.push(PathBuf::from(rest.trim_end_matches('\'')));
                }
            }
        } else {
            inputs.push(PathBuf::from(&pair[1]));
        }
    }
    Ok(inputs)
}

#[async_trait]
impl EncoderBackend for FakeEncoder {
    async fn execute(
        &self,
        job: &EncoderJob,
        cancel: CancellationToken,
        _progress: watch::Sender<EncoderProgress>,
    ) -> ExecutorResult<EncoderOutput> {
        let started = Instant::now();
        self.calls.lock().unwrap().push(job.label.clone());
        if Self::matches(&self.holding, &job.label) {
            cancel.cancelled().await;
            return Err(ExecutorError::Cancelled);
        }
        if Self::matches(&self.failing, &job.label) {
            return Ok(EncoderOutput {
                status: Some(1),
                stderr: format!("{}: simulated failure", job.label),
                elapsed: started.elapsed(),
            });
        }

        let output = PathBuf::from(job.args.last().cloned().unwrap_or_default());
        if Self::matches(&self.repairing, &job.label) {
            tokio::fs::write(&output, mp4_chunk(REPAIRED_CHUNK_BYTES)).await?;
            return Ok(EncoderOutput {
                status: Some(0),
                stderr: String::new(),
                elapsed: started.elapsed(),
            });
        }
        let inputs = expand_inputs(&job.args).await?;
        let mut merged = Vec::new();
        for input in inputs {
            merged.extend(tokio::fs::read(&input).await?);
        }
        tokio::fs::write(&output, merged).await?;
        Ok(EncoderOutput {
            status: Some(0),
            stderr: String::new(),
            elapsed: started.elapsed(),
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub registry: SessionRegistry,
    pub encoder: Arc<FakeEncoder>,
}

impl Harness {
    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.dir.path().join("chunks")
    }
}

pub fn fast_waits() -> WaiterSection {
    WaiterSection {
        poll_interval_ms: 10,
        default_wait_seconds: 1,
        async_wait_seconds: 2,
    }
}

pub fn engine_in(root: &Path, encoder: Arc<FakeEncoder>) -> MergeEngine {
    let validator = Arc::new(ChunkValidator::new(
        Arc::new(ContentProbe),
        ValidationSection::default(),
    ));
    MergeEngine::new(
        JobExecutor::new(2, encoder),
        validator,
        EncoderSection::default(),
        MergeSection::default(),
        root.join("output"),
        root.join("tmp"),
    )
}

/// Registry over a temp directory; must be called inside a tokio runtime.
pub fn harness(encoder: FakeEncoder) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let encoder = Arc::new(encoder);
    let engine = engine_in(dir.path(), encoder.clone());
    let storage = Arc::new(FsChunkStorage::new(dir.path().join("chunks")));
    let registry = SessionRegistry::new(storage, engine).with_waiting(fast_waits());
    Harness {
        dir,
        registry,
        encoder,
    }
}

pub fn millis(ms: u64) -> Option<Duration> {
    Some(Duration::from_millis(ms))
}
