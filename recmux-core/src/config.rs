use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RecmuxConfig {
    pub paths: PathsSection,
    pub encoder: EncoderSection,
    pub executor: ExecutorSection,
    pub waiter: WaiterSection,
    pub validation: ValidationSection,
    pub merge: MergeSection,
}

impl RecmuxConfig {
    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.executor.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                field: "executor.max_concurrent_jobs",
                reason: "must be at least 1".into(),
            });
        }
        if self.waiter.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "waiter.poll_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.merge.emergency_valid_ratio) {
            return Err(ConfigError::Invalid {
                field: "merge.emergency_valid_ratio",
                reason: format!("{} is outside 0.0..=1.0", self.merge.emergency_valid_ratio),
            });
        }
        Ok(())
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.paths.base_dir.join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub sessions_db: Option<PathBuf>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            storage_dir: PathBuf::from("data/chunks"),
            output_dir: PathBuf::from("data/output"),
            temp_dir: PathBuf::from("data/tmp"),
            sessions_db: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub log_level: String,
    pub probe_timeout_seconds: u64,
    pub job_timeout_seconds: Option<u64>,
    pub fast_preset: String,
    pub fallback_preset: String,
    pub crf: u32,
    pub fallback_crf: u32,
    pub frame_rate: u32,
}

impl EncoderSection {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds.max(1))
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_seconds.map(Duration::from_secs)
    }
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            log_level: "error".into(),
            probe_timeout_seconds: 5,
            job_timeout_seconds: None,
            fast_preset: "fast".into(),
            fallback_preset: "ultrafast".into(),
            crf: 23,
            fallback_crf: 28,
            frame_rate: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_concurrent_jobs: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaiterSection {
    pub poll_interval_ms: u64,
    pub default_wait_seconds: u64,
    pub async_wait_seconds: u64,
}

impl WaiterSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for WaiterSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            default_wait_seconds: 30,
            async_wait_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub header_window_bytes: usize,
    pub min_chunk_bytes: u64,
    pub unknown_binary_min_bytes: u64,
    pub generic_reprocess_min_bytes: u64,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            header_window_bytes: 2048,
            min_chunk_bytes: 100,
            unknown_binary_min_bytes: 10 * 1024,
            generic_reprocess_min_bytes: 5 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeSection {
    pub duration_tolerance_seconds: f64,
    pub fallback_chunk_seconds: f64,
    pub emergency_valid_ratio: f64,
    pub keep_chunks_on_failure: bool,
    pub validation_concurrency: usize,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            duration_tolerance_seconds: 2.0,
            fallback_chunk_seconds: 1.5,
            emergency_valid_ratio: 0.10,
            keep_chunks_on_failure: true,
            validation_concurrency: 4,
        }
    }
}

pub fn load_recmux_config<P: AsRef<Path>>(path: P) -> Result<RecmuxConfig> {
    let config: RecmuxConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
