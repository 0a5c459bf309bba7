//! Format-specific repair of chunks that failed validation.
//!
//! Every strategy tries a stream copy first and only re-encodes when the copy
//! fails. Output goes to a scratch file and replaces the chunk only after it
//! clears the size floor and re-validates.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EncoderSection;
use crate::executor::{EncoderJob, ExecutorError, JobExecutor};
use crate::ffmpeg::{base_args, path_arg, push_all};
use crate::media::RecoveryStrategy;
use crate::validator::{ChunkValidator, ValidationResult};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("{strategy} exhausted for {path}: {attempts}")]
    Exhausted {
        strategy: RecoveryStrategy,
        path: PathBuf,
        attempts: String,
    },
    #[error("recovery cancelled")]
    Cancelled,
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryMode {
    StreamCopy,
    Reencode,
}

impl fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryMode::StreamCopy => f.write_str("stream-copy"),
            RecoveryMode::Reencode => f.write_str("re-encode"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub strategy: RecoveryStrategy,
    pub mode: RecoveryMode,
    pub validation: ValidationResult,
    pub output_bytes: u64,
}

/// Who asked for the repair, so a stop request can reach the encoder.
#[derive(Debug, Clone, Default)]
pub struct RecoveryScope {
    pub owner: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputContainer {
    Mp4,
    Webm,
}

impl OutputContainer {
    fn extension(&self) -> &'static str {
        match self {
            OutputContainer::Mp4 => "mp4",
            OutputContainer::Webm => "webm",
        }
    }
}

#[derive(Debug, Clone)]
struct RepairProfile {
    input_flags: &'static [&'static str],
    container: OutputContainer,
    min_output_bytes: u64,
}

impl RepairProfile {
    fn for_strategy(strategy: RecoveryStrategy) -> Self {
        match strategy {
            RecoveryStrategy::Mp4MoovRepair => Self {
                input_flags: &[
                    "-f", "mp4", "-err_detect", "ignore_err", "-fflags", "+genpts+igndts",
                    "-ignore_editlist", "1",
                ],
                container: OutputContainer::Mp4,
                min_output_bytes: 1000,
            },
            RecoveryStrategy::Mp4Repair => Self {
                input_flags: &["-err_detect", "ignore_err", "-fflags", "+genpts+discardcorrupt"],
                container: OutputContainer::Mp4,
                min_output_bytes: 1000,
            },
            RecoveryStrategy::ReprocessContainer => Self {
                input_flags: &["-fflags", "+genpts"],
                container: OutputContainer::Mp4,
                min_output_bytes: 1000,
            },
            RecoveryStrategy::WebmReprocess => Self {
                input_flags: &["-f", "matroska", "-fflags", "+genpts"],
                container: OutputContainer::Webm,
                min_output_bytes: 1000,
            },
            RecoveryStrategy::ForceWebm => Self {
                input_flags: &[
                    "-f", "matroska", "-err_detect", "ignore_err", "-fflags",
                    "+genpts+igndts+discardcorrupt",
                ],
                container: OutputContainer::Webm,
                min_output_bytes: 500,
            },
            RecoveryStrategy::ForceMp4 => Self {
                input_flags: &[
                    "-f", "mp4", "-err_detect", "ignore_err", "-fflags",
                    "+genpts+igndts+discardcorrupt",
                ],
                container: OutputContainer::Mp4,
                min_output_bytes: 500,
            },
            RecoveryStrategy::Reprocess => Self {
                input_flags: &["-err_detect", "ignore_err", "-fflags", "+genpts+discardcorrupt"],
                container: OutputContainer::Mp4,
                min_output_bytes: 500,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkRecoverer {
    executor: JobExecutor,
    validator: Arc<ChunkValidator>,
    encoder: EncoderSection,
    scratch_dir: PathBuf,
}

impl ChunkRecoverer {
    pub fn new(
        executor: JobExecutor,
        validator: Arc<ChunkValidator>,
        encoder: EncoderSection,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            validator,
            encoder,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Repairs `path` in place with `strategy`.
    pub async fn recover(
        &self,
        path: &Path,
        strategy: RecoveryStrategy,
        scope: &RecoveryScope,
    ) -> RecoveryResult<RecoveryOutcome> {
        let profile = RepairProfile::for_strategy(strategy);
        fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|source| RecoveryError::Io {
                source,
                path: self.scratch_dir.clone(),
            })?;

        let mut failures = Vec::new();
        for mode in [RecoveryMode::StreamCopy, RecoveryMode::Reencode] {
            if scope.cancel.is_cancelled() {
                return Err(RecoveryError::Cancelled);
            }
            let scratch = self.scratch_dir.join(format!(
                "recover_{}.{}",
                Uuid::new_v4().simple(),
                profile.container.extension()
            ));
            let mut job = EncoderJob::new(
                &self.encoder.ffmpeg,
                self.build_args(&profile, mode, path, &scratch),
                format!("recover:{strategy}:{mode}"),
            )
            .with_timeout(self.encoder.job_timeout())
            .with_parent(scope.cancel.clone());
            if let Some(owner) = &scope.owner {
                job = job.with_owner(owner.clone());
            }

            match self.executor.run(job).await {
                Ok(_) => {}
                Err(ExecutorError::Cancelled) => {
                    discard(&scratch).await;
                    return Err(RecoveryError::Cancelled);
                }
                Err(err) => {
                    debug!(path = %path.display(), %strategy, %mode, error = %err, "recovery attempt failed");
                    failures.push(format!("{mode}: {err}"));
                    discard(&scratch).await;
                    continue;
                }
            }

            let output_bytes = fs::metadata(&scratch)
                .await
                .map(|metadata| metadata.len())
                .unwrap_or(0);
            if output_bytes < profile.min_output_bytes {
                failures.push(format!(
                    "{mode}: output of {output_bytes} bytes below {} byte floor",
                    profile.min_output_bytes
                ));
                discard(&scratch).await;
                continue;
            }

            let validation = self.validator.validate_file(&scratch).await;
            if !validation.is_valid {
                failures.push(format!(
                    "{mode}: output still invalid ({}, confidence {})",
                    validation.format, validation.confidence
                ));
                discard(&scratch).await;
                continue;
            }

            replace_file(&scratch, path).await?;
            info!(path = %path.display(), %strategy, %mode, output_bytes, "chunk recovered");
            return Ok(RecoveryOutcome {
                strategy,
                mode,
                validation,
                output_bytes,
            });
        }

        warn!(path = %path.display(), %strategy, attempts = failures.len(), "chunk recovery exhausted");
        Err(RecoveryError::Exhausted {
            strategy,
            path: path.to_path_buf(),
            attempts: failures.join("; "),
        })
    }

    fn build_args(
        &self,
        profile: &RepairProfile,
        mode: RecoveryMode,
        input: &Path,
        output: &Path,
    ) -> Vec<String> {
        let mut args = base_args(&self.encoder);
        push_all(&mut args, &["-analyzeduration", "100M", "-probesize", "100M"]);
        push_all(&mut args, profile.input_flags);
        args.push("-i".to_string());
        args.push(path_arg(input));
        push_all(&mut args, &["-map", "0:v:0", "-map", "0:a?"]);
        match (mode, profile.container) {
            (RecoveryMode::StreamCopy, OutputContainer::Mp4) => {
                push_all(&mut args, &["-c", "copy", "-movflags", "+faststart", "-f", "mp4"]);
            }
            (RecoveryMode::StreamCopy, OutputContainer::Webm) => {
                push_all(&mut args, &["-c", "copy", "-f", "webm"]);
            }
            (RecoveryMode::Reencode, OutputContainer::Mp4) => {
                push_all(&mut args, &["-c:v", "libx264", "-preset"]);
                args.push(self.encoder.fast_preset.clone());
                args.push("-crf".to_string());
                args.push(self.encoder.crf.to_string());
                push_all(
                    &mut args,
                    &["-pix_fmt", "yuv420p", "-c:a", "aac", "-movflags", "+faststart", "-f", "mp4"],
                );
            }
            (RecoveryMode::Reencode, OutputContainer::Webm) => {
                push_all(
                    &mut args,
                    &[
                        "-c:v", "libvpx-vp9", "-deadline", "realtime", "-cpu-used", "8",
                        "-row-mt", "1", "-b:v", "0", "-crf", "36", "-c:a", "libopus", "-f",
                        "webm",
                    ],
                );
            }
        }
        args.push(path_arg(output));
        args
    }
}

async fn discard(path: &Path) {
    if let Err(error) = fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), %error, "failed to remove scratch file");
        }
    }
}

/// Moves `from` over `to`, copying when they live on different filesystems.
pub(crate) async fn replace_file(from: &Path, to: &Path) -> RecoveryResult<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .await
        .map_err(|source| RecoveryError::Io {
            source,
            path: to.to_path_buf(),
        })?;
    discard(from).await;
    Ok(())
}
