//! Turns a session's chunk files into one artifact.
//!
//! Chunks are validated, the invalid ones repaired where a strategy exists,
//! and the survivors walked down the strategy ladder until one rung produces
//! an output. The output is then re-probed so the caller can see whether
//! footage went missing.

mod plan;
mod report;
mod strategies;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EncoderSection, MergeSection};
use crate::executor::JobExecutor;
use crate::media::RecoveryStrategy;
use crate::recovery::{ChunkRecoverer, RecoveryError, RecoveryScope};
use crate::validator::{ChunkValidator, ValidationResult};

pub use plan::{MergePlan, PlanChunk};
pub use report::{
    ChunkIssue, ChunkValidation, DurationAccuracy, MergeMethod, MergeReport, MergeResult,
    MethodAttempt,
};
pub use strategies::{
    default_ladder, BinaryConcat, DemuxerReencode, FilterGraphConcat, MergeContext,
    MergeStrategy, StreamCopyConcat,
};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("{method} failed: {reason}")]
    StrategyFailed { method: MergeMethod, reason: String },
    #[error("merge cancelled")]
    Cancelled,
    #[error("no usable chunks: {diagnosis}")]
    NoUsableChunks { diagnosis: String },
    #[error("every merge strategy failed: {diagnosis}")]
    Exhausted {
        diagnosis: String,
        attempts: Vec<MethodAttempt>,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type MergeOutcome<T> = Result<T, MergeError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInput {
    pub index: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub session_id: String,
    pub chunks: Vec<ChunkInput>,
    /// Chunks the client said it would send; `None` means "whatever arrived".
    pub expected_chunks: Option<usize>,
    pub cancel: CancellationToken,
}

impl MergeRequest {
    pub fn new(session_id: impl Into<String>, chunks: Vec<ChunkInput>) -> Self {
        Self {
            session_id: session_id.into(),
            chunks,
            expected_chunks: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_expected(mut self, expected: Option<usize>) -> Self {
        self.expected_chunks = expected;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

struct Admitted {
    index: u32,
    path: PathBuf,
    validation: ValidationResult,
    recovered_with: Option<RecoveryStrategy>,
}

struct Excluded {
    index: u32,
    path: PathBuf,
    validation: ValidationResult,
    attempted: Option<RecoveryStrategy>,
    reason: String,
}

impl Excluded {
    fn issue(&self) -> ChunkIssue {
        ChunkIssue {
            index: self.index,
            format: self.validation.format,
            confidence: self.validation.confidence,
            strategy: self.attempted,
            reason: self.reason.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MergeEngine {
    executor: JobExecutor,
    validator: Arc<ChunkValidator>,
    encoder: EncoderSection,
    settings: MergeSection,
    output_dir: PathBuf,
    scratch_root: PathBuf,
    ladder: Vec<Arc<dyn MergeStrategy>>,
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ladder: Vec<MergeMethod> = self.ladder.iter().map(|rung| rung.method()).collect();
        f.debug_struct("MergeEngine")
            .field("output_dir", &self.output_dir)
            .field("scratch_root", &self.scratch_root)
            .field("ladder", &ladder)
            .finish()
    }
}

impl MergeEngine {
    pub fn new(
        executor: JobExecutor,
        validator: Arc<ChunkValidator>,
        encoder: EncoderSection,
        settings: MergeSection,
        output_dir: impl Into<PathBuf>,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            validator,
            encoder,
            settings,
            output_dir: output_dir.into(),
            scratch_root: scratch_root.into(),
            ladder: default_ladder(),
        }
    }

    pub fn with_ladder(mut self, ladder: Vec<Arc<dyn MergeStrategy>>) -> Self {
        self.ladder = ladder;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn validator(&self) -> &Arc<ChunkValidator> {
        &self.validator
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    /// Runs the whole pipeline for one session. The session's scratch
    /// directory is removed whatever the outcome.
    pub async fn merge(&self, request: MergeRequest) -> MergeOutcome<MergeReport> {
        let scratch = self.scratch_root.join(&request.session_id);
        let outcome = self.merge_in(&request, &scratch).await;
        if let Err(error) = fs::remove_dir_all(&scratch).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %scratch.display(), %error, "failed to remove merge scratch directory");
            }
        }
        outcome
    }

    async fn merge_in(&self, request: &MergeRequest, scratch: &Path) -> MergeOutcome<MergeReport> {
        let started = Instant::now();
        let session_id = request.session_id.as_str();
        let mut inputs = request.chunks.clone();
        inputs.sort_by_key(|chunk| chunk.index);
        inputs.dedup_by_key(|chunk| chunk.index);
        let expected_chunks = request.expected_chunks.unwrap_or(0).max(inputs.len());

        if inputs.is_empty() {
            return Err(MergeError::NoUsableChunks {
                diagnosis: format!("0 of {expected_chunks} expected chunks received"),
            });
        }

        let scope = RecoveryScope {
            owner: Some(session_id.to_string()),
            cancel: request.cancel.clone(),
        };
        let recoverer = ChunkRecoverer::new(
            self.executor.clone(),
            self.validator.clone(),
            self.encoder.clone(),
            scratch.join("recovery"),
        );

        let paths: Vec<PathBuf> = inputs.iter().map(|chunk| chunk.path.clone()).collect();
        let validations: Vec<ValidationResult> = stream::iter(paths)
            .map(|path| {
                let validator = Arc::clone(&self.validator);
                async move { validator.validate_file(&path).await }
            })
            .buffered(self.settings.validation_concurrency.max(1))
            .collect()
            .await;

        let mut admitted = Vec::new();
        let mut excluded = Vec::new();
        for (chunk, validation) in inputs.iter().zip(validations) {
            if request.cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
            if validation.is_valid {
                admitted.push(Admitted {
                    index: chunk.index,
                    path: chunk.path.clone(),
                    validation,
                    recovered_with: None,
                });
                continue;
            }

            let Some(strategy) = validation.recovery_strategy else {
                let reason = validation
                    .notes
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "invalid chunk".to_string());
                warn!(
                    session_id,
                    index = chunk.index,
                    format = %validation.format,
                    confidence = validation.confidence,
                    %reason,
                    "chunk invalid with no recovery path; excluding"
                );
                excluded.push(Excluded {
                    index: chunk.index,
                    path: chunk.path.clone(),
                    validation,
                    attempted: None,
                    reason,
                });
                continue;
            };

            match recoverer.recover(&chunk.path, strategy, &scope).await {
                Ok(outcome) => admitted.push(Admitted {
                    index: chunk.index,
                    path: chunk.path.clone(),
                    validation: outcome.validation,
                    recovered_with: Some(strategy),
                }),
                Err(RecoveryError::Cancelled) => return Err(MergeError::Cancelled),
                Err(err) => {
                    warn!(
                        session_id,
                        index = chunk.index,
                        format = %validation.format,
                        confidence = validation.confidence,
                        %strategy,
                        error = %err,
                        "chunk recovery failed; excluding"
                    );
                    excluded.push(Excluded {
                        index: chunk.index,
                        path: chunk.path.clone(),
                        validation,
                        attempted: Some(strategy),
                        reason: format!("recovery failed: {err}"),
                    });
                }
            }
        }

        let ratio = |usable: usize| usable as f64 / expected_chunks as f64;
        if ratio(admitted.len()) < self.settings.emergency_valid_ratio && !excluded.is_empty() {
            self.emergency_pass(session_id, &recoverer, &scope, &mut admitted, &mut excluded)
                .await?;
        }
        let valid_ratio = ratio(admitted.len());

        if admitted.is_empty() {
            return Err(MergeError::NoUsableChunks {
                diagnosis: diagnose(expected_chunks, 0, &excluded),
            });
        }

        let plan = MergePlan::build(
            admitted
                .iter()
                .map(|chunk| PlanChunk::from_validation(chunk.index, chunk.path.clone(), &chunk.validation))
                .collect(),
            self.settings.fallback_chunk_seconds,
        );
        info!(
            session_id,
            chunks = plan.chunks.len(),
            expected_chunks,
            expected_duration = plan.expected_duration,
            uniform = plan.is_uniform(),
            timestamp_anomaly = plan.timestamp_anomaly,
            "merge plan built"
        );

        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| MergeError::Io {
                source,
                path: self.output_dir.clone(),
            })?;
        let context = MergeContext {
            executor: self.executor.clone(),
            encoder: self.encoder.clone(),
            scratch_dir: scratch.to_path_buf(),
            owner: Some(session_id.to_string()),
            cancel: request.cancel.clone(),
        };

        let mut attempts = Vec::new();
        let mut winner = None;
        for rung in &self.ladder {
            if request.cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
            let method = rung.method();
            if !rung.applies_to(&plan) {
                debug!(session_id, %method, "merge strategy not applicable; skipping");
                attempts.push(MethodAttempt {
                    method,
                    skipped: true,
                    error: None,
                });
                continue;
            }

            let output = self
                .output_dir
                .join(format!("{session_id}.{}", rung.output_extension(&plan)));
            info!(session_id, %method, output = %output.display(), "attempting merge strategy");
            let outcome = match rung.attempt(&context, &plan, &output).await {
                Ok(()) => match artifact_size(&output).await {
                    0 => Err(MergeError::StrategyFailed {
                        method,
                        reason: "produced an empty artifact".into(),
                    }),
                    size => Ok(size),
                },
                Err(err) => Err(err),
            };
            match outcome {
                Ok(size_bytes) => {
                    attempts.push(MethodAttempt {
                        method,
                        skipped: false,
                        error: None,
                    });
                    winner = Some((method, output, size_bytes));
                    break;
                }
                Err(MergeError::Cancelled) => {
                    discard(&output).await;
                    return Err(MergeError::Cancelled);
                }
                Err(err) => {
                    warn!(session_id, %method, error = %err, "merge strategy failed; trying next rung");
                    discard(&output).await;
                    attempts.push(MethodAttempt {
                        method,
                        skipped: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let Some((method, output_path, size_bytes)) = winner else {
            let mut diagnosis = diagnose(expected_chunks, admitted.len(), &excluded);
            if let Some(last) = attempts.iter().rev().find_map(|attempt| attempt.error.as_ref()) {
                diagnosis.push_str(&format!("; last error: {last}"));
            }
            return Err(MergeError::Exhausted {
                diagnosis,
                attempts,
            });
        };

        let mut warnings = Vec::new();
        let actual_duration = match self.validator.probe().probe(&output_path).await {
            Ok(media) => media.duration_seconds.max(0.0),
            Err(err) => {
                warn!(session_id, output = %output_path.display(), error = %err, "could not probe merged output");
                warnings.push(format!("merged output could not be probed: {err}"));
                0.0
            }
        };

        let included_indices = plan.indices();
        let missing_indices = missing_indices(&included_indices, expected_chunks);
        let expected_duration =
            plan.expected_duration + missing_indices.len() as f64 * plan.mean_chunk_duration();
        // Gaps always rate poor.
        let duration_accuracy = if missing_indices.is_empty() {
            DurationAccuracy::classify(
                expected_duration,
                actual_duration,
                self.settings.duration_tolerance_seconds,
            )
        } else {
            DurationAccuracy::Poor
        };

        if !missing_indices.is_empty() {
            warnings.push(format!(
                "merged {} of {expected_chunks} expected chunks; missing indices: {}",
                included_indices.len(),
                join_indices(&missing_indices)
            ));
        }
        for chunk in &excluded {
            warnings.push(format!(
                "chunk {} excluded ({}, confidence {}): {}",
                chunk.index, chunk.validation.format, chunk.validation.confidence, chunk.reason
            ));
        }
        if duration_accuracy == DurationAccuracy::Poor {
            warnings.push(format!(
                "duration accuracy poor: expected {expected_duration:.1}s, got {actual_duration:.1}s"
            ));
        }

        let recovered_indices = admitted
            .iter()
            .filter(|chunk| chunk.recovered_with.is_some())
            .map(|chunk| chunk.index)
            .collect();
        let dropped = excluded.iter().map(Excluded::issue).collect();
        let mut validations: Vec<ChunkValidation> = admitted
            .into_iter()
            .map(|chunk| ChunkValidation {
                index: chunk.index,
                result: chunk.validation,
                recovered_with: chunk.recovered_with,
            })
            .chain(excluded.into_iter().map(|chunk| ChunkValidation {
                index: chunk.index,
                result: chunk.validation,
                recovered_with: None,
            }))
            .collect();
        validations.sort_by_key(|validation| validation.index);

        let result = MergeResult {
            output_path,
            size_bytes,
            processing_ms: started.elapsed().as_millis() as u64,
            method,
            expected_duration,
            actual_duration,
            duration_accuracy,
        };
        info!(
            session_id,
            %method,
            size_bytes,
            expected_duration,
            actual_duration,
            accuracy = ?duration_accuracy,
            "merge complete"
        );

        Ok(MergeReport {
            result,
            expected_chunks,
            included_indices,
            missing_indices,
            recovered_indices,
            dropped,
            attempts,
            warnings,
            valid_ratio,
            validations,
        })
    }

    /// Last try before giving up on a mostly-broken set: force every excluded
    /// chunk of plausible size through the most aggressive repair.
    async fn emergency_pass(
        &self,
        session_id: &str,
        recoverer: &ChunkRecoverer,
        scope: &RecoveryScope,
        admitted: &mut Vec<Admitted>,
        excluded: &mut Vec<Excluded>,
    ) -> MergeOutcome<()> {
        let min_bytes = self.validator.settings().min_chunk_bytes;
        info!(session_id, excluded = excluded.len(), "valid chunk ratio below threshold; running emergency recovery");
        let mut still_excluded = Vec::new();
        for chunk in excluded.drain(..) {
            if chunk.validation.size_bytes < min_bytes {
                still_excluded.push(chunk);
                continue;
            }
            match recoverer
                .recover(&chunk.path, RecoveryStrategy::ForceMp4, scope)
                .await
            {
                Ok(outcome) => {
                    info!(session_id, index = chunk.index, "emergency recovery rescued chunk");
                    admitted.push(Admitted {
                        index: chunk.index,
                        path: chunk.path,
                        validation: outcome.validation,
                        recovered_with: Some(RecoveryStrategy::ForceMp4),
                    });
                }
                Err(RecoveryError::Cancelled) => return Err(MergeError::Cancelled),
                Err(err) => {
                    debug!(session_id, index = chunk.index, error = %err, "emergency recovery failed");
                    let reason = format!("{}; emergency force-mp4 failed", chunk.reason);
                    still_excluded.push(Excluded {
                        attempted: Some(RecoveryStrategy::ForceMp4),
                        reason,
                        ..chunk
                    });
                }
            }
        }
        *excluded = still_excluded;
        admitted.sort_by_key(|chunk| chunk.index);
        Ok(())
    }
}

/// Indices `0..max(expected, highest + 1)` that are not in `included` (sorted).
fn missing_indices(included: &[u32], expected_chunks: usize) -> Vec<u32> {
    let upper = included
        .last()
        .map(|highest| *highest as usize + 1)
        .unwrap_or(0)
        .max(expected_chunks);
    (0..upper as u32)
        .filter(|index| included.binary_search(index).is_err())
        .collect()
}

fn diagnose(expected_chunks: usize, usable: usize, excluded: &[Excluded]) -> String {
    let percent = if expected_chunks == 0 {
        0.0
    } else {
        usable as f64 * 100.0 / expected_chunks as f64
    };
    let mut diagnosis =
        format!("{usable} of {expected_chunks} expected chunks usable ({percent:.0}%)");
    if !excluded.is_empty() {
        let details: Vec<String> = excluded
            .iter()
            .map(|chunk| {
                format!(
                    "#{} {} confidence {}",
                    chunk.index, chunk.validation.format, chunk.validation.confidence
                )
            })
            .collect();
        diagnosis.push_str("; excluded: ");
        diagnosis.push_str(&details.join(", "));
    }
    diagnosis
}

fn join_indices(indices: &[u32]) -> String {
    indices
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

async fn artifact_size(path: &Path) -> u64 {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0)
}

async fn discard(path: &Path) {
    if let Err(error) = fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), %error, "failed to remove partial merge output");
        }
    }
}
