use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::media::{ChunkFormat, RecoveryStrategy};
use crate::validator::ValidationResult;

/// Rungs of the merge ladder, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMethod {
    BinaryConcat,
    StreamCopy,
    FilterGraph,
    ConcatDemuxerReencode,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::BinaryConcat => "binary-concat",
            MergeMethod::StreamCopy => "stream-copy",
            MergeMethod::FilterGraph => "filter-graph",
            MergeMethod::ConcatDemuxerReencode => "concat-demuxer-reencode",
        }
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationAccuracy {
    Good,
    Poor,
}

impl DurationAccuracy {
    pub fn classify(expected: f64, actual: f64, tolerance: f64) -> Self {
        if (actual - expected).abs() <= tolerance {
            DurationAccuracy::Good
        } else {
            DurationAccuracy::Poor
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub output_path: PathBuf,
    pub size_bytes: u64,
    pub processing_ms: u64,
    pub method: MergeMethod,
    pub expected_duration: f64,
    pub actual_duration: f64,
    pub duration_accuracy: DurationAccuracy,
}

/// A chunk left out of the merge and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkIssue {
    pub index: u32,
    pub format: ChunkFormat,
    pub confidence: u8,
    pub strategy: Option<RecoveryStrategy>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodAttempt {
    pub method: MergeMethod,
    pub skipped: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkValidation {
    pub index: u32,
    pub result: ValidationResult,
    pub recovered_with: Option<RecoveryStrategy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub result: MergeResult,
    pub expected_chunks: usize,
    pub included_indices: Vec<u32>,
    pub missing_indices: Vec<u32>,
    pub recovered_indices: Vec<u32>,
    pub dropped: Vec<ChunkIssue>,
    pub attempts: Vec<MethodAttempt>,
    pub warnings: Vec<String>,
    pub valid_ratio: f64,
    pub validations: Vec<ChunkValidation>,
}

impl MergeReport {
    pub fn is_complete(&self) -> bool {
        self.missing_indices.is_empty()
    }
}
