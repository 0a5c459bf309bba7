use std::path::PathBuf;

use crate::media::{ChunkFormat, ContainerFamily};
use crate::validator::ValidationResult;

/// A chunk admitted to the merge, with the attributes the ladder cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanChunk {
    pub index: u32,
    pub path: PathBuf,
    pub format: ChunkFormat,
    pub duration_seconds: f64,
    pub start_time: f64,
    pub has_audio: bool,
    pub resolution: Option<(u32, u32)>,
}

impl PlanChunk {
    pub fn from_validation(index: u32, path: PathBuf, validation: &ValidationResult) -> Self {
        let media = validation.media.as_ref();
        Self {
            index,
            path,
            format: validation.format,
            duration_seconds: validation.duration_seconds(),
            start_time: validation.start_time(),
            has_audio: media.map(|media| media.has_audio).unwrap_or(false),
            resolution: media.and_then(|media| media.resolution()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub chunks: Vec<PlanChunk>,
    pub expected_duration: f64,
    /// A chunk starts before zero, or starts earlier than its predecessor.
    pub timestamp_anomaly: bool,
    pub uniform_family: Option<ContainerFamily>,
}

impl MergePlan {
    pub fn build(mut chunks: Vec<PlanChunk>, fallback_chunk_seconds: f64) -> Self {
        chunks.sort_by_key(|chunk| chunk.index);

        let probed: f64 = chunks.iter().map(|chunk| chunk.duration_seconds.max(0.0)).sum();
        let expected_duration = if probed > 0.0 {
            probed
        } else {
            fallback_chunk_seconds * chunks.len() as f64
        };

        let timestamp_anomaly = chunks.iter().any(|chunk| chunk.start_time < 0.0)
            || chunks
                .windows(2)
                .any(|pair| pair[1].start_time < pair[0].start_time);

        let uniform_family = chunks.first().map(|chunk| chunk.format.family()).filter(|family| {
            *family != ContainerFamily::Unknown
                && chunks.iter().all(|chunk| chunk.format.family() == *family)
        });

        Self {
            chunks,
            expected_duration,
            timestamp_anomaly,
            uniform_family,
        }
    }

    pub fn is_uniform(&self) -> bool {
        self.uniform_family.is_some()
    }

    /// Precondition for the byte-append fast path.
    pub fn allows_binary_concat(&self) -> bool {
        self.is_uniform() && !self.timestamp_anomaly
    }

    pub fn is_matroska(&self) -> bool {
        self.uniform_family == Some(ContainerFamily::Matroska)
    }

    pub fn all_have_audio(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|chunk| chunk.has_audio)
    }

    /// Resolution the filter graph scales everything to: the first chunk's.
    pub fn target_resolution(&self) -> Option<(u32, u32)> {
        self.chunks.iter().find_map(|chunk| chunk.resolution)
    }

    pub fn indices(&self) -> Vec<u32> {
        self.chunks.iter().map(|chunk| chunk.index).collect()
    }

    pub fn mean_chunk_duration(&self) -> f64 {
        if self.chunks.is_empty() {
            0.0
        } else {
            self.expected_duration / self.chunks.len() as f64
        }
    }
}
