use serde::{Deserialize, Serialize};

use crate::media::{ChunkFormat, MediaInfo, RecoveryStrategy};

/// Lowest confidence a chunk may carry and still be considered valid.
pub const MIN_VALID_CONFIDENCE: u8 = 5;
pub const MAX_CONFIDENCE: u8 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub format: ChunkFormat,
    pub confidence: u8,
    pub can_recover: bool,
    pub recovery_strategy: Option<RecoveryStrategy>,
    pub media: Option<MediaInfo>,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl ValidationResult {
    pub fn new(
        is_valid: bool,
        format: ChunkFormat,
        confidence: u8,
        recovery_strategy: Option<RecoveryStrategy>,
        size_bytes: u64,
    ) -> Self {
        Self {
            is_valid,
            format,
            confidence,
            can_recover: recovery_strategy.is_some(),
            recovery_strategy,
            media: None,
            size_bytes,
            notes: Vec::new(),
        }
        .normalized()
    }

    /// Unusable chunk with no repair path (empty, truncated or unreadable).
    pub fn rejected(size_bytes: u64, reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            format: ChunkFormat::MediaUnknown,
            confidence: 0,
            can_recover: false,
            recovery_strategy: None,
            media: None,
            size_bytes,
            notes: vec![reason.into()],
        }
    }

    pub fn with_media(mut self, media: MediaInfo) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn duration_seconds(&self) -> f64 {
        self.media
            .as_ref()
            .map(|media| media.duration_seconds.max(0.0))
            .unwrap_or_default()
    }

    pub fn start_time(&self) -> f64 {
        self.media
            .as_ref()
            .map(|media| media.start_time)
            .unwrap_or_default()
    }

    // Keeps `is_valid => confidence >= 5` and `!can_recover => no strategy`.
    fn normalized(mut self) -> Self {
        self.confidence = self.confidence.min(MAX_CONFIDENCE);
        if self.confidence < MIN_VALID_CONFIDENCE {
            self.is_valid = false;
        }
        if !self.can_recover {
            self.recovery_strategy = None;
        }
        self
    }
}
