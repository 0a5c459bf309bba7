mod types;

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ValidationSection;
use crate::media::{
    sniff, ChunkFormat, MediaProbe, ProbeError, RecoveryStrategy, SignatureMatch,
};
use crate::storage::read_header;

pub use types::{ValidationResult, MAX_CONFIDENCE, MIN_VALID_CONFIDENCE};

/// Classifies chunk files: signature scan over the header window, then a
/// bounded probe with the media-inspection tool.
#[derive(Clone)]
pub struct ChunkValidator {
    probe: Arc<dyn MediaProbe>,
    settings: ValidationSection,
}

impl std::fmt::Debug for ChunkValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkValidator")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChunkValidator {
    pub fn new(probe: Arc<dyn MediaProbe>, settings: ValidationSection) -> Self {
        Self { probe, settings }
    }

    pub fn probe(&self) -> Arc<dyn MediaProbe> {
        self.probe.clone()
    }

    pub fn settings(&self) -> &ValidationSection {
        &self.settings
    }

    pub async fn validate_file(&self, path: &Path) -> ValidationResult {
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                return ValidationResult::rejected(0, format!("chunk unreadable: {err}"));
            }
        };
        if size < self.settings.min_chunk_bytes {
            return ValidationResult::rejected(
                size,
                format!(
                    "chunk is {size} bytes, below the {} byte minimum",
                    self.settings.min_chunk_bytes
                ),
            );
        }

        let header = match read_header(path, self.settings.header_window_bytes).await {
            Ok(header) => header,
            Err(err) => {
                return ValidationResult::rejected(size, format!("chunk unreadable: {err}"));
            }
        };
        let signature = sniff(&header, size, self.settings.unknown_binary_min_bytes);
        let strategy = self.recovery_for(signature.as_ref(), size);

        match self.probe.probe(path).await {
            Ok(media) if media.has_video && media.duration_seconds >= 0.0 => {
                let format = signature
                    .map(|found| found.format)
                    .unwrap_or(ChunkFormat::MediaUnknown);
                let confidence = signature
                    .map(|found| found.confidence)
                    .unwrap_or(MIN_VALID_CONFIDENCE)
                    .max(MIN_VALID_CONFIDENCE);
                let mut result =
                    ValidationResult::new(true, format, confidence, strategy, size);
                if media.duration_seconds == 0.0 {
                    warn!(path = %path.display(), %format, "chunk probed with zero duration");
                    result = result.with_note("zero duration reported by probe");
                }
                result.with_media(media)
            }
            Ok(media) => {
                let reason = if media.has_video {
                    "negative duration reported by probe"
                } else {
                    "no video stream present"
                };
                debug!(path = %path.display(), reason, "probe rejected chunk");
                self.from_signature(signature, strategy, size, false)
                    .with_media(media)
                    .with_note(reason)
            }
            Err(ProbeError::Unavailable(tool)) => {
                debug!(path = %path.display(), %tool, "probe unavailable, trusting signature");
                self.from_signature(signature, strategy, size, true)
                    .with_note(format!("probe unavailable ({tool})"))
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "probe failed, falling back to signature");
                self.from_signature(signature, strategy, size, false)
                    .with_note(format!("probe failed: {err}"))
            }
        }
    }

    /// Signature-only classification, used when no probe result is trusted.
    pub fn classify_signature(&self, header: &[u8], size: u64) -> ValidationResult {
        if size < self.settings.min_chunk_bytes {
            return ValidationResult::rejected(size, "chunk below minimum size");
        }
        let signature = sniff(header, size, self.settings.unknown_binary_min_bytes);
        let strategy = self.recovery_for(signature.as_ref(), size);
        self.from_signature(signature, strategy, size, true)
    }

    fn from_signature(
        &self,
        signature: Option<SignatureMatch>,
        strategy: Option<RecoveryStrategy>,
        size: u64,
        trust_signature: bool,
    ) -> ValidationResult {
        match signature {
            Some(found) => ValidationResult::new(
                trust_signature,
                found.format,
                found.confidence,
                strategy,
                size,
            ),
            None => ValidationResult::new(false, ChunkFormat::MediaUnknown, 0, strategy, size)
                .with_note("no container signature found"),
        }
    }

    fn recovery_for(&self, signature: Option<&SignatureMatch>, size: u64) -> Option<RecoveryStrategy> {
        let Some(found) = signature else {
            return (size > self.settings.generic_reprocess_min_bytes)
                .then_some(RecoveryStrategy::Reprocess);
        };
        let strategy = match found.format {
            ChunkFormat::Mp4 if found.moov_missing => RecoveryStrategy::Mp4MoovRepair,
            ChunkFormat::Mp4 | ChunkFormat::Mp4Variant => RecoveryStrategy::Mp4Repair,
            ChunkFormat::Mov | ChunkFormat::Avi => RecoveryStrategy::ReprocessContainer,
            ChunkFormat::Webm if found.ebml_complete => RecoveryStrategy::WebmReprocess,
            ChunkFormat::Webm | ChunkFormat::WebmPartial => RecoveryStrategy::ForceWebm,
            ChunkFormat::MediaUnknown | ChunkFormat::Mp4Partial => RecoveryStrategy::ForceMp4,
        };
        Some(strategy)
    }
}
