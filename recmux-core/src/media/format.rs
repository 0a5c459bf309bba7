use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Container family detected for a chunk, from strongest to weakest evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkFormat {
    Mp4,
    Mp4Variant,
    Mov,
    Avi,
    Webm,
    Mp4Partial,
    WebmPartial,
    MediaUnknown,
}

impl ChunkFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkFormat::Mp4 => "mp4",
            ChunkFormat::Mp4Variant => "mp4-variant",
            ChunkFormat::Mov => "mov",
            ChunkFormat::Avi => "avi",
            ChunkFormat::Webm => "webm",
            ChunkFormat::Mp4Partial => "mp4-partial",
            ChunkFormat::WebmPartial => "webm-partial",
            ChunkFormat::MediaUnknown => "media-unknown",
        }
    }

    /// Family used to decide whether chunks can be appended byte for byte.
    pub fn family(&self) -> ContainerFamily {
        match self {
            ChunkFormat::Mp4 | ChunkFormat::Mp4Variant | ChunkFormat::Mp4Partial => {
                ContainerFamily::IsoBmff
            }
            ChunkFormat::Mov => ContainerFamily::QuickTime,
            ChunkFormat::Avi => ContainerFamily::Riff,
            ChunkFormat::Webm | ChunkFormat::WebmPartial => ContainerFamily::Matroska,
            ChunkFormat::MediaUnknown => ContainerFamily::Unknown,
        }
    }

    pub fn is_matroska(&self) -> bool {
        self.family() == ContainerFamily::Matroska
    }
}

impl fmt::Display for ChunkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mp4" => Ok(Self::Mp4),
            "mp4-variant" => Ok(Self::Mp4Variant),
            "mov" => Ok(Self::Mov),
            "avi" => Ok(Self::Avi),
            "webm" => Ok(Self::Webm),
            "mp4-partial" => Ok(Self::Mp4Partial),
            "webm-partial" => Ok(Self::WebmPartial),
            "media-unknown" => Ok(Self::MediaUnknown),
            other => Err(format!("unknown chunk format: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFamily {
    IsoBmff,
    QuickTime,
    Riff,
    Matroska,
    Unknown,
}

/// Repair ladder entry point chosen from the detected format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    Mp4MoovRepair,
    Mp4Repair,
    ReprocessContainer,
    WebmReprocess,
    ForceWebm,
    ForceMp4,
    Reprocess,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Mp4MoovRepair => "mp4-moov-repair",
            RecoveryStrategy::Mp4Repair => "mp4-repair",
            RecoveryStrategy::ReprocessContainer => "reprocess-container",
            RecoveryStrategy::WebmReprocess => "webm-reprocess",
            RecoveryStrategy::ForceWebm => "force-webm",
            RecoveryStrategy::ForceMp4 => "force-mp4",
            RecoveryStrategy::Reprocess => "reprocess",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
