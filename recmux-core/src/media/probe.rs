use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

pub type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe tool not available: {0}")]
    Unavailable(String),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe failed for {path}: {stderr}")]
    Command { path: PathBuf, stderr: String },
    #[error("invalid ffprobe payload: {0}")]
    Parse(String),
    #[error("io error probing {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl From<serde_json::Error> for ProbeError {
    fn from(source: serde_json::Error) -> Self {
        ProbeError::Parse(source.to_string())
    }
}

/// Decoded attributes reported by the media-inspection tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub duration_seconds: f64,
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
    pub start_time: f64,
}

impl MediaInfo {
    pub fn resolution(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }
}

#[async_trait::async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> ProbeResult<MediaInfo>;
}

/// `ffprobe` backed implementation, bounded by a timeout so corrupt input
/// cannot hang the caller.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: PathBuf,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> ProbeResult<MediaInfo> {
        let mut command = Command::new(&self.program);
        command
            .kill_on_drop(true)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(path);
        match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
                Ok(parsed.into_media_info())
            }
            Ok(Ok(output)) => Err(ProbeError::Command {
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => Err(
                ProbeError::Unavailable(self.program.display().to_string()),
            ),
            Ok(Err(source)) => Err(ProbeError::Io {
                source,
                path: path.to_path_buf(),
            }),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
}

impl FfprobeOutput {
    fn into_media_info(self) -> MediaInfo {
        let video = self
            .streams
            .iter()
            .find(|stream| stream.codec_type.as_deref() == Some("video"));
        let has_audio = self
            .streams
            .iter()
            .any(|stream| stream.codec_type.as_deref() == Some("audio"));
        // Fragmented recordings often leave the container duration empty while
        // the video stream still carries one.
        let duration_seconds = parse_f64(self.format.duration.as_deref())
            .or_else(|| video.and_then(|stream| parse_f64(stream.duration.as_deref())))
            .unwrap_or_default();
        let start_time = parse_f64(self.format.start_time.as_deref())
            .or_else(|| video.and_then(|stream| parse_f64(stream.start_time.as_deref())))
            .unwrap_or_default();
        let bitrate = video
            .and_then(|stream| parse_u64(stream.bit_rate.as_deref()))
            .or_else(|| parse_u64(self.format.bit_rate.as_deref()));
        MediaInfo {
            duration_seconds,
            codec: video.and_then(|stream| stream.codec_name.clone()),
            width: video.and_then(|stream| stream.width),
            height: video.and_then(|stream| stream.height),
            bitrate,
            has_video: video.is_some(),
            has_audio,
            start_time,
        }
    }
}

fn parse_f64(value: Option<&str>) -> Option<f64> {
    value?.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_u64(value: Option<&str>) -> Option<u64> {
    value?.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffprobe_payload() {
        let payload = r#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "opus"},
                {"codec_type": "video", "codec_name": "vp9", "width": 1280, "height": 720,
                 "duration": "2.040000", "start_time": "-0.007000"}
            ],
            "format": {"bit_rate": "1450000"}
        }"#;
        let parsed: FfprobeOutput = serde_json::from_str(payload).unwrap();
        let info = parsed.into_media_info();
        assert!(info.has_video);
        assert!(info.has_audio);
        assert_eq!(info.codec.as_deref(), Some("vp9"));
        assert_eq!(info.resolution(), Some((1280, 720)));
        assert!((info.duration_seconds - 2.04).abs() < 1e-9);
        assert!(info.start_time < 0.0);
        assert_eq!(info.bitrate, Some(1_450_000));
    }

    #[test]
    fn audio_only_payload_has_no_video() {
        let payload = r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "3.5"}}"#;
        let parsed: FfprobeOutput = serde_json::from_str(payload).unwrap();
        let info = parsed.into_media_info();
        assert!(!info.has_video);
        assert!((info.duration_seconds - 3.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_binary_reports_unavailable() {
        let probe = FfprobeProbe::new("/nonexistent/ffprobe-binary", Duration::from_secs(1));
        let err = probe.probe(Path::new("/tmp/nothing.mp4")).await.unwrap_err();
        assert!(matches!(err, ProbeError::Unavailable(_)));
    }
}
