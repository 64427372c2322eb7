use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;

use crate::error::{AnalyzeError, AnalyzeResult};
use crate::media_type::MediaKind;

#[derive(Debug, Deserialize)]
pub(crate) struct FFprobeOutput {
    format: Option<FFprobeFormat>,
    streams: Option<Vec<FFprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

/// Duration in whole seconds and pixel dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaInfo {
    pub duration: u64,
    pub width: u32,
    pub height: u32,
}

pub(crate) async fn inspect(ffprobe_path: &str, file: &Path) -> AnalyzeResult<FFprobeOutput> {
    let output = Command::new(ffprobe_path)
        .args(["-v", "error", "-show_format", "-show_streams", "-of", "json"])
        .arg(file)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| AnalyzeError::ProbeFailed(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AnalyzeError::ProbeFailed(stderr.trim().to_string()));
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

fn parse_seconds(value: Option<&String>) -> Option<f64> {
    value
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

impl FFprobeOutput {
    /// Pick the first stream matching `kind` (images report as `video`).
    pub(crate) fn media_info(&self, kind: MediaKind) -> Option<MediaInfo> {
        let wanted = match kind {
            MediaKind::Image | MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            _ => return None,
        };
        let stream = self
            .streams
            .as_ref()?
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(wanted))?;

        let duration = parse_seconds(self.format.as_ref().and_then(|f| f.duration.as_ref()))
            .or_else(|| parse_seconds(stream.duration.as_ref()))
            .unwrap_or(0.0);

        Some(MediaInfo {
            duration: duration as u64,
            width: stream.width.unwrap_or(0),
            height: stream.height.unwrap_or(0),
        })
    }
}
