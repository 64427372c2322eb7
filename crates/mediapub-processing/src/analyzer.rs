use serde::Serialize;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{AnalyzeError, AnalyzeResult};
use crate::ffprobe::{self, MediaInfo};
use crate::media_type::{self, MediaKind, MediaType};

/// Bytes of header inspected for a file signature.
pub const HEADER_LEN: usize = 261;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analyzed {
    pub media_type: MediaType,
    /// Present for audio, video and images when `ffprobe` could read them.
    pub media_info: Option<MediaInfo>,
}

impl Analyzed {
    pub fn mime(&self) -> &str {
        &self.media_type.mime
    }

    pub fn kind(&self) -> MediaKind {
        self.media_type.kind
    }

    pub fn extension(&self) -> &str {
        &self.media_type.extension
    }
}

#[derive(Debug, Clone)]
pub struct Analyzer {
    ffprobe_path: String,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl Analyzer {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// Analyze `path`, using `file_name` (the name the client gave the
    /// upload) for extension-based detection.
    ///
    /// Only an unreadable file is an error. A failed ffprobe run is logged and
    /// leaves `media_info` empty.
    #[tracing::instrument(skip(self, path), fields(file_name = %file_name))]
    pub async fn analyze(&self, path: &Path, file_name: &str) -> AnalyzeResult<Analyzed> {
        let header = read_header(path).await?;
        let media_type = media_type::detect(&header, file_name);

        let media_info = if media_type.kind.has_media_info() {
            match ffprobe::inspect(&self.ffprobe_path, path).await {
                Ok(output) => output.media_info(media_type.kind),
                Err(e) => {
                    tracing::warn!(error = %e, mime = %media_type.mime, "Media info unavailable");
                    None
                }
            }
        } else {
            None
        };

        tracing::debug!(
            mime = %media_type.mime,
            kind = %media_type.kind,
            extension = %media_type.extension,
            media_info = ?media_info,
            "File analyzed"
        );
        Ok(Analyzed {
            media_type,
            media_info,
        })
    }
}

async fn read_header(path: &Path) -> AnalyzeResult<Vec<u8>> {
    let unreadable = |source| AnalyzeError::Unreadable {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).await.map_err(unreadable)?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    (&mut file)
        .take(HEADER_LEN as u64)
        .read_to_end(&mut header)
        .await
        .map_err(unreadable)?;
    Ok(header)
}
