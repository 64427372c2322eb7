//! Media type detection from magic bytes, with the file extension as fallback.

use serde::Serialize;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    Document,
    Text,
    Binary,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Self {
        match mime.split('/').next().unwrap_or_default() {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            "image" => MediaKind::Image,
            "text" => MediaKind::Text,
            _ if mime == "application/pdf" || mime == "application/epub+zip" => {
                MediaKind::Document
            }
            _ => MediaKind::Binary,
        }
    }

    /// Kinds `ffprobe` can describe.
    pub fn has_media_info(&self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Audio | MediaKind::Image)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
            MediaKind::Document => "document",
            MediaKind::Text => "text",
            MediaKind::Binary => "binary",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaType {
    pub mime: String,
    pub kind: MediaKind,
    /// Extension including the leading dot, e.g. `.mp4`. Empty when unknown.
    pub extension: String,
}

/// Extension and MIME type for a recognised file signature.
pub(crate) fn sniff(header: &[u8]) -> Option<(&'static str, &'static str)> {
    let starts = |sig: &[u8]| header.starts_with(sig);
    let at = |offset: usize, sig: &[u8]| {
        header.len() >= offset + sig.len() && &header[offset..offset + sig.len()] == sig
    };

    if starts(b"\xFF\xD8\xFF") {
        return Some(("jpg", "image/jpeg"));
    }
    if starts(b"\x89PNG\r\n\x1A\n") {
        return Some(("png", "image/png"));
    }
    if starts(b"GIF87a") || starts(b"GIF89a") {
        return Some(("gif", "image/gif"));
    }
    if starts(b"RIFF") && at(8, b"WEBP") {
        return Some(("webp", "image/webp"));
    }
    if starts(b"RIFF") && at(8, b"WAVE") {
        return Some(("wav", "audio/x-wav"));
    }
    if starts(b"RIFF") && at(8, b"AVI ") {
        return Some(("avi", "video/x-msvideo"));
    }
    if starts(b"BM") && header.len() > 14 {
        return Some(("bmp", "image/bmp"));
    }
    if starts(b"II*\x00") || starts(b"MM\x00*") {
        return Some(("tif", "image/tiff"));
    }
    if at(4, b"ftyp") {
        let brand = header.get(8..12).unwrap_or_default();
        return Some(match brand {
            b"qt  " => ("mov", "video/quicktime"),
            b"M4A " => ("m4a", "audio/mp4"),
            b"M4V " | b"M4VH" | b"M4VP" => ("m4v", "video/x-m4v"),
            b"heic" | b"heix" => ("heic", "image/heic"),
            b"avif" => ("avif", "image/avif"),
            _ => ("mp4", "video/mp4"),
        });
    }
    if starts(b"\x1A\x45\xDF\xA3") {
        let is_webm = header.windows(4).any(|w| w == b"webm");
        return Some(if is_webm {
            ("webm", "video/webm")
        } else {
            ("mkv", "video/x-matroska")
        });
    }
    if starts(b"FLV\x01") {
        return Some(("flv", "video/x-flv"));
    }
    if starts(b"OggS") {
        return Some(("ogg", "audio/ogg"));
    }
    if starts(b"fLaC") {
        return Some(("flac", "audio/x-flac"));
    }
    if starts(b"ID3") || starts(b"\xFF\xFB") || starts(b"\xFF\xF3") || starts(b"\xFF\xF2") {
        return Some(("mp3", "audio/mpeg"));
    }
    if starts(b"%PDF") {
        return Some(("pdf", "application/pdf"));
    }
    if starts(b"PK\x03\x04") {
        return Some(("zip", "application/zip"));
    }
    if starts(b"\x1F\x8B") {
        return Some(("gz", "application/gzip"));
    }
    None
}

/// Extensions a detected format may legitimately carry instead of its own.
fn synonyms(detected: &str) -> &'static [&'static str] {
    match detected {
        "jpg" => &["jpeg", "jpe", "jfif"],
        "tif" => &["tiff"],
        "mp4" => &["m4v", "m4a", "f4v", "3gp"],
        "mov" => &["qt"],
        "mkv" => &["mka", "mk3d"],
        "mp3" => &["mpga"],
        "ogg" => &["oga", "ogv", "opus"],
        "zip" => &["docx", "xlsx", "pptx", "odt", "ods", "epub", "jar", "apk"],
        _ => &[],
    }
}

/// Resolve the media type of `file_name` whose content starts with `header`.
///
/// The detected format wins over the name unless the name's extension is a
/// known synonym of it. Unknown extensions map to `application/x-ext-<ext>`.
pub fn detect(header: &[u8], file_name: &str) -> MediaType {
    let file_ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let ext = match sniff(header) {
        Some((detected, _)) if detected == file_ext => file_ext,
        Some((detected, _)) if synonyms(detected).contains(&file_ext.as_str()) => file_ext,
        Some((detected, mime)) => {
            return MediaType {
                mime: mime.to_string(),
                kind: MediaKind::from_mime(mime),
                extension: format!(".{detected}"),
            }
        }
        None => file_ext,
    };

    if ext.is_empty() {
        return MediaType {
            mime: "application/octet-stream".to_string(),
            kind: MediaKind::Binary,
            extension: String::new(),
        };
    }

    match mime_guess::from_ext(&ext).first() {
        Some(mime) => {
            let mime = mime.essence_str().to_string();
            MediaType {
                kind: MediaKind::from_mime(&mime),
                mime,
                extension: format!(".{ext}"),
            }
        }
        None => MediaType {
            mime: format!("application/x-ext-{ext}"),
            kind: MediaKind::Binary,
            extension: format!(".{ext}"),
        },
    }
}
