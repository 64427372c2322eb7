//! Mediapub Processing Library
//!
//! File analysis ahead of publishing: the media type is sniffed from the
//! file header (falling back to the file name), and for audio, video and
//! images `ffprobe` supplies duration and dimensions.

pub mod analyzer;
pub mod error;
pub mod ffprobe;
pub mod media_type;

pub use analyzer::{Analyzed, Analyzer, HEADER_LEN};
pub use error::{AnalyzeError, AnalyzeResult};
pub use ffprobe::MediaInfo;
pub use media_type::{MediaKind, MediaType};
