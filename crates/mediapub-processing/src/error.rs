use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    /// The file itself cannot be read; retrying will not help.
    #[error("Cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run ffprobe: {0}")]
    ProbeFailed(String),

    #[error("Failed to parse ffprobe output: {0}")]
    ProbeOutput(#[from] serde_json::Error),
}

pub type AnalyzeResult<T> = Result<T, AnalyzeError>;
