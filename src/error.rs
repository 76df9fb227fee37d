use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ProcessingError {
    #[error("authentication failed (response status: {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("request to record service failed: {0}")]
    Transport(String),

    #[error("record service returned status {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    #[error("invalid spectrum record: {0}")]
    InvalidRecord(String),

    #[error("invalid spectrum id: {0}")]
    InvalidSpectrumId(String),

    #[error("unsupported spectrum format: {0}")]
    UnsupportedFormat(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("peak detection failed: {0}")]
    PeakDetection(String),

    #[error("invalid spectrum metadata: {0}")]
    Metadata(String),

    #[error("missing setting: {0}")]
    MissingSetting(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl ProcessingError {
    /// Errors worth another attempt. Everything else is final for the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessingError::Transport(_))
    }
}

impl From<reqwest::Error> for ProcessingError {
    fn from(err: reqwest::Error) -> Self {
        ProcessingError::Transport(err.to_string())
    }
}
