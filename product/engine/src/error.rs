use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid download options: {0}")]
    InvalidOptions(String),

    #[error("a download is already in progress")]
    JobAlreadyRunning,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool could not start: {tool}: {source}")]
    ExternalToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("tool install failed: {0}")]
    InstallFailed(String),
}

impl EngineError {
    /// Maps a spawn failure to the missing-tool variant when the OS reports
    /// the executable as absent.
    pub(crate) fn spawn(tool: impl Into<String>, err: std::io::Error) -> Self {
        let tool = tool.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing { tool },
            _ => EngineError::ExternalToolSpawn { tool, source: err },
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
