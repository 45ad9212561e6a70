use thiserror::Error;

use crate::{parser::ParseError, runner::RunnerError};

pub type Result<T, E = ScanError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("process error: {0}")]
    Process(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("artifact i/o error: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("a job is already running for {0}")]
    AlreadyRunning(String),
}

impl ScanError {
    /// Stable label persisted in `scan_jobs.failure_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Process(_) => "process",
            Self::Parse(_) => "parse",
            Self::Storage(_) | Self::Artifact(_) => "storage",
            Self::Serialization(_) => "internal",
            Self::NotFound(_) => "not_found",
            Self::AlreadyRunning(_) => "already_running",
        }
    }
}

impl From<RunnerError> for ScanError {
    fn from(e: RunnerError) -> Self {
        Self::Process(e.to_string())
    }
}
