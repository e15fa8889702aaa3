use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("encoder binary not found: {program}")]
    BinaryNotFound { program: String },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("a streaming job is already active: {job_id}")]
    JobAlreadyActive { job_id: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download failed: {0}")]
    Transport(String),

    #[error("encoder process error: {0}")]
    Process(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("encoder install failed: {0}")]
    InstallFailed(String),
}

pub type Result<T> = std::result::Result<T, StreamerError>;
