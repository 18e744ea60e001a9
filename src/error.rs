use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Device query error: {0}")]
    DeviceQuery(String),

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Transcriber reported success but produced no artifact at {0}")]
    ArtifactMissing(String),

    #[error("Transcription timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Short error kind used in job logs and the batch summary.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Io(_) => "IoError",
            DispatchError::Json(_) => "JsonError",
            DispatchError::Toml(_) => "TomlError",
            DispatchError::DeviceQuery(_) => "DeviceQueryError",
            DispatchError::Staging(_) => "StagingError",
            DispatchError::Transcription(_) => "TranscriptionError",
            DispatchError::ArtifactMissing(_) => "ArtifactMissingError",
            DispatchError::Timeout(_) => "TimeoutError",
            DispatchError::Worker(_) => "WorkerError",
            DispatchError::Config(_) => "ConfigError",
        }
    }

    /// Errors that end the whole batch instead of a single job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::DeviceQuery(_) | DispatchError::Worker(_))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
