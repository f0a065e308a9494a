use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("UDPST binary not available at {path}: {reason}")]
    BinaryNotFound { path: String, reason: String },

    #[error("Server already running (process {0})")]
    AlreadyRunning(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("Test not found: {0}")]
    NotFound(String),

    #[error("Failed to start process: {0}")]
    ProcessSpawn(String),

    #[error("Server exited during startup: {0}")]
    StartupFailed(String),

    #[error("Test exceeded its time limit of {0}s and was terminated")]
    TimeoutExceeded(u64),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Storage(format!("{err:#}"))
    }
}
