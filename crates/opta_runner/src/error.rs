//! Error types for the runner module.

use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur while running external commands.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Program not available: {0}")]
    ProgramNotAvailable(String),

    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Command `{command}` exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        command: String,
        exit_code: i64,
        stderr: String,
    },

    #[error("Command timeout after {0} seconds")]
    Timeout(u64),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
