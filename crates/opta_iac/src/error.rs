//! Error types for the IaC module.

use thiserror::Error;

/// Result type alias for IaC operations.
pub type IacResult<T> = Result<T, IacError>;

/// Errors that can occur while driving Terraform or talking to a cloud.
#[derive(Error, Debug)]
pub enum IacError {
    #[error("Terraform not available: {0}")]
    TerraformNotAvailable(String),

    #[error("Terraform {command} failed: {message}")]
    TerraformFailed { command: String, message: String },

    #[error("State of layer {layer} is locked by {lock_id}; run `opta force-unlock` if no other run is in progress")]
    StateLocked { layer: String, lock_id: String },

    #[error("Remote state error: {0}")]
    RemoteState(String),

    #[error("{operation} failed: {message}")]
    Provider { operation: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Runner error: {0}")]
    Runner(#[from] opta_runner::RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IacError {
    pub fn provider(operation: impl Into<String>, message: impl ToString) -> Self {
        IacError::Provider {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}
