//! Error types for the core module.

use thiserror::Error;

use opta_iac::IacError;
use opta_registry::RegistryError;
use opta_runner::RunnerError;

/// Result type alias for core operations.
pub type OptaResult<T> = Result<T, OptaError>;

/// Coarse classification used by the CLI to decide how to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Something the user can fix in their config or invocation.
    User,
    /// Remote state is missing, locked or unreachable.
    RemoteState,
    /// A cloud or external tool call failed.
    Provider,
    Internal,
}

/// Errors that can occur while loading, processing or deploying a layer.
#[derive(Error, Debug)]
pub enum OptaError {
    #[error("Module {module} is missing required input `{input}`")]
    MissingInput { module: String, input: String },

    #[error("{0}")]
    InvalidName(String),

    #[error("Module type `{module_type}` is not available for cloud {cloud}")]
    UnknownModuleType { cloud: String, module_type: String },

    #[error("Cycle detected while loading parent layers: {0}")]
    CycleDetected(String),

    #[error("Input variable `{0}` has no value; pass it with --var {0}=<value>")]
    UnboundVariable(String),

    #[error("Module {module} refers to {referenced}, which is declared after it")]
    ForwardReference { module: String, referenced: String },

    #[error("The state of layer {layer} is locked (lock id {lock_id}); run `opta force-unlock` once no other run is active")]
    StateLocked { layer: String, lock_id: String },

    #[error("Domain {domain} is not delegated yet: expected name servers {expected:?}, found {actual:?}")]
    DnsDelegationMismatch {
        domain: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Certificate mismatch: {0}")]
    CertificateMismatch(String),

    #[error("Invalid configuration for module {module}: {message}")]
    Validation { module: String, message: String },

    #[error("{0}")]
    User(String),

    #[error("Remote state error: {0}")]
    RemoteState(String),

    #[error("{operation} failed: {message}")]
    Provider { operation: String, message: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Iac(#[from] IacError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OptaError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn validation(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            module: module.into(),
            message: message.into(),
        }
    }

    pub fn provider(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OptaError::MissingInput { .. }
            | OptaError::InvalidName(_)
            | OptaError::UnknownModuleType { .. }
            | OptaError::CycleDetected(_)
            | OptaError::UnboundVariable(_)
            | OptaError::ForwardReference { .. }
            | OptaError::DnsDelegationMismatch { .. }
            | OptaError::CertificateMismatch(_)
            | OptaError::Validation { .. }
            | OptaError::User(_)
            | OptaError::Yaml(_) => ErrorKind::User,
            OptaError::StateLocked { .. } | OptaError::RemoteState(_) => ErrorKind::RemoteState,
            OptaError::Provider { .. } | OptaError::Runner(_) => ErrorKind::Provider,
            OptaError::Registry(RegistryError::UnknownModuleType { .. }) => ErrorKind::User,
            OptaError::Iac(e) => match e {
                IacError::StateLocked { .. } | IacError::RemoteState(_) => ErrorKind::RemoteState,
                IacError::TerraformFailed { .. }
                | IacError::TerraformNotAvailable(_)
                | IacError::Provider { .. }
                | IacError::Runner(_) => ErrorKind::Provider,
                IacError::InvalidConfig(_) => ErrorKind::User,
                _ => ErrorKind::Internal,
            },
            _ => ErrorKind::Internal,
        }
    }

    /// User errors are reported with a one-line cause and no crash details.
    pub fn is_user_error(&self) -> bool {
        self.kind() == ErrorKind::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(OptaError::user("bad").kind(), ErrorKind::User);
        assert_eq!(
            OptaError::StateLocked {
                layer: "staging".into(),
                lock_id: "abc".into()
            }
            .kind(),
            ErrorKind::RemoteState
        );
        assert_eq!(OptaError::provider("Listing", "denied").kind(), ErrorKind::Provider);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(OptaError::from(io).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_unknown_module_type_from_registry_is_user_error() {
        let err: OptaError = RegistryError::UnknownModuleType {
            cloud: "aws".into(),
            module_type: "aws-nope".into(),
        }
        .into();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_state_locked_message_points_to_force_unlock() {
        let err = OptaError::StateLocked {
            layer: "staging".into(),
            lock_id: "abc".into(),
        };
        assert!(err.to_string().contains("opta force-unlock"));
    }
}
