//! Error types for the registry module.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur while loading or querying the module catalog.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown cloud: {0}")]
    UnknownCloud(String),

    #[error("Cloud {0} has no catalog")]
    CloudNotCatalogued(String),

    #[error("Module type `{module_type}` is not available for cloud {cloud}")]
    UnknownModuleType { cloud: String, module_type: String },

    #[error("Invalid catalog for {cloud}: {message}")]
    InvalidCatalog { cloud: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
