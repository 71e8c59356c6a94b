//! # opta_registry
//!
//! The catalog of module types opta knows how to deploy.
//!
//! Each cloud has a YAML catalog (compiled in from `catalog/`) listing its
//! module types with their inputs, outputs, Terraform module directory and
//! halt flag, plus the cloud's backend and provider templates and macros.
//!
//! ## Example
//!
//! ```rust
//! use opta_registry::{Cloud, Registry};
//!
//! let registry = Registry::embedded().unwrap();
//! let resolved = registry.get_module_type(Cloud::Aws, "postgres").unwrap();
//! assert_eq!(resolved.spec.name, "aws-postgres");
//! ```

pub mod error;
pub mod models;
pub mod reader;
pub mod registry;
pub mod validator;

pub use error::{RegistryError, RegistryResult};
pub use models::{
    BackendTemplate, Cloud, CloudCatalog, InputSpec, ModuleTypeSpec, OutputSpec,
    ResolvedModuleType,
};
pub use reader::CatalogReader;
pub use registry::Registry;
pub use validator::{CatalogValidator, ValidationResult};
