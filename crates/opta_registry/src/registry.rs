//! Read-only catalog of module types, keyed by cloud.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::models::{BackendTemplate, Cloud, CloudCatalog, ModuleTypeSpec, ResolvedModuleType};
use crate::reader::CatalogReader;
use crate::validator::CatalogValidator;

/// The module type registry.
///
/// Built once at startup and shared read-only for the rest of the process.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    catalogs: BTreeMap<Cloud, CloudCatalog>,
}

impl Registry {
    /// Build a registry from parsed catalogs, validating each one.
    pub fn from_catalogs(catalogs: Vec<CloudCatalog>) -> RegistryResult<Self> {
        let mut registry = Self::default();
        for catalog in catalogs {
            let result = CatalogValidator::validate(&catalog);
            if !result.valid {
                return Err(RegistryError::InvalidCatalog {
                    cloud: catalog.cloud.to_string(),
                    message: result.errors.join("; "),
                });
            }
            debug!(
                "Registered {} module types for {}",
                catalog.modules.len(),
                catalog.cloud
            );
            registry.catalogs.insert(catalog.cloud, catalog);
        }
        Ok(registry)
    }

    /// The catalog compiled into the binary.
    pub fn embedded() -> RegistryResult<Self> {
        Self::from_catalogs(CatalogReader::embedded()?)
    }

    /// Load catalogs from a directory instead of the embedded copy.
    pub fn from_dir(dir: impl AsRef<Path>) -> RegistryResult<Self> {
        Self::from_catalogs(CatalogReader::read_dir(dir)?)
    }

    pub fn catalog(&self, cloud: Cloud) -> RegistryResult<&CloudCatalog> {
        self.catalogs
            .get(&cloud)
            .ok_or_else(|| RegistryError::CloudNotCatalogued(cloud.to_string()))
    }

    pub fn clouds(&self) -> Vec<Cloud> {
        self.catalogs.keys().copied().collect()
    }

    /// Look up a module type by canonical name or alias.
    pub fn get_module_type(
        &self,
        cloud: Cloud,
        type_name: &str,
    ) -> RegistryResult<ResolvedModuleType<'_>> {
        let catalog = self.catalog(cloud)?;
        if let Some(spec) = catalog.modules.iter().find(|m| m.name == type_name) {
            return Ok(ResolvedModuleType {
                spec,
                aliased_type: None,
            });
        }
        catalog
            .modules
            .iter()
            .find(|m| m.aliases.iter().any(|a| a == type_name))
            .map(|spec| ResolvedModuleType {
                spec,
                aliased_type: spec.aliases.iter().find(|a| *a == type_name).map(String::as_str),
            })
            .ok_or_else(|| RegistryError::UnknownModuleType {
                cloud: cloud.to_string(),
                module_type: type_name.to_string(),
            })
    }

    pub fn contains(&self, cloud: Cloud, type_name: &str) -> bool {
        self.get_module_type(cloud, type_name).is_ok()
    }

    pub fn module_types(&self, cloud: Cloud) -> RegistryResult<&[ModuleTypeSpec]> {
        Ok(&self.catalog(cloud)?.modules)
    }

    pub fn backend(&self, cloud: Cloud) -> RegistryResult<&BackendTemplate> {
        Ok(&self.catalog(cloud)?.backend)
    }

    pub fn macro_fragment(&self, cloud: Cloud, key: &str) -> Option<&[Value]> {
        self.catalogs
            .get(&cloud)
            .and_then(|c| c.macros.get(key))
            .map(Vec::as_slice)
    }

    pub fn macro_keys(&self, cloud: Cloud) -> Vec<&str> {
        self.catalogs
            .get(&cloud)
            .map(|c| c.macros.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}
