//! Catalog file reading utilities.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::models::{Cloud, CloudCatalog};

/// Catalogs compiled into the binary.
pub const EMBEDDED_CATALOGS: [(Cloud, &str); 5] = [
    (Cloud::Aws, include_str!("../catalog/aws.yaml")),
    (Cloud::Google, include_str!("../catalog/google.yaml")),
    (Cloud::Azurerm, include_str!("../catalog/azurerm.yaml")),
    (Cloud::Local, include_str!("../catalog/local.yaml")),
    (Cloud::Helm, include_str!("../catalog/helm.yaml")),
];

/// Reader for catalog files.
pub struct CatalogReader;

impl CatalogReader {
    /// Parse one cloud's catalog from YAML text.
    pub fn parse(cloud: Cloud, content: &str) -> RegistryResult<CloudCatalog> {
        let catalog: CloudCatalog = serde_yaml::from_str(content)?;
        if catalog.cloud != cloud {
            return Err(RegistryError::InvalidCatalog {
                cloud: cloud.to_string(),
                message: format!("catalog declares cloud {}", catalog.cloud),
            });
        }
        Ok(catalog)
    }

    /// Read `<dir>/<cloud>.yaml` for every cloud present in the directory.
    pub fn read_dir(dir: impl AsRef<Path>) -> RegistryResult<Vec<CloudCatalog>> {
        let dir = dir.as_ref();
        let mut catalogs = Vec::new();
        for cloud in Cloud::all() {
            let path = dir.join(format!("{}.yaml", cloud));
            if !path.exists() {
                continue;
            }
            debug!("Reading catalog from {:?}", path);
            let content = fs::read_to_string(&path)?;
            catalogs.push(Self::parse(cloud, &content)?);
        }
        Ok(catalogs)
    }

    /// Parse every embedded catalog.
    pub fn embedded() -> RegistryResult<Vec<CloudCatalog>> {
        EMBEDDED_CATALOGS
            .iter()
            .map(|(cloud, content)| Self::parse(*cloud, content))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_rejects_mismatched_cloud() {
        let content = "cloud: google\nbackend:\n  kind: gcs\n";
        let result = CatalogReader::parse(Cloud::Aws, content);
        assert!(matches!(result, Err(RegistryError::InvalidCatalog { .. })));
    }

    #[test]
    fn test_read_dir_skips_missing_clouds() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("local.yaml"),
            "cloud: local\nbackend:\n  kind: local\nmodules:\n  - name: local-base\n",
        )
        .unwrap();
        let catalogs = CatalogReader::read_dir(dir.path()).unwrap();
        assert_eq!(catalogs.len(), 1);
        assert_eq!(catalogs[0].cloud, Cloud::Local);
        assert_eq!(catalogs[0].modules[0].name, "local-base");
    }

    #[test]
    fn test_embedded_catalogs_parse() {
        let catalogs = CatalogReader::embedded().unwrap();
        assert_eq!(catalogs.len(), 5);
    }
}
