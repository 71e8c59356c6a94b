//! Enumerate structured configs across every opta state bucket of a cloud.

use opta_registry::Cloud;
use tracing::debug;

use crate::cloud::{self, CloudConnector};
use crate::error::{IacError, IacResult};
use crate::state::RemoteConfigEntry;

/// Where to look when listing configs.
#[derive(Debug, Clone, Default)]
pub struct InventoryScope {
    pub region: Option<String>,
    /// Storage account to scan (Azure only).
    pub storage_account: Option<String>,
}

pub async fn list_all_configs(
    cloud: Cloud,
    connector: &CloudConnector,
    scope: &InventoryScope,
) -> IacResult<Vec<RemoteConfigEntry>> {
    let runner = connector.runner();
    let runner = runner.as_ref();
    let mut entries = Vec::new();
    match cloud {
        Cloud::Aws => {
            let api = connector.aws(scope.region.as_deref());
            for bucket in cloud::aws_list_state_buckets(api.as_ref()).await? {
                debug!("Scanning {}", bucket);
                entries.extend(cloud::aws_list_bucket_configs(api.as_ref(), &bucket).await?);
            }
        }
        Cloud::Google => {
            for bucket in cloud::gcp_list_state_buckets(runner).await? {
                debug!("Scanning {}", bucket);
                entries.extend(cloud::gcp_list_bucket_configs(runner, &bucket).await?);
            }
        }
        Cloud::Azurerm => {
            let account = scope.storage_account.as_deref().ok_or_else(|| {
                IacError::InvalidConfig("listing azure configs needs a storage account".to_string())
            })?;
            for container in cloud::azure_list_state_containers(runner, account).await? {
                debug!("Scanning {}", container);
                entries.extend(cloud::azure_list_container_configs(runner, account, &container).await?);
            }
        }
        Cloud::Local | Cloud::Helm => {
            return Err(IacError::InvalidConfig(format!(
                "listing configs is not supported for {}",
                cloud
            )))
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::InMemoryAws;
    use crate::state::StructuredConfig;
    use opta_runner::MockRunner;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_aws_inventory_filters_state_buckets() {
        let config = serde_json::to_string(&StructuredConfig::new("0.1.0", "name: staging\n")).unwrap();
        let api = InMemoryAws::new()
            .with_object("opta-tf-state-acme-staging", "opta_config/staging", config.clone())
            .with_object("opta-tf-state-acme-staging", "staging", "{}")
            .with_object("website-assets", "opta_config/site", config);
        let connector = CloudConnector::new(Arc::new(MockRunner::new())).with_aws(Arc::new(api));

        let entries = list_all_configs(Cloud::Aws, &connector, &InventoryScope::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bucket, "opta-tf-state-acme-staging");
        assert_eq!(entries[0].layer_name, "staging");
    }

    #[tokio::test]
    async fn test_azure_requires_account() {
        let connector = CloudConnector::new(Arc::new(MockRunner::new()));
        let err = list_all_configs(Cloud::Azurerm, &connector, &InventoryScope::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IacError::InvalidConfig(_)));
    }
}
