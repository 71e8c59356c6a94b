//! AWS: S3 bucket for state and config, DynamoDB table for the lock.

mod memory;
mod sdk;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::{layer_from_key, parse_config, parse_state, CloudClient};
use crate::error::{IacError, IacResult};
use crate::kubeconfig::{self, ClusterCredentials, ExecCredential};
use crate::state::{RemoteConfigEntry, StateLocation, StructuredConfig, TerraformState, CONFIG_PREFIX};

pub use memory::InMemoryAws;
pub use sdk::SdkAws;

/// Hash key of Terraform's DynamoDB lock table.
pub(crate) const LOCK_KEY_ATTRIBUTE: &str = "LockID";

/// What opta needs from an EKS cluster to write a kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EksCluster {
    pub arn: String,
    pub endpoint: String,
    pub ca_data: String,
}

/// The S3, DynamoDB and EKS calls behind [`AwsClient`].
///
/// Reads of absent objects, items, tables and clusters return `None`;
/// deletes of absent ones succeed.
#[async_trait]
pub trait AwsApi: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> IacResult<Option<Vec<u8>>>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> IacResult<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> IacResult<()>;

    /// Keys under `prefix`; empty when the bucket does not exist.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> IacResult<Vec<String>>;

    async fn list_buckets(&self) -> IacResult<Vec<String>>;

    /// Empty the bucket, then remove it.
    async fn delete_bucket(&self, bucket: &str) -> IacResult<()>;

    /// The `Info` attribute of the lock item `lock_id`.
    async fn get_lock_info(&self, table: &str, lock_id: &str) -> IacResult<Option<String>>;

    async fn delete_lock_item(&self, table: &str, lock_id: &str) -> IacResult<()>;

    async fn delete_table(&self, table: &str) -> IacResult<()>;

    async fn describe_cluster(&self, name: &str) -> IacResult<Option<EksCluster>>;
}

pub struct AwsClient {
    location: StateLocation,
    api: Arc<dyn AwsApi>,
}

impl AwsClient {
    pub fn new(location: StateLocation, api: Arc<dyn AwsApi>) -> Self {
        Self { location, api }
    }

    fn bucket(&self) -> &str {
        &self.location.state_storage
    }

    /// ID of the item Terraform writes while holding the lock.
    fn lock_item_id(&self) -> String {
        format!("{}/{}", self.bucket(), self.location.layer_name)
    }

    /// ID of the item holding the state's MD5 digest.
    fn digest_item_id(&self) -> String {
        format!("{}-md5", self.lock_item_id())
    }

    async fn read_object(&self, key: &str) -> IacResult<Option<String>> {
        Ok(self
            .api
            .get_object(self.bucket(), key)
            .await?
            .map(|body| String::from_utf8_lossy(&body).into_owned()))
    }
}

/// The lock ID inside the JSON `Info` attribute of a lock item.
pub(crate) fn lock_id_from_info(info: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(info).ok()?;
    parsed.get("ID")?.as_str().map(str::to_string)
}

#[async_trait]
impl CloudClient for AwsClient {
    fn location(&self) -> &StateLocation {
        &self.location
    }

    async fn get_remote_config(&self) -> IacResult<Option<StructuredConfig>> {
        match self.read_object(&self.location.config_key()).await? {
            Some(content) if !content.trim().is_empty() => Ok(Some(parse_config(&content)?)),
            _ => Ok(None),
        }
    }

    async fn upload_opta_config(&self, config: &StructuredConfig) -> IacResult<()> {
        let body = serde_json::to_vec(config)?;
        self.api
            .put_object(self.bucket(), &self.location.config_key(), body)
            .await?;
        debug!("Uploaded opta config for {}", self.location.layer_name);
        Ok(())
    }

    async fn delete_opta_config(&self) -> IacResult<()> {
        self.api
            .delete_object(self.bucket(), &self.location.config_key())
            .await
    }

    async fn get_remote_state(&self) -> IacResult<Option<TerraformState>> {
        match self.read_object(&self.location.layer_name).await? {
            Some(content) => parse_state(&content),
            None => Ok(None),
        }
    }

    async fn delete_remote_state(&self) -> IacResult<()> {
        self.api
            .delete_object(self.bucket(), &self.location.layer_name)
            .await?;
        self.api
            .delete_lock_item(self.bucket(), &self.digest_item_id())
            .await?;
        info!("Deleted remote state of {}", self.location.layer_name);
        Ok(())
    }

    async fn get_terraform_lock_id(&self) -> IacResult<Option<String>> {
        let info = self
            .api
            .get_lock_info(self.bucket(), &self.lock_item_id())
            .await?;
        Ok(info.as_deref().and_then(lock_id_from_info))
    }

    async fn force_delete_terraform_lock(&self) -> IacResult<()> {
        self.api
            .delete_lock_item(self.bucket(), &self.lock_item_id())
            .await
    }

    async fn list_remote_configs(&self) -> IacResult<Vec<RemoteConfigEntry>> {
        list_bucket_configs(self.api.as_ref(), self.bucket()).await
    }

    async fn delete_state_storage(&self) -> IacResult<()> {
        if !self.location.is_root() {
            return Err(IacError::InvalidConfig(format!(
                "{} is not a root layer; its state bucket belongs to {}",
                self.location.layer_name, self.location.root_layer_name
            )));
        }
        self.api.delete_bucket(self.bucket()).await?;
        self.api.delete_table(self.bucket()).await?;
        info!("Deleted state bucket {}", self.bucket());
        Ok(())
    }

    async fn set_kube_config(&self) -> IacResult<PathBuf> {
        let path = kubeconfig::kubeconfig_path(
            &self.location.kubeconfig_dir(),
            &self.location.root_layer_name,
            self.location.cloud,
        );
        if kubeconfig::is_fresh(&path) {
            debug!("Reusing kubeconfig {:?}", path);
            return Ok(path);
        }

        let cluster_name = self.location.cluster_name();
        let cluster = self.api.describe_cluster(&cluster_name).await?.ok_or_else(|| {
            IacError::provider("Describing EKS cluster", format!("cluster {} does not exist", cluster_name))
        })?;

        let mut exec = ExecCredential::new("aws").args(["eks", "get-token", "--cluster-name", cluster_name.as_str()]);
        if let Some(region) = self.location.region() {
            exec = exec.args(["--region", region]);
        }
        let credentials = ClusterCredentials {
            cluster_name: cluster.arn,
            endpoint: cluster.endpoint,
            ca_data: cluster.ca_data,
            exec,
        };
        let content = kubeconfig::render(&credentials, &self.get_kube_context_name())?;
        kubeconfig::write(&path, &content).await?;
        Ok(path)
    }

    async fn cluster_exist(&self) -> IacResult<bool> {
        Ok(self
            .api
            .describe_cluster(&self.location.cluster_name())
            .await?
            .is_some())
    }
}

/// Read every structured config in an S3 state bucket.
pub(crate) async fn list_bucket_configs(api: &dyn AwsApi, bucket: &str) -> IacResult<Vec<RemoteConfigEntry>> {
    let mut entries = Vec::new();
    for key in api.list_keys(bucket, CONFIG_PREFIX).await? {
        let Some(layer_name) = layer_from_key(&key) else {
            continue;
        };
        if let Some(body) = api.get_object(bucket, &key).await? {
            entries.push(RemoteConfigEntry {
                bucket: bucket.to_string(),
                layer_name: layer_name.to_string(),
                config: parse_config(&String::from_utf8_lossy(&body))?,
            });
        }
    }
    Ok(entries)
}

/// Names of every opta state bucket visible to the caller.
pub(crate) async fn list_state_buckets(api: &dyn AwsApi) -> IacResult<Vec<String>> {
    Ok(api
        .list_buckets()
        .await?
        .into_iter()
        .filter(|name| name.starts_with(crate::state::STATE_BUCKET_PREFIX))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opta_registry::Cloud;
    use serde_json::{json, Map};

    const BUCKET: &str = "opta-tf-state-acme-staging";

    fn client(api: &Arc<InMemoryAws>) -> AwsClient {
        let mut provider = Map::new();
        provider.insert("region".into(), json!("us-east-1"));
        let location = StateLocation::new(Cloud::Aws, "staging", BUCKET)
            .with_org("acme")
            .with_provider(provider);
        AwsClient::new(location, api.clone())
    }

    #[tokio::test]
    async fn test_lock_id_read_from_lock_item() {
        let api = Arc::new(InMemoryAws::new().with_lock(
            BUCKET,
            "opta-tf-state-acme-staging/staging",
            r#"{"ID":"7a1f","Operation":"OperationTypeApply"}"#,
        ));
        let lock = client(&api).get_terraform_lock_id().await.unwrap();
        assert_eq!(lock.as_deref(), Some("7a1f"));
    }

    #[tokio::test]
    async fn test_no_lock_when_item_absent() {
        let api = Arc::new(InMemoryAws::new());
        assert!(client(&api).get_terraform_lock_id().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_config_is_none() {
        let api = Arc::new(InMemoryAws::new().with_bucket(BUCKET));
        assert!(client(&api).get_remote_config().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upload_writes_config_key() {
        let api = Arc::new(InMemoryAws::new());
        let config = StructuredConfig::new("0.1.0", "name: staging\n");
        client(&api).upload_opta_config(&config).await.unwrap();

        let stored = api.object(BUCKET, "opta_config/staging").unwrap();
        assert!(String::from_utf8(stored).unwrap().contains("\"original_spec\""));
        let read = client(&api).get_remote_config().await.unwrap().unwrap();
        assert_eq!(read.original_spec, "name: staging\n");
    }

    #[tokio::test]
    async fn test_access_denied_is_provider_error() {
        let api = Arc::new(InMemoryAws::new().failing("get_object", "AccessDenied"));
        let err = client(&api).get_remote_config().await.unwrap_err();
        assert!(matches!(err, IacError::Provider { .. }));
    }

    #[tokio::test]
    async fn test_delete_remote_state_drops_digest_item() {
        let api = Arc::new(
            InMemoryAws::new()
                .with_object(BUCKET, "staging", r#"{"serial": 1, "resources": []}"#)
                .with_lock(BUCKET, "opta-tf-state-acme-staging/staging-md5", "d41d8cd9"),
        );
        client(&api).delete_remote_state().await.unwrap();
        assert!(api.object(BUCKET, "staging").is_none());
        assert!(!api.has_lock(BUCKET, "opta-tf-state-acme-staging/staging-md5"));
    }

    #[tokio::test]
    async fn test_state_storage_only_dropped_for_root() {
        let api = Arc::new(InMemoryAws::new().with_bucket(BUCKET));
        let child = AwsClient::new(
            StateLocation::new(Cloud::Aws, "app", BUCKET).with_root("staging"),
            api.clone(),
        );
        assert!(matches!(
            child.delete_state_storage().await.unwrap_err(),
            IacError::InvalidConfig(_)
        ));

        client(&api).delete_state_storage().await.unwrap();
        assert!(api.bucket_deleted(BUCKET));
        assert!(api.table_deleted(BUCKET));
    }

    #[tokio::test]
    async fn test_cluster_exist_follows_describe() {
        let api = Arc::new(InMemoryAws::new());
        assert!(!client(&api).cluster_exist().await.unwrap());

        let api = Arc::new(InMemoryAws::new().with_cluster(
            "opta-staging",
            EksCluster {
                arn: "arn:aws:eks:us-east-1:123456789012:cluster/opta-staging".into(),
                endpoint: "https://eks.example".into(),
                ca_data: "Y2E=".into(),
            },
        ));
        assert!(client(&api).cluster_exist().await.unwrap());
    }

    #[tokio::test]
    async fn test_list_state_buckets_filters_prefix() {
        let api = InMemoryAws::new().with_bucket(BUCKET).with_bucket("website-assets");
        assert_eq!(list_state_buckets(&api).await.unwrap(), vec![BUCKET.to_string()]);
    }

    #[test]
    fn test_lock_id_from_info() {
        assert_eq!(lock_id_from_info(r#"{"ID":"e0c1"}"#).as_deref(), Some("e0c1"));
        assert_eq!(lock_id_from_info("not json"), None);
    }
}
