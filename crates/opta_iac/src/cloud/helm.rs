//! Helm: a bring-your-own cluster. Config lives in a Kubernetes secret and
//! state in Terraform's `kubernetes` backend.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{parse_config, CloudClient, CloudConnector};
use crate::cluster::{ClusterApi, SecretData};
use crate::error::{IacError, IacResult};
use crate::state::{RemoteConfigEntry, StateLocation, StructuredConfig, TerraformState};

const NAMESPACE: &str = "default";
const CONFIG_LABEL: &str = "opta.dev/config";
const CONFIG_SECRET_PREFIX: &str = "opta-config-";

pub struct HelmClient {
    location: StateLocation,
    connector: CloudConnector,
    cluster: OnceCell<Arc<dyn ClusterApi>>,
}

impl HelmClient {
    pub fn new(location: StateLocation, connector: CloudConnector) -> Self {
        Self {
            location,
            connector,
            cluster: OnceCell::new(),
        }
    }

    async fn cluster(&self) -> IacResult<&Arc<dyn ClusterApi>> {
        self.cluster
            .get_or_try_init(|| async {
                let kubeconfig = self.kubeconfig_path()?;
                self.connector
                    .cluster(&kubeconfig, &self.get_kube_context_name())
                    .await
            })
            .await
    }

    /// The caller's kubeconfig: the provider's `kubeconfig`, then the first
    /// `KUBECONFIG` entry, then `~/.kube/config`.
    fn kubeconfig_path(&self) -> IacResult<PathBuf> {
        if let Some(path) = self.location.provider_str("kubeconfig") {
            return Ok(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("KUBECONFIG") {
            if let Some(first) = std::env::split_paths(&path).next() {
                return Ok(first);
            }
        }
        let home = std::env::var("HOME").map_err(|_| {
            IacError::InvalidConfig("HOME is not set and no kubeconfig was given".to_string())
        })?;
        Ok(PathBuf::from(home).join(".kube").join("config"))
    }

    fn config_secret(&self) -> String {
        format!("{}{}", CONFIG_SECRET_PREFIX, self.location.layer_name)
    }

    fn state_secret(&self) -> String {
        format!("tfstate-default-{}", self.location.layer_name)
    }

    fn lock_lease(&self) -> String {
        format!("lock-tfstate-default-{}", self.location.layer_name)
    }
}

fn decode_config_secret(data: &SecretData) -> IacResult<Option<StructuredConfig>> {
    match data.get("config") {
        Some(content) => Ok(Some(parse_config(&String::from_utf8_lossy(content))?)),
        None => Ok(None),
    }
}

#[async_trait]
impl CloudClient for HelmClient {
    fn location(&self) -> &StateLocation {
        &self.location
    }

    async fn get_remote_config(&self) -> IacResult<Option<StructuredConfig>> {
        let secret = self
            .cluster()
            .await?
            .get_secret(NAMESPACE, &self.config_secret())
            .await?;
        match secret {
            Some(data) => decode_config_secret(&data),
            None => Ok(None),
        }
    }

    async fn upload_opta_config(&self, config: &StructuredConfig) -> IacResult<()> {
        let labels = BTreeMap::from([(CONFIG_LABEL.to_string(), "true".to_string())]);
        let data = BTreeMap::from([("config".to_string(), serde_json::to_vec(config)?)]);
        self.cluster()
            .await?
            .apply_secret(NAMESPACE, &self.config_secret(), &labels, data)
            .await
    }

    async fn delete_opta_config(&self) -> IacResult<()> {
        self.cluster()
            .await?
            .delete_secret(NAMESPACE, &self.config_secret())
            .await
    }

    /// The kubernetes backend gzips state inside its secret, so outputs are
    /// read through `terraform output` instead.
    async fn get_remote_state(&self) -> IacResult<Option<TerraformState>> {
        debug!("Remote state of helm layers is read through terraform");
        Ok(None)
    }

    async fn delete_remote_state(&self) -> IacResult<()> {
        self.cluster()
            .await?
            .delete_secret(NAMESPACE, &self.state_secret())
            .await
    }

    async fn get_terraform_lock_id(&self) -> IacResult<Option<String>> {
        self.cluster()
            .await?
            .lease_holder(NAMESPACE, &self.lock_lease())
            .await
    }

    async fn force_delete_terraform_lock(&self) -> IacResult<()> {
        self.cluster()
            .await?
            .delete_lease(NAMESPACE, &self.lock_lease())
            .await
    }

    async fn list_remote_configs(&self) -> IacResult<Vec<RemoteConfigEntry>> {
        let secrets = self
            .cluster()
            .await?
            .list_secrets(NAMESPACE, &format!("{}=true", CONFIG_LABEL))
            .await?;
        let mut entries = Vec::new();
        for secret in secrets {
            let Some(layer_name) = secret.name.strip_prefix(CONFIG_SECRET_PREFIX) else {
                continue;
            };
            if let Some(config) = decode_config_secret(&secret.data)? {
                entries.push(RemoteConfigEntry {
                    bucket: NAMESPACE.to_string(),
                    layer_name: layer_name.to_string(),
                    config,
                });
            }
        }
        Ok(entries)
    }

    async fn delete_state_storage(&self) -> IacResult<()> {
        Ok(())
    }

    /// Uses the caller's kubeconfig as is.
    async fn set_kube_config(&self) -> IacResult<PathBuf> {
        self.kubeconfig_path()
    }

    async fn cluster_exist(&self) -> IacResult<bool> {
        Ok(true)
    }

    fn get_kube_context_name(&self) -> String {
        self.location
            .provider_str("kube_context")
            .unwrap_or_default()
            .to_string()
    }
}
