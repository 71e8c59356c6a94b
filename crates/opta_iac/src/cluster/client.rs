//! [`ClusterApi`] over the Kubernetes API server.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Secret};
use k8s_openapi::api::networking::v1::IngressClass;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use super::{ClusterApi, SecretData, StoredSecret};
use crate::error::{IacError, IacResult};

const FIELD_MANAGER: &str = "opta";

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

fn api_error(operation: &str, err: kube::Error) -> IacError {
    IacError::provider(operation, err)
}

fn decode(data: Option<BTreeMap<String, ByteString>>) -> SecretData {
    data.unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect()
}

/// A client for one kubeconfig context.
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connect with `context` from `kubeconfig`; an empty context uses the
    /// file's current one.
    pub async fn connect(kubeconfig: &Path, context: &str) -> IacResult<Self> {
        debug!("Connecting to cluster via {:?} (context {:?})", kubeconfig, context);
        let raw = Kubeconfig::read_from(kubeconfig).map_err(|e| IacError::provider("Reading kubeconfig", e))?;
        let options = KubeConfigOptions {
            context: (!context.is_empty()).then(|| context.to_string()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(raw, &options)
            .await
            .map_err(|e| IacError::provider("Loading kubeconfig", e))?;
        let client = Client::try_from(config).map_err(|e| api_error("Connecting to cluster", e))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn delete<K>(&self, api: Api<K>, name: &str, operation: &str) -> IacResult<()>
    where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(api_error(operation, e)),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn namespace_phase(&self, name: &str) -> IacResult<Option<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = api
            .get_opt(name)
            .await
            .map_err(|e| api_error("Reading namespace", e))?;
        Ok(namespace.map(|ns| ns.status.and_then(|s| s.phase).unwrap_or_default()))
    }

    async fn create_namespace(&self, name: &str, annotations: &BTreeMap<String, String>) -> IacResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(annotations.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => Ok(()),
            Err(e) => Err(api_error("Creating namespace", e)),
        }
    }

    async fn ingress_class_exists(&self, name: &str) -> IacResult<bool> {
        let api: Api<IngressClass> = Api::all(self.client.clone());
        Ok(api
            .get_opt(name)
            .await
            .map_err(|e| api_error("Reading ingress class", e))?
            .is_some())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> IacResult<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = api
            .get_opt(name)
            .await
            .map_err(|e| api_error("Reading config map", e))?;
        Ok(config_map.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn apply_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> IacResult<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&config_map))
            .await
            .map_err(|e| api_error("Applying config map", e))?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> IacResult<Option<SecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| api_error("Reading secret", e))?;
        Ok(secret.map(|s| decode(s.data)))
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> IacResult<Vec<StoredSecret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let listing = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| api_error("Listing secrets", e))?;
        Ok(listing
            .items
            .into_iter()
            .filter_map(|s| {
                let name = s.metadata.name?;
                Some(StoredSecret {
                    name,
                    data: decode(s.data),
                })
            })
            .collect())
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        data: SecretData,
    ) -> IacResult<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: (!labels.is_empty()).then(|| labels.clone()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            ..Default::default()
        };
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await
            .map_err(|e| api_error("Applying secret", e))?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> IacResult<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        self.delete(api, name, "Deleting secret").await
    }

    async fn lease_holder(&self, namespace: &str, name: &str) -> IacResult<Option<String>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let lease = api
            .get_opt(name)
            .await
            .map_err(|e| api_error("Reading lease", e))?;
        Ok(lease
            .and_then(|l| l.spec)
            .and_then(|spec| spec.holder_identity)
            .filter(|holder| !holder.is_empty()))
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> IacResult<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        self.delete(api, name, "Deleting lease").await
    }

    async fn delete_pvcs(&self, namespace: &str, label_selector: &str) -> IacResult<usize> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let claims = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| api_error("Listing persistent volume claims", e))?;
        let names: Vec<String> = claims.items.into_iter().filter_map(|c| c.metadata.name).collect();
        for name in &names {
            self.delete(api.clone(), name, "Deleting persistent volume claim").await?;
        }
        Ok(names.len())
    }
}
