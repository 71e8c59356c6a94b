//! Kubernetes objects opta reads and reconciles outside of Terraform.
//!
//! [`ClusterApi`] covers the handful of calls the module hooks and the helm
//! state client make: namespaces, ingress classes, config maps, secrets,
//! Terraform's lock lease and persistent volume claims. [`KubeCluster`]
//! talks to the API server; [`InMemoryCluster`] stands in for it in tests.

mod client;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::IacResult;

pub use client::KubeCluster;
pub use memory::InMemoryCluster;

/// A secret's decoded data.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// A named secret returned by a label query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSecret {
    pub name: String,
    pub data: SecretData,
}

/// Absent objects read as `None` and deletes of absent objects succeed.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// `status.phase` of the namespace.
    async fn namespace_phase(&self, name: &str) -> IacResult<Option<String>>;

    /// Create the namespace unless it already exists.
    async fn create_namespace(&self, name: &str, annotations: &BTreeMap<String, String>) -> IacResult<()>;

    async fn ingress_class_exists(&self, name: &str) -> IacResult<bool>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> IacResult<Option<BTreeMap<String, String>>>;

    /// Create or replace the config map's data.
    async fn apply_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> IacResult<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> IacResult<Option<SecretData>>;

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> IacResult<Vec<StoredSecret>>;

    /// Create or replace an opaque secret.
    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        data: SecretData,
    ) -> IacResult<()>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> IacResult<()>;

    /// `spec.holderIdentity` of a lease, when set.
    async fn lease_holder(&self, namespace: &str, name: &str) -> IacResult<Option<String>>;

    async fn delete_lease(&self, namespace: &str, name: &str) -> IacResult<()>;

    /// Delete the matching persistent volume claims, returning how many went.
    async fn delete_pvcs(&self, namespace: &str, label_selector: &str) -> IacResult<usize>;
}

/// Parse an equality selector such as `a=b,c=d`.
pub(crate) fn parse_selector(selector: &str) -> Vec<(&str, &str)> {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        assert_eq!(
            parse_selector("opta.dev/managed=true, app.kubernetes.io/instance=app-web"),
            vec![("opta.dev/managed", "true"), ("app.kubernetes.io/instance", "app-web")]
        );
        assert!(parse_selector("").is_empty());
    }
}
