//! In-memory [`ClusterApi`] for tests.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{parse_selector, ClusterApi, SecretData, StoredSecret};
use crate::error::IacResult;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    parse_selector(selector)
        .into_iter()
        .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v))
}

#[derive(Default)]
struct Objects {
    /// Name -> (phase, annotations).
    namespaces: BTreeMap<String, (String, BTreeMap<String, String>)>,
    ingress_classes: BTreeSet<String>,
    config_maps: BTreeMap<Key, BTreeMap<String, String>>,
    secrets: BTreeMap<Key, (BTreeMap<String, String>, SecretData)>,
    leases: BTreeMap<Key, String>,
    pvcs: BTreeMap<Key, BTreeMap<String, String>>,
}

/// A cluster held in memory. Namespaces created through the API are `Active`.
#[derive(Default)]
pub struct InMemoryCluster {
    objects: Mutex<Objects>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(self, name: impl Into<String>, phase: impl Into<String>) -> Self {
        self.objects
            .lock()
            .namespaces
            .insert(name.into(), (phase.into(), BTreeMap::new()));
        self
    }

    pub fn with_ingress_class(self, name: impl Into<String>) -> Self {
        self.objects.lock().ingress_classes.insert(name.into());
        self
    }

    pub fn with_config_map<I, K, V>(self, namespace: &str, name: &str, data: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let data = data.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.objects.lock().config_maps.insert(key(namespace, name), data);
        self
    }

    pub fn with_secret(self, namespace: &str, name: &str, entry: &str, value: impl Into<Vec<u8>>) -> Self {
        self.objects
            .lock()
            .secrets
            .entry(key(namespace, name))
            .or_default()
            .1
            .insert(entry.to_string(), value.into());
        self
    }

    pub fn with_lease(self, namespace: &str, name: &str, holder: impl Into<String>) -> Self {
        self.objects.lock().leases.insert(key(namespace, name), holder.into());
        self
    }

    pub fn with_pvc(self, namespace: &str, name: &str, labels: &[(&str, &str)]) -> Self {
        let labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.objects.lock().pvcs.insert(key(namespace, name), labels);
        self
    }

    pub fn namespace_annotations(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.objects.lock().namespaces.get(name).map(|(_, a)| a.clone())
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.objects.lock().config_maps.get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<SecretData> {
        self.objects
            .lock()
            .secrets
            .get(&key(namespace, name))
            .map(|(_, data)| data.clone())
    }

    pub fn secret_labels(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.objects
            .lock()
            .secrets
            .get(&key(namespace, name))
            .map(|(labels, _)| labels.clone())
    }

    pub fn has_lease(&self, namespace: &str, name: &str) -> bool {
        self.objects.lock().leases.contains_key(&key(namespace, name))
    }

    pub fn pvc_names(&self, namespace: &str) -> Vec<String> {
        self.objects
            .lock()
            .pvcs
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn namespace_phase(&self, name: &str) -> IacResult<Option<String>> {
        Ok(self.objects.lock().namespaces.get(name).map(|(phase, _)| phase.clone()))
    }

    async fn create_namespace(&self, name: &str, annotations: &BTreeMap<String, String>) -> IacResult<()> {
        self.objects
            .lock()
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| ("Active".to_string(), annotations.clone()));
        Ok(())
    }

    async fn ingress_class_exists(&self, name: &str) -> IacResult<bool> {
        Ok(self.objects.lock().ingress_classes.contains(name))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> IacResult<Option<BTreeMap<String, String>>> {
        Ok(self.config_map(namespace, name))
    }

    async fn apply_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> IacResult<()> {
        self.objects.lock().config_maps.insert(key(namespace, name), data);
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> IacResult<Option<SecretData>> {
        Ok(self.secret(namespace, name))
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> IacResult<Vec<StoredSecret>> {
        Ok(self
            .objects
            .lock()
            .secrets
            .iter()
            .filter(|((ns, _), (labels, _))| ns == namespace && matches(labels, label_selector))
            .map(|((_, name), (_, data))| StoredSecret {
                name: name.clone(),
                data: data.clone(),
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
        self.objects
            .lock()
            .secrets
            .insert(key(namespace, name), (labels.clone(), data));
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> IacResult<()> {
        self.objects.lock().secrets.remove(&key(namespace, name));
        Ok(())
    }

    async fn lease_holder(&self, namespace: &str, name: &str) -> IacResult<Option<String>> {
        Ok(self
            .objects
            .lock()
            .leases
            .get(&key(namespace, name))
            .filter(|holder| !holder.is_empty())
            .cloned())
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> IacResult<()> {
        self.objects.lock().leases.remove(&key(namespace, name));
        Ok(())
    }

    async fn delete_pvcs(&self, namespace: &str, label_selector: &str) -> IacResult<usize> {
        let mut objects = self.objects.lock();
        let before = objects.pvcs.len();
        objects
            .pvcs
            .retain(|(ns, _), labels| ns != namespace || !matches(labels, label_selector));
        Ok(before - objects.pvcs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_pvcs_honours_selector_and_namespace() {
        let cluster = InMemoryCluster::new()
            .with_pvc("app", "data-web-0", &[("opta.dev/managed", "true"), ("app.kubernetes.io/instance", "app-web")])
            .with_pvc("app", "data-db-0", &[("opta.dev/managed", "true"), ("app.kubernetes.io/instance", "app-db")])
            .with_pvc("other", "data-web-0", &[("opta.dev/managed", "true"), ("app.kubernetes.io/instance", "app-web")]);

        let deleted = cluster
            .delete_pvcs("app", "opta.dev/managed=true,app.kubernetes.io/instance=app-web")
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(cluster.pvc_names("app"), vec!["data-db-0".to_string()]);
        assert_eq!(cluster.pvc_names("other").len(), 1);
    }

    #[tokio::test]
    async fn test_create_namespace_keeps_existing() {
        let cluster = InMemoryCluster::new().with_namespace("app", "Terminating");
        cluster.create_namespace("app", &BTreeMap::new()).await.unwrap();
        assert_eq!(cluster.namespace_phase("app").await.unwrap().as_deref(), Some("Terminating"));
    }
}
