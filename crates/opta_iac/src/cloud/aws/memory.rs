//! In-memory [`AwsApi`] for tests.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AwsApi, EksCluster};
use crate::error::{IacError, IacResult};

#[derive(Default)]
struct Store {
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    /// Table -> lock ID -> `Info` attribute.
    tables: BTreeMap<String, BTreeMap<String, String>>,
    clusters: BTreeMap<String, EksCluster>,
    deleted_buckets: BTreeSet<String>,
    deleted_tables: BTreeSet<String>,
    failures: BTreeMap<String, String>,
}

/// Buckets, lock tables and clusters held in memory.
///
/// Writes to a bucket that was never added create it, so a test only needs
/// to seed what it reads.
#[derive(Default)]
pub struct InMemoryAws {
    store: Mutex<Store>,
}

impl InMemoryAws {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, bucket: impl Into<String>) -> Self {
        self.store.lock().buckets.entry(bucket.into()).or_default();
        self
    }

    pub fn with_object(self, bucket: impl Into<String>, key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.store
            .lock()
            .buckets
            .entry(bucket.into())
            .or_default()
            .insert(key.into(), body.into());
        self
    }

    /// A lock item as Terraform writes it, with `info` as the JSON `Info`.
    pub fn with_lock(self, table: impl Into<String>, lock_id: impl Into<String>, info: impl Into<String>) -> Self {
        self.store
            .lock()
            .tables
            .entry(table.into())
            .or_default()
            .insert(lock_id.into(), info.into());
        self
    }

    pub fn with_cluster(self, name: impl Into<String>, cluster: EksCluster) -> Self {
        self.store.lock().clusters.insert(name.into(), cluster);
        self
    }

    /// Make every call named `operation` (e.g. `"get_object"`) fail.
    pub fn failing(self, operation: impl Into<String>, message: impl Into<String>) -> Self {
        self.store.lock().failures.insert(operation.into(), message.into());
        self
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.store.lock().buckets.get(bucket)?.get(key).cloned()
    }

    pub fn has_lock(&self, table: &str, lock_id: &str) -> bool {
        self.store
            .lock()
            .tables
            .get(table)
            .is_some_and(|items| items.contains_key(lock_id))
    }

    pub fn bucket_deleted(&self, bucket: &str) -> bool {
        self.store.lock().deleted_buckets.contains(bucket)
    }

    pub fn table_deleted(&self, table: &str) -> bool {
        self.store.lock().deleted_tables.contains(table)
    }

    fn check(&self, operation: &str) -> IacResult<()> {
        match self.store.lock().failures.get(operation) {
            Some(message) => Err(IacError::provider(operation, message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AwsApi for InMemoryAws {
    async fn get_object(&self, bucket: &str, key: &str) -> IacResult<Option<Vec<u8>>> {
        self.check("get_object")?;
        Ok(self.object(bucket, key))
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> IacResult<()> {
        self.check("put_object")?;
        self.store
            .lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> IacResult<()> {
        self.check("delete_object")?;
        if let Some(objects) = self.store.lock().buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> IacResult<Vec<String>> {
        self.check("list_keys")?;
        Ok(self
            .store
            .lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_buckets(&self) -> IacResult<Vec<String>> {
        self.check("list_buckets")?;
        Ok(self.store.lock().buckets.keys().cloned().collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> IacResult<()> {
        self.check("delete_bucket")?;
        let mut store = self.store.lock();
        if store.buckets.remove(bucket).is_some() {
            store.deleted_buckets.insert(bucket.to_string());
        }
        Ok(())
    }

    async fn get_lock_info(&self, table: &str, lock_id: &str) -> IacResult<Option<String>> {
        self.check("get_lock_info")?;
        Ok(self
            .store
            .lock()
            .tables
            .get(table)
            .and_then(|items| items.get(lock_id))
            .cloned())
    }

    async fn delete_lock_item(&self, table: &str, lock_id: &str) -> IacResult<()> {
        self.check("delete_lock_item")?;
        if let Some(items) = self.store.lock().tables.get_mut(table) {
            items.remove(lock_id);
        }
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> IacResult<()> {
        self.check("delete_table")?;
        let mut store = self.store.lock();
        store.tables.remove(table);
        store.deleted_tables.insert(table.to_string());
        Ok(())
    }

    async fn describe_cluster(&self, name: &str) -> IacResult<Option<EksCluster>> {
        self.check("describe_cluster")?;
        Ok(self.store.lock().clusters.get(name).cloned())
    }
}
