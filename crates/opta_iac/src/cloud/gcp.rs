//! GCP: one GCS bucket holds state, config and the lock object.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use opta_runner::{CommandRunner, CommandSpec};

use super::{
    layer_from_key, parse_config, parse_state, run_cli, run_cli_delete, run_cli_optional, CloudClient,
};
use crate::error::{IacError, IacResult};
use crate::kubeconfig::{self, ClusterCredentials, ExecCredential};
use crate::state::{RemoteConfigEntry, StateLocation, StructuredConfig, TerraformState, CONFIG_PREFIX};

pub struct GcpClient {
    location: StateLocation,
    runner: Arc<dyn CommandRunner>,
}

impl GcpClient {
    pub fn new(location: StateLocation, runner: Arc<dyn CommandRunner>) -> Self {
        Self { location, runner }
    }

    fn gcloud(&self) -> CommandSpec {
        let spec = CommandSpec::new("gcloud");
        match self.location.provider_str("project") {
            Some(project) => spec.arg(format!("--project={}", project)),
            None => spec,
        }
    }

    fn gs_uri(&self, key: &str) -> String {
        format!("gs://{}/{}", self.location.state_storage, key)
    }

    fn state_key(&self) -> String {
        format!("{}/default.tfstate", self.location.layer_name)
    }

    fn lock_key(&self) -> String {
        format!("{}/default.tflock", self.location.layer_name)
    }
}

#[async_trait]
impl CloudClient for GcpClient {
    fn location(&self) -> &StateLocation {
        &self.location
    }

    async fn get_remote_config(&self) -> IacResult<Option<StructuredConfig>> {
        let spec = self
            .gcloud()
            .args(["storage", "cat"])
            .arg(self.gs_uri(&self.location.config_key()));
        match run_cli_optional(self.runner.as_ref(), spec, "Reading opta config from GCS").await? {
            Some(content) if !content.trim().is_empty() => Ok(Some(parse_config(&content)?)),
            _ => Ok(None),
        }
    }

    async fn upload_opta_config(&self, config: &StructuredConfig) -> IacResult<()> {
        let spec = self
            .gcloud()
            .args(["storage", "cp", "-"])
            .arg(self.gs_uri(&self.location.config_key()))
            .stdin(serde_json::to_string(config)?);
        run_cli(self.runner.as_ref(), spec, "Uploading opta config to GCS").await?;
        Ok(())
    }

    async fn delete_opta_config(&self) -> IacResult<()> {
        let spec = self
            .gcloud()
            .args(["storage", "rm"])
            .arg(self.gs_uri(&self.location.config_key()));
        run_cli_delete(self.runner.as_ref(), spec, "Deleting opta config from GCS").await
    }

    async fn get_remote_state(&self) -> IacResult<Option<TerraformState>> {
        let spec = self
            .gcloud()
            .args(["storage", "cat"])
            .arg(self.gs_uri(&self.state_key()));
        match run_cli_optional(self.runner.as_ref(), spec, "Reading terraform state from GCS").await? {
            Some(content) => parse_state(&content),
            None => Ok(None),
        }
    }

    async fn delete_remote_state(&self) -> IacResult<()> {
        let spec = self
            .gcloud()
            .args(["storage", "rm"])
            .arg(self.gs_uri(&self.state_key()));
        run_cli_delete(self.runner.as_ref(), spec, "Deleting terraform state from GCS").await?;
        info!("Deleted remote state of {}", self.location.layer_name);
        Ok(())
    }

    /// The lock is the generation number of the `.tflock` object.
    async fn get_terraform_lock_id(&self) -> IacResult<Option<String>> {
        let spec = self
            .gcloud()
            .args(["storage", "objects", "describe", "--format=json"])
            .arg(self.gs_uri(&self.lock_key()));
        let Some(stdout) = run_cli_optional(self.runner.as_ref(), spec, "Reading terraform lock").await?
        else {
            return Ok(None);
        };
        let described: Value = serde_json::from_str(&stdout)?;
        Ok(match &described["generation"] {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    async fn force_delete_terraform_lock(&self) -> IacResult<()> {
        let spec = self
            .gcloud()
            .args(["storage", "rm"])
            .arg(self.gs_uri(&self.lock_key()));
        run_cli_delete(self.runner.as_ref(), spec, "Deleting terraform lock").await
    }

    async fn list_remote_configs(&self) -> IacResult<Vec<RemoteConfigEntry>> {
        list_bucket_configs(self.runner.as_ref(), &self.location.state_storage).await
    }

    async fn delete_state_storage(&self) -> IacResult<()> {
        if !self.location.is_root() {
            return Err(IacError::InvalidConfig(format!(
                "{} is not a root layer; its state bucket belongs to {}",
                self.location.layer_name, self.location.root_layer_name
            )));
        }
        let spec = self
            .gcloud()
            .args(["storage", "rm", "--recursive"])
            .arg(format!("gs://{}", self.location.state_storage));
        run_cli_delete(self.runner.as_ref(), spec, "Deleting state bucket").await?;
        info!("Deleted state bucket {}", self.location.state_storage);
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
        let mut spec = self
            .gcloud()
            .args(["container", "clusters", "describe", "--format=json"])
            .arg(&cluster_name);
        if let Some(region) = self.location.region() {
            spec = spec.arg(format!("--region={}", region));
        }
        let stdout = run_cli(self.runner.as_ref(), spec, "Describing GKE cluster").await?;
        let cluster: Value = serde_json::from_str(&stdout)?;

        let credentials = ClusterCredentials {
            cluster_name: format!("gke_{}", cluster_name),
            endpoint: cluster["endpoint"].as_str().unwrap_or_default().to_string(),
            ca_data: cluster["masterAuth"]["clusterCaCertificate"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            exec: ExecCredential::new("gke-gcloud-auth-plugin"),
        };
        let content = kubeconfig::render(&credentials, &self.get_kube_context_name())?;
        kubeconfig::write(&path, &content).await?;
        Ok(path)
    }

    async fn cluster_exist(&self) -> IacResult<bool> {
        let mut spec = self
            .gcloud()
            .args(["container", "clusters", "describe", "--format=json"])
            .arg(self.location.cluster_name());
        if let Some(region) = self.location.region() {
            spec = spec.arg(format!("--region={}", region));
        }
        Ok(run_cli_optional(self.runner.as_ref(), spec, "Describing GKE cluster")
            .await?
            .is_some())
    }
}

pub(crate) async fn list_bucket_configs(
    runner: &dyn CommandRunner,
    bucket: &str,
) -> IacResult<Vec<RemoteConfigEntry>> {
    let prefix = format!("gs://{}/{}", bucket, CONFIG_PREFIX);
    let spec = CommandSpec::new("gcloud").args(["storage", "ls"]).arg(&prefix);
    let Some(stdout) = run_cli_optional(runner, spec, "Listing opta configs").await? else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for uri in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let key = uri.trim_start_matches(&format!("gs://{}/", bucket)).to_string();
        let Some(layer_name) = layer_from_key(&key) else {
            continue;
        };
        let spec = CommandSpec::new("gcloud").args(["storage", "cat", uri]);
        if let Some(content) = run_cli_optional(runner, spec, "Reading opta config from GCS").await? {
            entries.push(RemoteConfigEntry {
                bucket: bucket.to_string(),
                layer_name: layer_name.to_string(),
                config: parse_config(&content)?,
            });
        }
    }
    Ok(entries)
}

pub(crate) async fn list_state_buckets(runner: &dyn CommandRunner) -> IacResult<Vec<String>> {
    let spec = CommandSpec::new("gcloud").args(["storage", "ls"]);
    let stdout = run_cli(runner, spec, "Listing GCS buckets").await?;
    Ok(stdout
        .lines()
        .map(|l| l.trim().trim_start_matches("gs://").trim_end_matches('/'))
        .filter(|name| name.starts_with(crate::state::STATE_BUCKET_PREFIX))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opta_registry::Cloud;
    use opta_runner::{MockResponse, MockRunner};

    fn client(mock: &MockRunner) -> GcpClient {
        let location = StateLocation::new(Cloud::Google, "staging", "opta-tf-state-acme-staging");
        GcpClient::new(location, Arc::new(mock.clone()))
    }

    #[tokio::test]
    async fn test_lock_id_is_object_generation() {
        let mock = MockRunner::new().on(
            "objects describe",
            MockResponse::success(r#"{"name":"staging/default.tflock","generation":"1650000000000000"}"#),
        );
        let lock = client(&mock).get_terraform_lock_id().await.unwrap();
        assert_eq!(lock.as_deref(), Some("1650000000000000"));
        assert!(mock.was_called("gs://opta-tf-state-acme-staging/staging/default.tflock"));
    }

    #[tokio::test]
    async fn test_missing_lock_object() {
        let mock = MockRunner::new().on(
            "objects describe",
            MockResponse::failure(1, "ERROR: gs://opta-tf-state-acme-staging/staging/default.tflock not found: 404."),
        );
        assert!(client(&mock).get_terraform_lock_id().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_remote_configs() {
        let config = serde_json::to_string(&StructuredConfig::new("0.1.0", "name: app\n")).unwrap();
        let mock = MockRunner::new()
            .on(
                "storage ls",
                MockResponse::success(
                    "gs://opta-tf-state-acme-staging/opta_config/staging\ngs://opta-tf-state-acme-staging/opta_config/app\n",
                ),
            )
            .on("storage cat", MockResponse::success(config));
        let entries = client(&mock).list_remote_configs().await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.layer_name.as_str()).collect();
        assert_eq!(names, vec!["staging", "app"]);
    }
}
