//! Azure: a blob container in the layer's storage account.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use tracing::info;

use opta_runner::{CommandRunner, CommandSpec};

use super::{
    layer_from_key, parse_config, parse_state, run_cli, run_cli_delete, run_cli_optional, CloudClient,
};
use crate::error::{IacError, IacResult};
use crate::kubeconfig;
use crate::state::{RemoteConfigEntry, StateLocation, StructuredConfig, TerraformState, CONFIG_PREFIX};

pub struct AzureClient {
    location: StateLocation,
    runner: Arc<dyn CommandRunner>,
}

impl AzureClient {
    pub fn new(location: StateLocation, runner: Arc<dyn CommandRunner>) -> Self {
        Self { location, runner }
    }

    fn storage_account(&self) -> IacResult<&str> {
        self.location
            .provider_str("storage_account_name")
            .ok_or_else(|| {
                IacError::InvalidConfig("azurerm provider needs a storage_account_name".to_string())
            })
    }

    /// Container from the provider block, falling back to the state storage name.
    fn container(&self) -> &str {
        self.location
            .provider_str("container_name")
            .unwrap_or(&self.location.state_storage)
    }

    fn resource_group(&self) -> String {
        format!("opta-{}", self.location.root_layer_name)
    }

    fn blob(&self, action: &[&str], name: &str) -> IacResult<CommandSpec> {
        Ok(CommandSpec::new("az")
            .args(["storage", "blob"])
            .args(action.iter().copied())
            .args(["--account-name", self.storage_account()?])
            .args(["--container-name", self.container()])
            .args(["--name", name])
            .args(["--auth-mode", "login"]))
    }
}

/// Decode the `Terraformlockid` metadata value into the lock token.
pub(crate) fn lock_id_from_metadata(metadata: &Value) -> Option<String> {
    let encoded = metadata.as_object()?.iter().find_map(|(k, v)| {
        if k.eq_ignore_ascii_case("terraformlockid") {
            v.as_str()
        } else {
            None
        }
    })?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let info: Value = serde_json::from_slice(&decoded).ok()?;
    info.get("ID")?.as_str().map(str::to_string)
}

#[async_trait]
impl CloudClient for AzureClient {
    fn location(&self) -> &StateLocation {
        &self.location
    }

    async fn get_remote_config(&self) -> IacResult<Option<StructuredConfig>> {
        let spec = self
            .blob(&["download"], &self.location.config_key())?
            .args(["--file", "/dev/stdout", "--no-progress"]);
        match run_cli_optional(self.runner.as_ref(), spec, "Reading opta config from blob storage").await? {
            Some(content) if !content.trim().is_empty() => Ok(Some(parse_config(&content)?)),
            _ => Ok(None),
        }
    }

    async fn upload_opta_config(&self, config: &StructuredConfig) -> IacResult<()> {
        let spec = self
            .blob(&["upload"], &self.location.config_key())?
            .arg("--data")
            .arg(serde_json::to_string(config)?)
            .arg("--overwrite");
        run_cli(self.runner.as_ref(), spec, "Uploading opta config to blob storage").await?;
        Ok(())
    }

    async fn delete_opta_config(&self) -> IacResult<()> {
        let spec = self.blob(&["delete"], &self.location.config_key())?;
        run_cli_delete(self.runner.as_ref(), spec, "Deleting opta config from blob storage").await
    }

    async fn get_remote_state(&self) -> IacResult<Option<TerraformState>> {
        let spec = self
            .blob(&["download"], &self.location.layer_name)?
            .args(["--file", "/dev/stdout", "--no-progress"]);
        match run_cli_optional(self.runner.as_ref(), spec, "Reading terraform state from blob storage").await? {
            Some(content) => parse_state(&content),
            None => Ok(None),
        }
    }

    async fn delete_remote_state(&self) -> IacResult<()> {
        let spec = self.blob(&["delete"], &self.location.layer_name)?;
        run_cli_delete(self.runner.as_ref(), spec, "Deleting terraform state from blob storage").await?;
        info!("Deleted remote state of {}", self.location.layer_name);
        Ok(())
    }

    async fn get_terraform_lock_id(&self) -> IacResult<Option<String>> {
        let spec = self
            .blob(&["metadata", "show"], &self.location.layer_name)?
            .args(["--output", "json"]);
        let Some(stdout) = run_cli_optional(self.runner.as_ref(), spec, "Reading terraform lock").await?
        else {
            return Ok(None);
        };
        if stdout.trim().is_empty() {
            return Ok(None);
        }
        let metadata: Value = serde_json::from_str(&stdout)?;
        Ok(lock_id_from_metadata(&metadata))
    }

    async fn force_delete_terraform_lock(&self) -> IacResult<()> {
        let account = self.storage_account()?.to_string();
        let spec = CommandSpec::new("az")
            .args(["storage", "blob", "lease", "break"])
            .args(["--account-name", account.as_str()])
            .args(["--container-name", self.container()])
            .args(["--blob-name", self.location.layer_name.as_str()])
            .args(["--auth-mode", "login"]);
        run_cli_delete(self.runner.as_ref(), spec, "Breaking terraform lease").await?;
        let spec = self
            .blob(&["metadata", "update"], &self.location.layer_name)?
            .args(["--metadata", ""]);
        run_cli_delete(self.runner.as_ref(), spec, "Clearing terraform lock metadata").await
    }

    async fn list_remote_configs(&self) -> IacResult<Vec<RemoteConfigEntry>> {
        list_container_configs(self.runner.as_ref(), self.storage_account()?, self.container()).await
    }

    async fn delete_state_storage(&self) -> IacResult<()> {
        if !self.location.is_root() {
            return Err(IacError::InvalidConfig(format!(
                "{} is not a root layer; its state container belongs to {}",
                self.location.layer_name, self.location.root_layer_name
            )));
        }
        let spec = CommandSpec::new("az")
            .args(["storage", "container", "delete"])
            .args(["--account-name", self.storage_account()?])
            .args(["--name", self.container()])
            .args(["--auth-mode", "login"]);
        run_cli_delete(self.runner.as_ref(), spec, "Deleting state container").await?;
        info!("Deleted state container {}", self.container());
        Ok(())
    }

    /// `az` writes the credentials itself; opta only scopes the file.
    async fn set_kube_config(&self) -> IacResult<PathBuf> {
        let path = kubeconfig::kubeconfig_path(
            &self.location.kubeconfig_dir(),
            &self.location.root_layer_name,
            self.location.cloud,
        );
        if kubeconfig::is_fresh(&path) {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let spec = CommandSpec::new("az")
            .args(["aks", "get-credentials", "--overwrite-existing"])
            .arg("--resource-group")
            .arg(self.resource_group())
            .arg("--name")
            .arg(self.location.cluster_name())
            .arg("--file")
            .arg(path.to_string_lossy())
            .arg("--context")
            .arg(self.get_kube_context_name());
        run_cli(self.runner.as_ref(), spec, "Fetching AKS credentials").await?;
        Ok(path)
    }

    async fn cluster_exist(&self) -> IacResult<bool> {
        let spec = CommandSpec::new("az")
            .args(["aks", "show", "--output", "json"])
            .arg("--resource-group")
            .arg(self.resource_group())
            .arg("--name")
            .arg(self.location.cluster_name());
        Ok(run_cli_optional(self.runner.as_ref(), spec, "Describing AKS cluster")
            .await?
            .is_some())
    }
}

pub(crate) async fn list_container_configs(
    runner: &dyn CommandRunner,
    account: &str,
    container: &str,
) -> IacResult<Vec<RemoteConfigEntry>> {
    let spec = CommandSpec::new("az")
        .args(["storage", "blob", "list", "--output", "json"])
        .args(["--account-name", account, "--container-name", container])
        .args(["--prefix", CONFIG_PREFIX, "--auth-mode", "login"]);
    let Some(stdout) = run_cli_optional(runner, spec, "Listing opta configs").await? else {
        return Ok(Vec::new());
    };
    let listing: Value = serde_json::from_str(&stdout)?;
    let names: Vec<String> = listing
        .as_array()
        .map(|blobs| {
            blobs
                .iter()
                .filter_map(|b| b["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let mut entries = Vec::new();
    for name in names {
        let Some(layer_name) = layer_from_key(&name) else {
            continue;
        };
        let spec = CommandSpec::new("az")
            .args(["storage", "blob", "download", "--file", "/dev/stdout", "--no-progress"])
            .args(["--account-name", account, "--container-name", container])
            .args(["--name", name.as_str(), "--auth-mode", "login"]);
        if let Some(content) = run_cli_optional(runner, spec, "Reading opta config from blob storage").await? {
            entries.push(RemoteConfigEntry {
                bucket: container.to_string(),
                layer_name: layer_name.to_string(),
                config: parse_config(&content)?,
            });
        }
    }
    Ok(entries)
}

pub(crate) async fn list_state_containers(
    runner: &dyn CommandRunner,
    account: &str,
) -> IacResult<Vec<String>> {
    let spec = CommandSpec::new("az")
        .args(["storage", "container", "list", "--output", "json"])
        .args(["--account-name", account, "--auth-mode", "login"]);
    let stdout = run_cli(runner, spec, "Listing blob containers").await?;
    let listing: Value = serde_json::from_str(&stdout)?;
    Ok(listing
        .as_array()
        .map(|containers| {
            containers
                .iter()
                .filter_map(|c| c["name"].as_str())
                .filter(|name| name.starts_with(crate::state::STATE_BUCKET_PREFIX))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default())
}
