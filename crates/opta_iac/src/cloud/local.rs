//! Local: state and config as files under `~/.opta/local`, cluster from kind.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use opta_runner::{CommandRunner, CommandSpec};

use super::{parse_config, parse_state, run_cli_optional, CloudClient};
use crate::error::IacResult;
use crate::state::{RemoteConfigEntry, StateLocation, StructuredConfig, TerraformState};

const KIND_CLUSTER: &str = "opta-local-cluster";

pub struct LocalClient {
    location: StateLocation,
    runner: Arc<dyn CommandRunner>,
}

impl LocalClient {
    pub fn new(location: StateLocation, runner: Arc<dyn CommandRunner>) -> Self {
        Self { location, runner }
    }

    fn root(&self) -> PathBuf {
        self.location.opta_home.join("local")
    }

    fn config_dir(&self) -> PathBuf {
        self.root().join("opta_config")
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir().join(&self.location.layer_name)
    }

    /// Matches the `path` the local backend template renders.
    fn state_path(&self) -> PathBuf {
        self.root().join("tfstate").join(&self.location.layer_name)
    }

    fn lock_info_path(&self) -> PathBuf {
        let mut name = self.state_path().into_os_string();
        name.push(".lock.info");
        PathBuf::from(name)
    }
}

async fn read_optional(path: &std::path::Path) -> IacResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_optional(path: &std::path::Path) -> IacResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CloudClient for LocalClient {
    fn location(&self) -> &StateLocation {
        &self.location
    }

    async fn get_remote_config(&self) -> IacResult<Option<StructuredConfig>> {
        match read_optional(&self.config_path()).await? {
            Some(content) if !content.trim().is_empty() => Ok(Some(parse_config(&content)?)),
            _ => Ok(None),
        }
    }

    async fn upload_opta_config(&self, config: &StructuredConfig) -> IacResult<()> {
        tokio::fs::create_dir_all(self.config_dir()).await?;
        tokio::fs::write(self.config_path(), serde_json::to_string_pretty(config)?).await?;
        Ok(())
    }

    async fn delete_opta_config(&self) -> IacResult<()> {
        remove_optional(&self.config_path()).await
    }

    async fn get_remote_state(&self) -> IacResult<Option<TerraformState>> {
        match read_optional(&self.state_path()).await? {
            Some(content) => parse_state(&content),
            None => Ok(None),
        }
    }

    async fn delete_remote_state(&self) -> IacResult<()> {
        remove_optional(&self.state_path()).await?;
        info!("Deleted local state of {}", self.location.layer_name);
        Ok(())
    }

    async fn get_terraform_lock_id(&self) -> IacResult<Option<String>> {
        let Some(content) = read_optional(&self.lock_info_path()).await? else {
            return Ok(None);
        };
        let info: Value = serde_json::from_str(&content)?;
        Ok(info.get("ID").and_then(Value::as_str).map(str::to_string))
    }

    async fn force_delete_terraform_lock(&self) -> IacResult<()> {
        remove_optional(&self.lock_info_path()).await
    }

    async fn list_remote_configs(&self) -> IacResult<Vec<RemoteConfigEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(self.config_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let content = tokio::fs::read_to_string(entry.path()).await?;
            entries.push(RemoteConfigEntry {
                bucket: self.root().to_string_lossy().to_string(),
                layer_name: entry.file_name().to_string_lossy().to_string(),
                config: parse_config(&content)?,
            });
        }
        entries.sort_by(|a, b| a.layer_name.cmp(&b.layer_name));
        Ok(entries)
    }

    async fn delete_state_storage(&self) -> IacResult<()> {
        Ok(())
    }

    async fn set_kube_config(&self) -> IacResult<PathBuf> {
        let path = crate::kubeconfig::kubeconfig_path(
            &self.location.kubeconfig_dir(),
            &self.location.root_layer_name,
            self.location.cloud,
        );
        if crate::kubeconfig::is_fresh(&path) {
            return Ok(path);
        }
        let spec = CommandSpec::new("kind")
            .args(["get", "kubeconfig", "--name", KIND_CLUSTER]);
        let content = super::run_cli(self.runner.as_ref(), spec, "Reading kind kubeconfig").await?;
        crate::kubeconfig::write(&path, &content).await?;
        Ok(path)
    }

    async fn cluster_exist(&self) -> IacResult<bool> {
        let spec = CommandSpec::new("kind").args(["get", "clusters"]);
        Ok(run_cli_optional(self.runner.as_ref(), spec, "Listing kind clusters")
            .await?
            .map(|out| out.lines().any(|l| l.trim() == KIND_CLUSTER))
            .unwrap_or(false))
    }

    fn get_kube_context_name(&self) -> String {
        format!("kind-{}", KIND_CLUSTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opta_registry::Cloud;
    use opta_runner::MockRunner;
    use tempfile::tempdir;

    fn client(home: &std::path::Path, layer: &str) -> LocalClient {
        let location = StateLocation::new(Cloud::Local, layer, "local").with_opta_home(home);
        LocalClient::new(location, Arc::new(MockRunner::new()))
    }

    #[tokio::test]
    async fn test_config_roundtrip_and_listing() {
        let home = tempdir().unwrap();
        let env = client(home.path(), "localopta");
        let app = client(home.path(), "app");
        assert!(env.get_remote_config().await.unwrap().is_none());

        env.upload_opta_config(&StructuredConfig::new("0.1.0", "name: localopta\n"))
            .await
            .unwrap();
        app.upload_opta_config(
            &StructuredConfig::new("0.1.0", "name: app\n").with_parent(Some("localopta".into())),
        )
        .await
        .unwrap();

        let listed = env.list_remote_configs().await.unwrap();
        let names: Vec<_> = listed.iter().map(|e| e.layer_name.as_str()).collect();
        assert_eq!(names, vec!["app", "localopta"]);

        app.delete_opta_config().await.unwrap();
        app.delete_opta_config().await.unwrap();
        assert!(app.get_remote_config().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_info_file() {
        let home = tempdir().unwrap();
        let env = client(home.path(), "localopta");
        assert!(env.get_terraform_lock_id().await.unwrap().is_none());

        let lock = env.lock_info_path();
        std::fs::create_dir_all(lock.parent().unwrap()).unwrap();
        std::fs::write(&lock, r#"{"ID":"d1a2","Path":"x"}"#).unwrap();
        assert_eq!(env.get_terraform_lock_id().await.unwrap().as_deref(), Some("d1a2"));

        env.force_delete_terraform_lock().await.unwrap();
        assert!(env.get_terraform_lock_id().await.unwrap().is_none());
    }
}
