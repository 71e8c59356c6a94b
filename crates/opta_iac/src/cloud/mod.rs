//! Cloud state clients.
//!
//! Each cloud keeps a layer's Terraform state and opta's structured config
//! in provider storage. The clients here read and write that storage, find
//! Terraform's lock, and produce a kubeconfig for the layer's cluster.
//!
//! AWS goes through the SDK ([`AwsApi`]) and helm layers through the
//! Kubernetes API ([`ClusterApi`]). GCP and Azure use their CLIs via a
//! [`CommandRunner`], as does kind for local layers.

mod aws;
mod azure;
mod gcp;
mod helm;
mod local;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use opta_registry::Cloud;
use opta_runner::{CommandRunner, CommandSpec, RunConfig, RunnerError};

use crate::cluster::{ClusterApi, KubeCluster};
use crate::error::{IacError, IacResult};
use crate::state::{RemoteConfigEntry, StateLocation, StructuredConfig, TerraformState};

pub use aws::{AwsApi, AwsClient, EksCluster, InMemoryAws, SdkAws};
pub use azure::AzureClient;
pub use gcp::GcpClient;
pub use helm::HelmClient;
pub use local::LocalClient;

pub(crate) use aws::{list_bucket_configs as aws_list_bucket_configs, list_state_buckets as aws_list_state_buckets};
pub(crate) use azure::{
    list_container_configs as azure_list_container_configs,
    list_state_containers as azure_list_state_containers,
};
pub(crate) use gcp::{list_bucket_configs as gcp_list_bucket_configs, list_state_buckets as gcp_list_state_buckets};

/// Operations opta needs against a layer's remote state.
#[async_trait]
pub trait CloudClient: Send + Sync {
    fn location(&self) -> &StateLocation;

    fn cloud(&self) -> Cloud {
        self.location().cloud
    }

    /// The structured config uploaded by the last successful apply.
    async fn get_remote_config(&self) -> IacResult<Option<StructuredConfig>>;

    async fn upload_opta_config(&self, config: &StructuredConfig) -> IacResult<()>;

    async fn delete_opta_config(&self) -> IacResult<()>;

    /// The Terraform state blob, if the layer was ever applied.
    async fn get_remote_state(&self) -> IacResult<Option<TerraformState>>;

    async fn delete_remote_state(&self) -> IacResult<()>;

    /// ID of the lock currently held on the layer's state.
    async fn get_terraform_lock_id(&self) -> IacResult<Option<String>>;

    /// Remove the lock object directly, for when `terraform force-unlock` cannot.
    async fn force_delete_terraform_lock(&self) -> IacResult<()>;

    /// Every structured config stored next to this layer's state.
    async fn list_remote_configs(&self) -> IacResult<Vec<RemoteConfigEntry>>;

    /// Drop the bucket or container. Only valid for root layers.
    async fn delete_state_storage(&self) -> IacResult<()>;

    /// Write a kubeconfig for the layer's cluster and return its path.
    async fn set_kube_config(&self) -> IacResult<PathBuf>;

    async fn cluster_exist(&self) -> IacResult<bool>;

    fn get_kube_context_name(&self) -> String {
        let location = self.location();
        format!(
            "opta-{}-{}-{}",
            location.org_name, location.root_layer_name, location.cloud
        )
    }
}

/// The handles cloud clients reach their providers through.
///
/// By default AWS calls go to [`SdkAws`] for the layer's region and cluster
/// calls to a [`KubeCluster`] for the given kubeconfig; either can be
/// replaced, which is how tests run without a cloud account.
#[derive(Clone)]
pub struct CloudConnector {
    runner: Arc<dyn CommandRunner>,
    aws: Option<Arc<dyn AwsApi>>,
    cluster: Option<Arc<dyn ClusterApi>>,
}

impl CloudConnector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            aws: None,
            cluster: None,
        }
    }

    pub fn with_aws(mut self, api: Arc<dyn AwsApi>) -> Self {
        self.aws = Some(api);
        self
    }

    pub fn with_cluster(mut self, api: Arc<dyn ClusterApi>) -> Self {
        self.cluster = Some(api);
        self
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    pub fn aws(&self, region: Option<&str>) -> Arc<dyn AwsApi> {
        match &self.aws {
            Some(api) => api.clone(),
            None => Arc::new(SdkAws::new(region)),
        }
    }

    /// A cluster client for `context` in `kubeconfig`.
    pub async fn cluster(&self, kubeconfig: &Path, context: &str) -> IacResult<Arc<dyn ClusterApi>> {
        match &self.cluster {
            Some(api) => Ok(api.clone()),
            None => Ok(Arc::new(KubeCluster::connect(kubeconfig, context).await?)),
        }
    }
}

/// Build the client for a layer's cloud.
pub fn client_for(location: StateLocation, connector: &CloudConnector) -> Box<dyn CloudClient> {
    match location.cloud {
        Cloud::Aws => {
            let api = connector.aws(location.region());
            Box::new(AwsClient::new(location, api))
        }
        Cloud::Google => Box::new(GcpClient::new(location, connector.runner())),
        Cloud::Azurerm => Box::new(AzureClient::new(location, connector.runner())),
        Cloud::Local => Box::new(LocalClient::new(location, connector.runner())),
        Cloud::Helm => Box::new(HelmClient::new(location, connector.clone())),
    }
}

/// What `gcloud` prints for a missing object, bucket or cluster.
const GCLOUD_NOT_FOUND: &[&str] = &[
    "No URLs matched",
    "matched no objects",
    "not found: 404",
    "code=404",
    "NotFoundException",
];

/// Error codes `az` reports for a missing blob, container or resource.
const AZ_NOT_FOUND: &[&str] = &[
    "BlobNotFound",
    "ContainerNotFound",
    "ResourceNotFound",
    "ResourceGroupNotFound",
];

/// Whether `program` failed because the thing it was asked about is absent.
pub(crate) fn is_not_found(program: &str, message: &str) -> bool {
    let patterns: &[&str] = match program {
        "gcloud" => GCLOUD_NOT_FOUND,
        "az" => AZ_NOT_FOUND,
        _ => &[],
    };
    patterns.iter().any(|p| message.contains(p))
}

/// Run a provider CLI command, returning stdout.
pub(crate) async fn run_cli(
    runner: &dyn CommandRunner,
    spec: CommandSpec,
    operation: &str,
) -> IacResult<String> {
    debug!("{}: {}", operation, spec.command_line());
    match runner.run(&spec, &RunConfig::default()).await {
        Ok(result) => Ok(result.stdout),
        Err(RunnerError::NonZeroExit { stderr, .. }) => Err(IacError::provider(operation, stderr)),
        Err(e) => Err(IacError::provider(operation, e)),
    }
}

/// Like [`run_cli`], but a "not found" failure yields `None`.
pub(crate) async fn run_cli_optional(
    runner: &dyn CommandRunner,
    spec: CommandSpec,
    operation: &str,
) -> IacResult<Option<String>> {
    let program = spec.program.clone();
    match run_cli(runner, spec, operation).await {
        Ok(stdout) => Ok(Some(stdout)),
        Err(IacError::Provider { message, .. }) if is_not_found(&program, &message) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Run a delete, treating "already gone" as success.
pub(crate) async fn run_cli_delete(
    runner: &dyn CommandRunner,
    spec: CommandSpec,
    operation: &str,
) -> IacResult<()> {
    run_cli_optional(runner, spec, operation).await.map(|_| ())
}

pub(crate) fn parse_config(content: &str) -> IacResult<StructuredConfig> {
    serde_json::from_str(content)
        .map_err(|e| IacError::RemoteState(format!("unreadable structured config: {}", e)))
}

pub(crate) fn parse_state(content: &str) -> IacResult<Option<TerraformState>> {
    if content.trim().is_empty() {
        return Ok(None);
    }
    TerraformState::parse(content)
        .map(Some)
        .map_err(|e| IacError::RemoteState(format!("unreadable terraform state: {}", e)))
}

pub(crate) fn layer_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(crate::state::CONFIG_PREFIX)
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found(
            "gcloud",
            "ERROR: (gcloud.storage.cat) The following URLs matched no objects or files"
        ));
        assert!(is_not_found("az", "ErrorCode:BlobNotFound"));
        assert!(!is_not_found("gcloud", "AccessDenied"));
    }

    #[test]
    fn test_not_found_is_per_program() {
        // A missing binary or a 404 from an unrelated endpoint is a real failure.
        assert!(!is_not_found("az", "az: command not found"));
        assert!(!is_not_found("gcloud", "proxy returned 404 Not Found"));
        assert!(!is_not_found("kind", "BlobNotFound"));
        assert!(!is_not_found("az", "ERROR: Not Found"));
    }

    #[tokio::test]
    async fn test_unrelated_failure_is_not_swallowed() {
        let mock = opta_runner::MockRunner::new().on(
            "storage cat",
            opta_runner::MockResponse::failure(1, "ERROR: (gcloud) You do not currently have an active account selected. 404 page"),
        );
        let spec = CommandSpec::new("gcloud").args(["storage", "cat", "gs://bucket/key"]);
        let err = run_cli_optional(&mock, spec, "Reading").await.unwrap_err();
        assert!(matches!(err, IacError::Provider { .. }));
    }

    #[test]
    fn test_layer_from_key() {
        assert_eq!(layer_from_key("opta_config/staging"), Some("staging"));
        assert_eq!(layer_from_key("opta_config/"), None);
        assert_eq!(layer_from_key("staging"), None);
    }

    #[test]
    fn test_default_kube_context_name() {
        let location = StateLocation::new(Cloud::Google, "app", "bucket")
            .with_root("staging")
            .with_org("acme");
        let connector = CloudConnector::new(Arc::new(opta_runner::MockRunner::new()));
        let client = client_for(location, &connector);
        assert_eq!(client.get_kube_context_name(), "opta-acme-staging-google");
        assert_eq!(client.cloud(), Cloud::Google);
    }
}
