//! Shared state handed through the whole pipeline.

use std::path::Path;
use std::sync::Arc;

use opta_iac::{client_for, AwsApi, CloudClient, CloudConnector, ClusterApi, RetryPolicy, StateLocation, TerraformRunner};
use opta_registry::Registry;
use opta_runner::CommandRunner;

use crate::config::OptaConfig;
use crate::error::OptaResult;
use crate::interaction::UserInteraction;
use crate::kube::KubeTarget;

/// Everything a command needs besides the layer itself.
///
/// There are no globals: the registry, the process runner, the cloud
/// connections and the prompt implementation all travel in here.
#[derive(Clone)]
pub struct Context {
    pub registry: Arc<Registry>,
    pub config: OptaConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub interaction: Arc<dyn UserInteraction>,
    pub retry: RetryPolicy,
    pub connector: CloudConnector,
    /// Set while `apply` runs; processors only ask for missing secrets then.
    pub applying: bool,
}

impl Context {
    pub fn new(
        registry: Arc<Registry>,
        config: OptaConfig,
        runner: Arc<dyn CommandRunner>,
        interaction: Arc<dyn UserInteraction>,
    ) -> Self {
        Self {
            registry,
            config,
            connector: CloudConnector::new(runner.clone()),
            runner,
            interaction,
            retry: RetryPolicy::default(),
            applying: false,
        }
    }

    pub fn with_aws(mut self, api: Arc<dyn AwsApi>) -> Self {
        self.connector = self.connector.with_aws(api);
        self
    }

    pub fn with_cluster(mut self, api: Arc<dyn ClusterApi>) -> Self {
        self.connector = self.connector.with_cluster(api);
        self
    }

    /// A copy of this context for an `apply` run.
    pub fn applying(&self) -> Self {
        Self {
            applying: true,
            ..self.clone()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: OptaConfig) -> Self {
        self.config = config;
        self
    }

    /// A terraform driver rooted at the configured workdir.
    pub fn terraform(&self, layer_name: &str) -> TerraformRunner {
        self.terraform_in(&self.config.workdir, layer_name)
    }

    pub fn terraform_in(&self, workdir: &Path, layer_name: &str) -> TerraformRunner {
        TerraformRunner::new(self.runner.clone(), workdir)
            .with_retry(self.retry)
            .for_layer(layer_name)
    }

    pub fn cloud_client(&self, location: StateLocation) -> Box<dyn CloudClient> {
        client_for(location, &self.connector)
    }

    /// The Kubernetes API of the cluster `target` points at.
    pub async fn cluster(&self, target: &KubeTarget) -> OptaResult<Arc<dyn ClusterApi>> {
        Ok(self.connector.cluster(&target.kubeconfig, &target.context).await?)
    }
}
