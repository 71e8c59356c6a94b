//! Cluster targeting, and helm calls scoped to a layer's cluster.
//!
//! Kubernetes objects go through [`opta_iac::ClusterApi`] (see
//! [`crate::Context::cluster`]); only helm itself runs as a process.

use std::path::PathBuf;

use opta_runner::{CommandRunner, CommandSpec};

use crate::error::OptaResult;
use crate::shell;

/// Which kubeconfig file and context to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeTarget {
    pub kubeconfig: PathBuf,
    pub context: String,
}

/// Adds `--kubeconfig`/`--kube-context` to every helm call.
pub struct Helm<'a> {
    runner: &'a dyn CommandRunner,
    target: &'a KubeTarget,
}

impl<'a> Helm<'a> {
    pub fn new(runner: &'a dyn CommandRunner, target: &'a KubeTarget) -> Self {
        Self { runner, target }
    }

    fn spec(&self) -> CommandSpec {
        let spec = CommandSpec::new("helm")
            .arg(format!("--kubeconfig={}", self.target.kubeconfig.display()));
        if self.target.context.is_empty() {
            spec
        } else {
            spec.arg(format!("--kube-context={}", self.target.context))
        }
    }

    pub async fn run<I, S>(&self, args: I, operation: &str) -> OptaResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        shell::run(self.runner, self.spec().args(args), operation).await
    }

    /// Releases in `namespace` stuck in a pending state.
    pub async fn pending_releases(&self, namespace: &str) -> OptaResult<Vec<HelmRelease>> {
        let stdout = self
            .run(
                ["list", "--pending", "--output", "json", "--namespace", namespace],
                "Listing pending helm releases",
            )
            .await?;
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    pub async fn rollback(&self, release: &HelmRelease) -> OptaResult<()> {
        self.run(
            ["rollback", release.name.as_str(), "--namespace", release.namespace.as_str()],
            "Rolling back helm release",
        )
        .await
        .map(|_| ())
    }
}

/// An entry of `helm list -o json`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HelmRelease {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub revision: String,
    pub status: String,
}
