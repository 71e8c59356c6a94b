//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use opta_core::{Context, OptaConfig, ScriptedInteraction, UserInteraction};
use opta_iac::{InMemoryAws, InMemoryCluster, RetryPolicy};
use opta_registry::Registry;
use opta_runner::MockRunner;
use tempfile::TempDir;

pub const ENV_YAML: &str = r#"
name: staging
org_name: acme
providers:
  aws:
    region: us-east-1
    account_id: "123456789012"
modules:
  - type: aws-base
    name: base
  - type: aws-eks
    name: k8scluster
  - type: aws-s3
    name: logs
    bucket_name: acme-staging-logs
"#;

/// A scratch directory holding layer files, a workdir and an opta home,
/// plus the in-memory AWS account and cluster every context talks to.
pub struct Workspace {
    pub dir: TempDir,
    pub aws: Arc<InMemoryAws>,
    pub cluster: Arc<InMemoryCluster>,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("work")).unwrap();
        Self {
            dir,
            aws: Arc::new(InMemoryAws::new()),
            cluster: Arc::new(InMemoryCluster::new()),
        }
    }

    pub fn with_aws(mut self, aws: InMemoryAws) -> Self {
        self.aws = Arc::new(aws);
        self
    }

    pub fn with_cluster(mut self, cluster: InMemoryCluster) -> Self {
        self.cluster = Arc::new(cluster);
        self
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn config(&self) -> OptaConfig {
        OptaConfig::default()
            .with_opta_home(self.root().join(".opta"))
            .with_modules_dir(self.root().join("modules"))
            .with_workdir(self.root().join("work"))
    }

    pub fn context(&self, runner: &MockRunner) -> Context {
        self.context_with(runner, Arc::new(ScriptedInteraction::new()))
    }

    pub fn context_with(&self, runner: &MockRunner, interaction: Arc<dyn UserInteraction>) -> Context {
        self.context_for(Registry::embedded().unwrap(), runner, interaction)
    }

    pub fn context_for(
        &self,
        registry: Registry,
        runner: &MockRunner,
        interaction: Arc<dyn UserInteraction>,
    ) -> Context {
        Context::new(Arc::new(registry), self.config(), Arc::new(runner.clone()), interaction)
            .with_retry(RetryPolicy::default().with_base_delay(Duration::ZERO))
            .with_aws(self.aws.clone())
            .with_cluster(self.cluster.clone())
    }
}

/// `terraform state pull` output with one resource in each named module.
pub fn state_with_modules(modules: &[&str]) -> String {
    let resources: Vec<serde_json::Value> = modules
        .iter()
        .map(|m| {
            serde_json::json!({
                "module": format!("module.{}", m),
                "mode": "managed",
                "type": "aws_s3_bucket",
                "name": "this",
            })
        })
        .collect();
    serde_json::json!({ "serial": 3, "resources": resources }).to_string()
}

/// `terraform show -json` output planning `action` on one resource per module.
pub fn plan_json(modules: &[&str], action: &str) -> String {
    let changes: Vec<serde_json::Value> = modules
        .iter()
        .map(|m| {
            serde_json::json!({
                "address": format!("module.{}.aws_s3_bucket.this", m),
                "module_address": format!("module.{}", m),
                "change": { "actions": [action] },
            })
        })
        .collect();
    serde_json::json!({ "resource_changes": changes }).to_string()
}
