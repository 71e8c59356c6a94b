//! # opta_iac
//!
//! Terraform and cloud state plumbing for opta.
//!
//! This crate drives the `terraform` CLI for a rendered layer and talks to
//! the provider storage that holds each layer's remote state, and to the
//! Kubernetes objects opta manages next to Terraform.
//!
//! ## Features
//!
//! - `TerraformRunner`: init, plan, apply, destroy, show, state pull and
//!   force-unlock, with backoff on transient network errors
//! - `CloudClient` implementations for AWS, GCP, Azure, local and helm layers
//! - Structured config persistence and lock discovery
//! - `ClusterApi`: namespaces, config maps, secrets and leases through the
//!   Kubernetes API
//! - Scoped kubeconfig generation under `~/.opta/kubeconfigs`
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use opta_iac::{client_for, CloudConnector, StateLocation, TerraformRunner};
//! use opta_registry::Cloud;
//! use opta_runner::{CliRunner, CliRunnerOptions};
//!
//! # async fn run() -> opta_iac::IacResult<()> {
//! let runner = Arc::new(CliRunner::new(CliRunnerOptions::default()));
//! let location = StateLocation::new(Cloud::Aws, "staging", "opta-tf-state-acme-staging");
//! let client = client_for(location, &CloudConnector::new(runner.clone()));
//! if let Some(lock) = client.get_terraform_lock_id().await? {
//!     println!("locked by {lock}");
//! }
//! TerraformRunner::new(runner, ".").init(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod cloud;
pub mod cluster;
pub mod error;
pub mod inventory;
pub mod kubeconfig;
pub mod state;
pub mod terraform;

pub use cloud::{
    client_for, AwsApi, AwsClient, AzureClient, CloudClient, CloudConnector, EksCluster, GcpClient, HelmClient,
    InMemoryAws, LocalClient, SdkAws,
};
pub use cluster::{ClusterApi, InMemoryCluster, KubeCluster, SecretData, StoredSecret};
pub use error::{IacError, IacResult};
pub use inventory::{list_all_configs, InventoryScope};
pub use state::{
    RemoteConfigEntry, StateLocation, StateOutput, StateResource, StructuredConfig, TerraformState,
    UsedDefault, CONFIG_PREFIX, STATE_BUCKET_PREFIX,
};
pub use terraform::{
    module_target, ApplyOptions, PlanAction, PlanOptions, PlanSummary, PlannedChange, RetryPolicy,
    TerraformRunner, PLAN_FILE,
};
