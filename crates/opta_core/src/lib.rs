//! # opta_core
//!
//! Turns opta layer files into Terraform and drives them through their
//! lifecycle.
//!
//! # Architecture
//!
//! - **Layer**: one YAML file plus its parent chain, loaded into [`Module`]s
//!   bound to catalog types
//! - **Processors**: per-type validation and wiring, run once per layer
//! - **Linker / IAM**: expand `links` into secrets or policy statements
//! - **Generator**: renders `main.tf.json` and the stepwise execution plan
//! - **Lifecycle**: apply, destroy and force-unlock against remote state
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use opta_core::{Context, Layer, Lifecycle, LoadOptions, OptaConfig, RunOptions, TerminalInteraction};
//! use opta_registry::Registry;
//! use opta_runner::{CliRunner, CliRunnerOptions};
//!
//! let ctx = Context::new(
//!     Arc::new(Registry::embedded()?),
//!     OptaConfig::from_env(),
//!     Arc::new(CliRunner::new(CliRunnerOptions::default())),
//!     Arc::new(TerminalInteraction::new(false)),
//! );
//! let mut layer = Layer::load_from_yaml(&ctx, "opta.yaml".as_ref(), &LoadOptions::default())?;
//! Lifecycle::new(&ctx).apply(&mut layer, &RunOptions::default()).await?;
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod generator;
pub mod iam;
pub mod inputs;
pub mod interaction;
pub mod interpolation;
pub mod kube;
pub mod layer;
pub mod lifecycle;
pub mod linker;
pub mod lockfile;
pub mod module;
pub mod processors;
pub mod shell;
pub mod tags;

// Re-export main types for convenience
pub use config::OptaConfig;
pub use context::Context;
pub use error::{ErrorKind, OptaError, OptaResult};
pub use generator::{ExecutionPlan, ExecutionStep, Generated, Generator, TerraformDocument};
pub use iam::IamAssembler;
pub use inputs::{InjectedValues, InputResolver, ResolvedInputs};
pub use interaction::{ScriptedInteraction, TerminalInteraction, UserInteraction};
pub use interpolation::{Scope, ScopeValue};
pub use kube::KubeTarget;
pub use layer::{Layer, LoadOptions};
pub use lifecycle::{Lifecycle, Outcome, RunOptions};
pub use linker::LinkRequest;
pub use lockfile::ProcessLock;
pub use module::Module;
pub use processors::{PortSpec, PortType, ProcessorKind, Protocol};
