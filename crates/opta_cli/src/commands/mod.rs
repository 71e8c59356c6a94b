//! CLI command definitions.
//!
//! Every layer command loads one opta YAML file, then hands it to
//! [`opta_core::Lifecycle`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use opta_core::{Context, Layer, LoadOptions, OptaConfig, TerminalInteraction};
use opta_registry::Registry;
use opta_runner::{CliRunner, CliRunnerOptions};

pub mod apply;
pub mod destroy;
pub mod force_unlock;
pub mod generate_terraform;
pub mod show;

/// opta - infrastructure as code for layered cloud environments
#[derive(Parser)]
#[command(name = "opta")]
#[command(version, about = "Turn opta layer files into Terraform and deploy them")]
#[command(long_about = r#"
opta reads a layer YAML file, resolves it against the module catalog and
drives the generated Terraform against the layer's remote state.

COMMANDS:
  apply              → Plan and apply a layer, stage by stage
  destroy            → Destroy a layer that no child still references
  generate-terraform → Export portable Terraform files for a layer
  force-unlock       → Remove a stale Terraform state lock
  show config        → List the configs stored in every opta state bucket

Any failure exits with code 1.
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan and apply a layer
    Apply(apply::ApplyArgs),

    /// Destroy a layer
    Destroy(destroy::DestroyArgs),

    /// Write the layer as standalone Terraform files
    #[command(name = "generate-terraform")]
    GenerateTerraform(generate_terraform::GenerateTerraformArgs),

    /// Release the Terraform lock on a layer's state
    #[command(name = "force-unlock")]
    ForceUnlock(force_unlock::ForceUnlockArgs),

    /// Inspect remote opta data
    #[command(subcommand)]
    Show(ShowCommands),
}

#[derive(Subcommand)]
pub enum ShowCommands {
    /// Print every structured config stored in the cloud's state buckets
    Config(show::ShowConfigArgs),
}

/// Arguments shared by every command that works on one layer file.
#[derive(Args, Debug, Clone)]
pub struct LayerArgs {
    /// Opta config file
    #[arg(short, long, default_value = "opta.yaml")]
    pub config: PathBuf,

    /// Environment to use as parent, when the layer declares several
    #[arg(long)]
    pub env: Option<String>,

    /// Input variable as KEY=VALUE (repeatable)
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,
}

impl LayerArgs {
    pub fn load_options(&self) -> LoadOptions {
        self.vars
            .iter()
            .fold(LoadOptions::default().env(self.env.clone()), |options, (key, value)| {
                options.var(key.clone(), Value::String(value.clone()))
            })
    }
}

fn parse_var(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{}`", raw)),
    }
}

/// Context wired to the real terminal, the host's binaries and the
/// embedded module catalog.
pub fn build_context() -> Result<Context> {
    let config = OptaConfig::from_env();
    let registry = Registry::embedded().context("Failed to load the module catalog")?;
    let mut runner_options = CliRunnerOptions::default();
    if config.ci {
        runner_options = runner_options.ci_mode();
    }
    let interaction = TerminalInteraction::new(config.ci);
    Ok(Context::new(
        Arc::new(registry),
        config,
        Arc::new(CliRunner::new(runner_options)),
        Arc::new(interaction),
    ))
}

pub fn load_layer(ctx: &Context, path: &Path, options: &LoadOptions) -> Result<Layer> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }
    Layer::load_from_yaml(ctx, path, options).with_context(|| format!("Failed to load {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(parse_var("image=nginx:1.21").unwrap(), ("image".to_string(), "nginx:1.21".to_string()));
        assert_eq!(parse_var("a=b=c").unwrap(), ("a".to_string(), "b=c".to_string()));
        assert_eq!(parse_var("empty=").unwrap(), ("empty".to_string(), String::new()));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_apply_arguments() {
        let cli = Cli::try_parse_from([
            "opta",
            "apply",
            "-c",
            "service.yaml",
            "--env",
            "staging",
            "--var",
            "tag=v2",
            "--auto-approve",
        ])
        .unwrap();
        match cli.command {
            Commands::Apply(args) => {
                assert_eq!(args.layer.config, PathBuf::from("service.yaml"));
                assert_eq!(args.layer.env.as_deref(), Some("staging"));
                assert!(args.auto_approve);
                assert!(!args.detailed_plan);
                let options = args.layer.load_options();
                assert_eq!(options.input_variables["tag"], Value::String("v2".to_string()));
                assert_eq!(options.env.as_deref(), Some("staging"));
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_config_defaults_to_opta_yaml() {
        let cli = Cli::try_parse_from(["opta", "force-unlock"]).unwrap();
        match cli.command {
            Commands::ForceUnlock(args) => assert_eq!(args.layer.config, PathBuf::from("opta.yaml")),
            _ => panic!("expected force-unlock"),
        }
    }

    #[test]
    fn test_show_config_requires_known_cloud() {
        assert!(Cli::try_parse_from(["opta", "show", "config", "--cloud", "aws"]).is_ok());
        assert!(Cli::try_parse_from(["opta", "show", "config", "--cloud", "local"]).is_err());
        assert!(Cli::try_parse_from(["opta", "show", "config"]).is_err());
    }

    #[test]
    fn test_generate_terraform_arguments() {
        let cli = Cli::try_parse_from(["opta", "generate-terraform", "-c", "env.yaml", "-d", "out", "--replace"]).unwrap();
        match cli.command {
            Commands::GenerateTerraform(args) => {
                assert_eq!(args.directory, PathBuf::from("out"));
                assert!(args.replace);
            }
            _ => panic!("expected generate-terraform"),
        }
    }

    #[test]
    fn test_missing_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(
            Arc::new(Registry::embedded().unwrap()),
            OptaConfig::default().with_workdir(dir.path()),
            Arc::new(opta_runner::MockRunner::new()),
            Arc::new(opta_core::ScriptedInteraction::new()),
        );
        let err = load_layer(&ctx, &dir.path().join("missing.yaml"), &LoadOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
