//! Show config command - List stored configs.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;

use opta_iac::{list_all_configs, CloudConnector, InventoryScope};
use opta_registry::Cloud;
use opta_runner::{CliRunner, CliRunnerOptions};

#[derive(Args)]
pub struct ShowConfigArgs {
    /// Cloud whose state buckets to scan
    #[arg(long, value_parser = ["aws", "google", "azurerm"])]
    pub cloud: String,

    /// Region to query (aws)
    #[arg(long)]
    pub region: Option<String>,

    /// Storage account holding the state containers (azurerm)
    #[arg(long)]
    pub storage_account: Option<String>,
}

pub async fn execute(args: ShowConfigArgs) -> Result<()> {
    let cloud = Cloud::from_str(&args.cloud).with_context(|| format!("Unknown cloud {}", args.cloud))?;
    let connector = CloudConnector::new(Arc::new(CliRunner::new(CliRunnerOptions::default())));
    let scope = InventoryScope {
        region: args.region,
        storage_account: args.storage_account,
    };

    let entries = list_all_configs(cloud, &connector, &scope)
        .await
        .with_context(|| format!("Failed to list {} configs", cloud))?;

    if entries.is_empty() {
        println!("No opta configs found in {}.", cloud);
        return Ok(());
    }
    for entry in entries {
        println!("# {} / {} (opta {}, {})", entry.bucket, entry.layer_name, entry.config.opta_version, entry.config.date);
        println!("{}", entry.config.original_spec.trim_end());
        println!();
    }
    Ok(())
}
