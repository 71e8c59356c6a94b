//! Generate-terraform command - Export a layer as plain Terraform.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::info;

use opta_core::Lifecycle;

use super::{build_context, load_layer, LayerArgs};

#[derive(Args)]
pub struct GenerateTerraformArgs {
    #[command(flatten)]
    pub layer: LayerArgs,

    /// Output directory
    #[arg(short, long, default_value = "gen-tf")]
    pub directory: PathBuf,

    /// Overwrite a non-empty output directory
    #[arg(long)]
    pub replace: bool,
}

pub async fn execute(args: GenerateTerraformArgs) -> Result<()> {
    let ctx = build_context()?;
    let mut layer = load_layer(&ctx, &args.layer.config, &args.layer.load_options())?;
    info!("Generating terraform for layer {} in {:?}", layer.name, args.directory);

    let written = Lifecycle::new(&ctx)
        .generate_terraform(&mut layer, &args.directory, args.replace)
        .await
        .with_context(|| format!("Failed to generate terraform for layer {}", layer.name))?;

    println!("Wrote {} files to {}", written.len(), args.directory.display());
    println!("See {} for the apply steps.", args.directory.join("README.md").display());
    Ok(())
}
