//! Apply command - Plan and apply a layer.

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::info;

use opta_core::{Lifecycle, Outcome, RunOptions};

use super::{build_context, load_layer, LayerArgs};

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub layer: LayerArgs,

    /// Apply without asking for confirmation
    #[arg(long)]
    pub auto_approve: bool,

    /// Show the full terraform plan next to the summary
    #[arg(long)]
    pub detailed_plan: bool,
}

pub async fn execute(args: ApplyArgs) -> Result<()> {
    let ctx = build_context()?;
    let mut layer = load_layer(&ctx, &args.layer.config, &args.layer.load_options())?;
    info!("Applying layer {}", layer.name);

    let mut options = RunOptions::default().detailed_plan(args.detailed_plan);
    if args.auto_approve {
        options = options.auto_approve();
    }

    let outcome = Lifecycle::new(&ctx)
        .apply(&mut layer, &options)
        .await
        .with_context(|| format!("Failed to apply layer {}", layer.name))?;

    match outcome {
        Outcome::Completed => println!("Layer {} is up to date.", layer.name),
        Outcome::Cancelled => println!("Apply cancelled."),
    }
    Ok(())
}
