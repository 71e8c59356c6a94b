//! Destroy command - Tear down a layer.

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::info;

use opta_core::{Lifecycle, Outcome, RunOptions};

use super::{build_context, load_layer, LayerArgs};

#[derive(Args)]
pub struct DestroyArgs {
    #[command(flatten)]
    pub layer: LayerArgs,

    /// Destroy without asking for confirmation
    #[arg(long)]
    pub auto_approve: bool,

    /// Show the full terraform plan next to the summary
    #[arg(long)]
    pub detailed_plan: bool,
}

pub async fn execute(args: DestroyArgs) -> Result<()> {
    let ctx = build_context()?;
    // Variables that only mattered at apply time may be gone by now.
    let options = args.layer.load_options().lenient();
    let mut layer = load_layer(&ctx, &args.layer.config, &options)?;
    info!("Destroying layer {}", layer.name);

    let mut run_options = RunOptions::default().detailed_plan(args.detailed_plan);
    if args.auto_approve {
        run_options = run_options.auto_approve();
    }

    let outcome = Lifecycle::new(&ctx)
        .destroy(&mut layer, &run_options)
        .await
        .with_context(|| format!("Failed to destroy layer {}", layer.name))?;

    match outcome {
        Outcome::Completed => println!("Layer {} destroyed.", layer.name),
        Outcome::Cancelled => println!("Destroy cancelled."),
    }
    Ok(())
}
