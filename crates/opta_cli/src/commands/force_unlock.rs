//! Force-unlock command - Drop a stale state lock.

use anyhow::{Context as _, Result};
use clap::Args;

use opta_core::{Lifecycle, Outcome};

use super::{build_context, load_layer, LayerArgs};

#[derive(Args)]
pub struct ForceUnlockArgs {
    #[command(flatten)]
    pub layer: LayerArgs,
}

pub async fn execute(args: ForceUnlockArgs) -> Result<()> {
    let ctx = build_context()?;
    let options = args.layer.load_options().lenient();
    let mut layer = load_layer(&ctx, &args.layer.config, &options)?;

    let outcome = Lifecycle::new(&ctx)
        .force_unlock(&mut layer)
        .await
        .with_context(|| format!("Failed to unlock layer {}", layer.name))?;

    if outcome == Outcome::Cancelled {
        println!("Force-unlock cancelled.");
    }
    Ok(())
}
