//! opta CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: Any failure. User errors print a single line, everything else the
//!   full cause chain.

use std::process::ExitCode;

use clap::Parser;
use opta_core::OptaError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands, ShowCommands};

fn init_logging(verbose: bool) {
    let default_level = if verbose { "opta=debug" } else { "opta=info" };
    let mut filter = EnvFilter::from_default_env();
    for directive in [default_level, "warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    // A second init (tests, embedding) is harmless.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Apply(args) => commands::apply::execute(args).await,
        Commands::Destroy(args) => commands::destroy::execute(args).await,
        Commands::GenerateTerraform(args) => commands::generate_terraform::execute(args).await,
        Commands::ForceUnlock(args) => commands::force_unlock::execute(args).await,
        Commands::Show(ShowCommands::Config(args)) => commands::show::execute(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn report(e: &anyhow::Error) {
    let user_error = e
        .chain()
        .find_map(|cause| cause.downcast_ref::<OptaError>())
        .filter(|cause| cause.is_user_error());
    match user_error {
        Some(cause) => eprintln!("Error: {}", cause),
        None => eprintln!("Error: {:#}", e),
    }
}
