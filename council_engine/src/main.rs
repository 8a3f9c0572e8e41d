//! Main entry point for the council CLI.

use anyhow::Result;
use clap::Parser;
use council_engine::{cli, settings::Settings, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let settings = Settings::load(args.config.as_deref())?;

    // Initialize telemetry
    telemetry::init(&settings.logging)?;

    cli::run(args.command, settings).await
}
