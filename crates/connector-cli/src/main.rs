//! CLI entry point for the connector host.
//!
//! This binary provides the `connectord` command with subcommands for
//! inspecting configuration and running the loopback demo.

mod cli;
mod demo;
mod helpers;

use anyhow::Result;
use clap::Parser;
use connector_kernel::CbId;

use cli::{Cli, Commands};
use helpers::{init_tracing, load_config, render_config};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", render_config(&config)?);
            Ok(())
        }
        Commands::Demo {
            config,
            idx,
            val,
            group,
        } => {
            let config = load_config(config.as_deref())?;
            demo::cmd_demo(config, CbId::new(idx, val), group).await
        }
    }
}
