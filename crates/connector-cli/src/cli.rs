//! CLI argument definitions for `connectord`.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// connectord -- host for the kernel connector message bus.
#[derive(Parser)]
#[command(
    name = "connectord",
    version,
    about = "connectord -- kernel connector message bus host",
    long_about = "Hosts a connector over the in-process loopback transport. Handlers \
                  register under (idx, val) identifiers and exchange messages with \
                  privileged peers."
)]
pub struct Cli {
    /// Default log level when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective configuration as TOML.
    Config {
        /// TOML file to load; missing keys fall back to defaults.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Run a request/reply round trip over the loopback transport.
    Demo {
        /// TOML file to load; missing keys fall back to defaults.
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Index of the echo handler's identifier.
        #[arg(long, default_value_t = 123)]
        idx: u32,

        /// Value of the echo handler's identifier.
        #[arg(long, default_value_t = 456)]
        val: u32,

        /// Broadcast group that listens for add/remove notifications.
        #[arg(long, default_value_t = 7)]
        group: u32,
    },
}
