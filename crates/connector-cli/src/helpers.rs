//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization and configuration loading.

use std::path::Path;

use anyhow::{Context, Result};
use connector_kernel::message::nlmsg_space;
use connector_kernel::{CnMsg, ConnectorConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Load the connector configuration.
///
/// Without a path the defaults are used.  With one, the file must exist and
/// parse; keys it omits keep their default values.
pub fn load_config(path: Option<&Path>) -> Result<ConnectorConfig> {
    let Some(path) = path else {
        info!("configuration loaded (using defaults)");
        return Ok(ConnectorConfig::default());
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = parse_config(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    info!(path = %path.display(), queue = %config.queue_name, "configuration loaded");
    Ok(config)
}

/// Parse a configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ConnectorConfig> {
    let config: ConnectorConfig = toml::from_str(content)?;
    anyhow::ensure!(config.name_len > 0, "name_len must be at least 1");
    anyhow::ensure!(
        config.max_msg_size >= nlmsg_space(CnMsg::HEADER_LEN),
        "max_msg_size {} cannot hold an empty message",
        config.max_msg_size
    );
    Ok(config)
}

/// Render a configuration as TOML.
pub fn render_config(config: &ConnectorConfig) -> Result<String> {
    toml::to_string(config).context("failed to serialise configuration")
}
