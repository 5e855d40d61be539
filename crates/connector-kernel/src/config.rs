//! Connector configuration.
//!
//! [`ConnectorConfig`] carries the tunables of one connector instance.
//! Defaults match the classic connector limits, and a builder-style API
//! allows callers to customise individual fields fluently.  The struct is
//! `serde`-enabled so hosts can load it from a TOML file; missing keys fall
//! back to the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::CbId;

/// Index of the connector's own control identifier.
pub const CN_IDX_CONNECTOR: u32 = 0xffff_ffff;
/// Value of the connector's own control identifier.
pub const CN_VAL_CONNECTOR: u32 = 0xffff_ffff;

/// Tunables for one connector instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Name of the callback queue and its dispatch worker.
    ///
    /// Default: **`"cqueue"`**.
    pub queue_name: String,

    /// Maximum size of a transport frame, netlink header included.
    ///
    /// Default: **1024** bytes.
    pub max_msg_size: usize,

    /// Capacity of a callback display name, terminator included.  Longer
    /// names are truncated to `name_len - 1` characters.
    ///
    /// Default: **32**.
    pub name_len: usize,

    /// Interval between progress messages while teardown waits for the
    /// reference count to drain, in milliseconds.
    ///
    /// Default: **1 000 ms**.
    pub teardown_log_interval_ms: u64,

    /// Maximum number of standalone (fallback) dispatch units outstanding
    /// at once.
    ///
    /// Default: **256**.
    pub fallback_limit: usize,

    /// Identifier of the built-in control handler.  Serialised as a
    /// trailing `[id]` table.
    ///
    /// Default: **`{0xffffffff:0xffffffff}`**.
    pub id: CbId,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            id: CbId::new(CN_IDX_CONNECTOR, CN_VAL_CONNECTOR),
            queue_name: "cqueue".to_string(),
            max_msg_size: 1024,
            name_len: 32,
            teardown_log_interval_ms: 1000,
            fallback_limit: 256,
        }
    }
}

impl ConnectorConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the control handler's identifier.
    pub fn with_id(mut self, id: CbId) -> Self {
        self.id = id;
        self
    }

    /// Set the callback queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Set the maximum frame size (in bytes).
    pub fn with_max_msg_size(mut self, bytes: usize) -> Self {
        self.max_msg_size = bytes;
        self
    }

    /// Set the display-name capacity.
    pub fn with_name_len(mut self, len: usize) -> Self {
        self.name_len = len;
        self
    }

    /// Set the teardown progress interval (in milliseconds).
    pub fn with_teardown_log_interval_ms(mut self, ms: u64) -> Self {
        self.teardown_log_interval_ms = ms;
        self
    }

    /// Set the limit on outstanding fallback dispatch units.
    pub fn with_fallback_limit(mut self, limit: usize) -> Self {
        self.fallback_limit = limit;
        self
    }

    /// The teardown progress interval as a [`Duration`].
    pub fn teardown_log_interval(&self) -> Duration {
        Duration::from_millis(self.teardown_log_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = ConnectorConfig::default();
        assert_eq!(cfg.id, CbId::new(0xffff_ffff, 0xffff_ffff));
        assert_eq!(cfg.queue_name, "cqueue");
        assert_eq!(cfg.max_msg_size, 1024);
        assert_eq!(cfg.name_len, 32);
        assert_eq!(cfg.teardown_log_interval(), Duration::from_secs(1));
        assert_eq!(cfg.fallback_limit, 256);
    }

    #[test]
    fn builder_overrides() {
        let cfg = ConnectorConfig::new()
            .with_id(CbId::new(3, 4))
            .with_queue_name("test")
            .with_max_msg_size(4096)
            .with_fallback_limit(0);
        assert_eq!(cfg.id, CbId::new(3, 4));
        assert_eq!(cfg.queue_name, "test");
        assert_eq!(cfg.max_msg_size, 4096);
        assert_eq!(cfg.fallback_limit, 0);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let cfg = ConnectorConfig::new().with_teardown_log_interval_ms(0);
        assert_eq!(cfg.teardown_log_interval(), Duration::from_millis(1));
    }
}
