//! Runtime tunables for a watch session

use crate::resolver::DEFAULT_SYMBOLS;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and symbol settings, deserializable from a `[watch]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub poll_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Buffer symbol names, tried in order
    pub symbols: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            handshake_timeout_ms: 5000,
            request_timeout_ms: 10_000,
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        // A zero period would make the interval timer panic
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WatchConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.symbols[0], "memview_buffer");
    }

    #[test]
    fn test_partial_table_keeps_defaults() {
        let config: WatchConfig = serde_json::from_str(r#"{"poll_interval_ms": 250}"#).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.request_timeout_ms, 10_000);
    }

    #[test]
    fn test_zero_interval_clamped() {
        let config = WatchConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
