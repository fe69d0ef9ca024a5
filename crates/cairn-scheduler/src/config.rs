//! Scheduler configuration.

use serde::{Deserialize, Serialize};

/// Configuration of the exit scheduler.
///
/// The two subscription intervals control how often the chain is polled for
/// new events. The notification and dispatch cadences are protocol
/// constants and intentionally not configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Chain operator address of this storage provider.
    pub operator_address: String,

    /// Poll period of the SP-exit event loop, in milliseconds.
    pub subscribe_sp_exit_event_interval_ms: u64,

    /// Poll period of the swap-out completion event loop, in milliseconds.
    pub subscribe_swap_out_event_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            operator_address: String::new(),
            subscribe_sp_exit_event_interval_ms: 1000,
            subscribe_swap_out_event_interval_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_poll_every_second() {
        let config = SchedulerConfig::default();
        assert_eq!(config.subscribe_sp_exit_event_interval_ms, 1000);
        assert_eq!(config.subscribe_swap_out_event_interval_ms, 1000);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: SchedulerConfig =
            toml::from_str("operator_address = \"0xabc\"").unwrap();
        assert_eq!(config.operator_address, "0xabc");
        assert_eq!(config.subscribe_swap_out_event_interval_ms, 1000);
    }
}
