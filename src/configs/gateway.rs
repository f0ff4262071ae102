use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::errors::{GatewayError, GatewayResult};

/// Tunables for one voice session. Every field has a default, so an empty
/// `[gateway]` table (or none at all) is valid.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// Frames the outbound queue holds before `enqueue` suspends.
    pub queue_capacity: usize,
    /// RTP timestamp advance per frame (960 = 20 ms at 48 kHz).
    pub frame_samples: u32,
    /// Pacing of the sender loop; `0` sends as fast as frames arrive.
    pub frame_duration_ms: u64,
    pub keepalive_interval_ms: u64,
    pub keepalive_ledger_capacity: usize,
    pub keepalive_ledger_ttl_ms: u64,
    pub discovery_timeout_ms: u64,
    /// Bound on Hello and on SessionDescription after SelectProtocol.
    pub session_description_timeout_ms: u64,
    /// How long `connect` waits for the session to become ready.
    pub ready_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Consecutive UDP send failures before the socket is declared unusable.
    pub max_consecutive_send_failures: u32,
    pub event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50,
            frame_samples: 960,
            frame_duration_ms: 20,
            keepalive_interval_ms: 5_000,
            keepalive_ledger_capacity: 32,
            keepalive_ledger_ttl_ms: 30_000,
            discovery_timeout_ms: 5_000,
            session_description_timeout_ms: 10_000,
            ready_timeout_ms: 15_000,
            max_reconnect_attempts: 5,
            max_consecutive_send_failures: 50,
            event_capacity: 64,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        let checks: [(&str, bool); 8] = [
            ("queue_capacity", self.queue_capacity > 0),
            ("frame_samples", self.frame_samples > 0),
            ("keepalive_interval_ms", self.keepalive_interval_ms > 0),
            ("keepalive_ledger_capacity", self.keepalive_ledger_capacity > 0),
            ("discovery_timeout_ms", self.discovery_timeout_ms > 0),
            (
                "session_description_timeout_ms",
                self.session_description_timeout_ms > 0,
            ),
            ("ready_timeout_ms", self.ready_timeout_ms > 0),
            ("event_capacity", self.event_capacity > 0),
        ];

        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(GatewayError::config(format!(
                "gateway.{} must be greater than zero",
                field
            ))),
            None => Ok(()),
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn keepalive_ledger_ttl(&self) -> Duration {
        Duration::from_millis(self.keepalive_ledger_ttl_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn session_description_timeout(&self) -> Duration {
        Duration::from_millis(self.session_description_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_interval_names_the_field() {
        let config = GatewayConfig {
            keepalive_interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keepalive_interval_ms"));
    }
}
