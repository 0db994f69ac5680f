//! Engine configuration
//!
//! Timing and policy knobs for the session engine. Frame and window sizes
//! are protocol constants and live in [`crate::packet`] / [`crate::transfer`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Keepalive ping interval while connected, in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// How long a pairing-mode advertisement stays listed without refresh
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,

    /// Wait between opening a file for write and sending the first packet
    #[serde(default = "default_upload_settle_delay")]
    pub upload_settle_delay_ms: u64,

    /// Reconnect to the last device after an unexpected disconnect
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Read RSSI alongside each keepalive ping
    #[serde(default = "default_true")]
    pub read_rssi_on_keepalive: bool,
}

fn default_keepalive_interval() -> u64 {
    5
}

fn default_pairing_timeout() -> u64 {
    10
}

fn default_upload_settle_delay() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            pairing_timeout_secs: default_pairing_timeout(),
            upload_settle_delay_ms: default_upload_settle_delay(),
            auto_reconnect: true,
            read_rssi_on_keepalive: true,
        }
    }
}

impl EngineConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }

    pub fn upload_settle_delay(&self) -> Duration {
        Duration::from_millis(self.upload_settle_delay_ms)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.keepalive_interval_secs == 0 {
            return Err(crate::ProtocolError::Configuration(
                "keepalive_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.pairing_timeout_secs == 0 {
            return Err(crate::ProtocolError::Configuration(
                "pairing_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
