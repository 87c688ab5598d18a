use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Timing configuration for maintenance tasks.
///
/// Controls how long the datastore drain may take, how long application callers may stay
/// blocked on a closed latch and how long cross-node relay calls may wait for an answer.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MaintenanceConfig {
    /// Maximum time to wait for in-flight datastore operations to finish after latching.
    ///
    /// Default: 30000 (30 seconds)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Maximum time an application caller may wait on a closed latch.
    ///
    /// Default: 60000 (60 seconds)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Maximum time to wait for the owner node to answer a relayed request.
    ///
    /// Default: 10000 (10 seconds)
    #[serde(default = "default_relay_timeout_ms")]
    pub relay_timeout_ms: u64,
}

impl MaintenanceConfig {
    /// Default drain timeout: 30 seconds.
    pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 30_000;

    /// Default operation timeout: 60 seconds.
    pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 60_000;

    /// Default relay timeout: 10 seconds.
    pub const DEFAULT_RELAY_TIMEOUT_MS: u64 = 10_000;

    /// Validates that every timeout is non-zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.drain_timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout("drain_timeout_ms"));
        }

        if self.operation_timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout("operation_timeout_ms"));
        }

        if self.relay_timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout("relay_timeout_ms"));
        }

        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: Self::DEFAULT_DRAIN_TIMEOUT_MS,
            operation_timeout_ms: Self::DEFAULT_OPERATION_TIMEOUT_MS,
            relay_timeout_ms: Self::DEFAULT_RELAY_TIMEOUT_MS,
        }
    }
}

fn default_drain_timeout_ms() -> u64 {
    MaintenanceConfig::DEFAULT_DRAIN_TIMEOUT_MS
}

fn default_operation_timeout_ms() -> u64 {
    MaintenanceConfig::DEFAULT_OPERATION_TIMEOUT_MS
}

fn default_relay_timeout_ms() -> u64 {
    MaintenanceConfig::DEFAULT_RELAY_TIMEOUT_MS
}
