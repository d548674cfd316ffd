//! Collector manager configuration.

use std::time::Duration;

/// Runtime settings for a [`CollectorManager`](crate::CollectorManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// Configuration-store section holding persisted CCCD state.
    pub section_name: String,
    /// Key prefix for Blood Pressure Measurement CCCD flags.
    pub measurement_key_tag: String,
    /// Key prefix for Intermediate Cuff Pressure CCCD flags.
    pub cuff_pressure_key_tag: String,
    /// Capacity of the worker task queue.
    pub queue_depth: usize,
    /// How long to wait for the registry lock before failing with
    /// [`Error::UnableToLockContext`](crate::Error::UnableToLockContext).
    pub lock_timeout: Duration,
    /// Remember CCCD state for bonded devices.
    pub persist_cccd_state: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            section_name: "BLPM-Collector".to_string(),
            measurement_key_tag: "BC".to_string(),
            cuff_pressure_key_tag: "IC".to_string(),
            queue_depth: 64,
            lock_timeout: Duration::from_secs(5),
            persist_cccd_state: true,
        }
    }
}

impl ManagerConfig {
    /// Set the configuration-store section name.
    pub fn with_section_name(mut self, name: impl Into<String>) -> Self {
        self.section_name = name.into();
        self
    }

    /// Set the worker queue capacity.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Set the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Enable or disable CCCD persistence.
    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persist_cccd_state = enabled;
        self
    }
}
