//! Persistent CCCD state.
//!
//! A bonded sensor remembers its CCCD values across connections, so the
//! collector remembers them too. State is written as two integer keys per
//! device in one configuration section:
//!
//! ```text
//! [BLPM-Collector]
//! BC-001A7DDA7113 = 1
//! IC-001A7DDA7113 = 0
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::ble::address::BdAddr;
use crate::config::ManagerConfig;
use crate::error::Result;
use crate::registry::subscriptions::SubscriptionKind;

/// Key/value configuration store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read an integer, `None` if the key is absent.
    async fn read_integer(&self, section: &str, key: &str) -> Result<Option<i64>>;

    /// Write an integer.
    async fn write_integer(&self, section: &str, key: &str, value: i64) -> Result<()>;
}

/// In-memory [`ConfigStore`].
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<(String, String), i64>>,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value synchronously.
    pub fn get(&self, section: &str, key: &str) -> Option<i64> {
        self.values
            .read()
            .get(&(section.to_string(), key.to_string()))
            .copied()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Check if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn read_integer(&self, section: &str, key: &str) -> Result<Option<i64>> {
        Ok(self.get(section, key))
    }

    async fn write_integer(&self, section: &str, key: &str, value: i64) -> Result<()> {
        self.values
            .write()
            .insert((section.to_string(), key.to_string()), value);
        Ok(())
    }
}

/// CCCD flags remembered for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PersistedCccd {
    /// Blood Pressure Measurement indications were enabled.
    pub measurement: bool,
    /// Intermediate Cuff Pressure notifications were enabled.
    pub cuff_pressure: bool,
}

impl PersistedCccd {
    /// Flag for a subscription kind.
    pub fn get(&self, kind: SubscriptionKind) -> bool {
        match kind {
            SubscriptionKind::Measurement => self.measurement,
            SubscriptionKind::IntermediateCuffPressure => self.cuff_pressure,
        }
    }

    /// Check if either flag is set.
    pub fn any(&self) -> bool {
        self.measurement || self.cuff_pressure
    }
}

/// A persistence step queued by a registry transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOp {
    /// Write a device's flags.
    Store {
        /// Device.
        address: BdAddr,
        /// Flags to write.
        state: PersistedCccd,
    },
    /// Clear a device's flags if any are stored.
    Clear {
        /// Device.
        address: BdAddr,
    },
    /// Move stored flags to a rotated address.
    Migrate {
        /// Old address.
        previous: BdAddr,
        /// New address.
        current: BdAddr,
    },
}

/// CCCD persistence on top of a [`ConfigStore`].
#[derive(Clone)]
pub struct CccdPersistence {
    store: Arc<dyn ConfigStore>,
    section: String,
    measurement_tag: String,
    cuff_pressure_tag: String,
    enabled: bool,
}

impl CccdPersistence {
    /// Create from the manager configuration.
    pub fn new(store: Arc<dyn ConfigStore>, config: &ManagerConfig) -> Self {
        Self {
            store,
            section: config.section_name.clone(),
            measurement_tag: config.measurement_key_tag.clone(),
            cuff_pressure_tag: config.cuff_pressure_key_tag.clone(),
            enabled: config.persist_cccd_state,
        }
    }

    /// Key name for a device and subscription kind.
    pub fn key(&self, kind: SubscriptionKind, address: &BdAddr) -> String {
        let tag = match kind {
            SubscriptionKind::Measurement => &self.measurement_tag,
            SubscriptionKind::IntermediateCuffPressure => &self.cuff_pressure_tag,
        };
        format!("{tag}-{}", address.to_hex())
    }

    /// Load a device's flags. `None` if neither flag is set.
    pub async fn load(&self, address: &BdAddr) -> Result<Option<PersistedCccd>> {
        if !self.enabled {
            return Ok(None);
        }

        let measurement = self.read_flag(SubscriptionKind::Measurement, address).await?;
        let cuff_pressure = self
            .read_flag(SubscriptionKind::IntermediateCuffPressure, address)
            .await?;
        let state = PersistedCccd {
            measurement,
            cuff_pressure,
        };

        Ok(state.any().then_some(state))
    }

    async fn read_flag(&self, kind: SubscriptionKind, address: &BdAddr) -> Result<bool> {
        let value = self
            .store
            .read_integer(&self.section, &self.key(kind, address))
            .await?;
        Ok(value.unwrap_or(0) != 0)
    }

    /// Write a device's flags.
    pub async fn store(&self, address: &BdAddr, state: PersistedCccd) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        debug!(
            "Persisting CCCD state for {}: BPM={} ICP={}",
            address, state.measurement, state.cuff_pressure
        );
        for kind in [
            SubscriptionKind::Measurement,
            SubscriptionKind::IntermediateCuffPressure,
        ] {
            self.store
                .write_integer(
                    &self.section,
                    &self.key(kind, address),
                    i64::from(state.get(kind)),
                )
                .await?;
        }
        Ok(())
    }

    /// Clear a device's flags if any are set.
    pub async fn clear(&self, address: &BdAddr) -> Result<()> {
        if self.load(address).await?.is_some() {
            self.store(address, PersistedCccd::default()).await?;
        }
        Ok(())
    }

    /// Move a device's flags to a new address.
    pub async fn migrate(&self, previous: &BdAddr, current: &BdAddr) -> Result<()> {
        if let Some(state) = self.load(previous).await? {
            self.store(current, state).await?;
            self.clear(previous).await?;
        }
        Ok(())
    }

    /// Run a queued step.
    pub async fn apply(&self, op: PersistOp) -> Result<()> {
        match op {
            PersistOp::Store { address, state } => self.store(&address, state).await,
            PersistOp::Clear { address } => self.clear(&address).await,
            PersistOp::Migrate { previous, current } => self.migrate(&previous, &current).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: BdAddr = BdAddr::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);

    fn persistence() -> (Arc<MemoryConfigStore>, CccdPersistence) {
        let store = Arc::new(MemoryConfigStore::new());
        let persistence = CccdPersistence::new(store.clone(), &ManagerConfig::default());
        (store, persistence)
    }

    #[test]
    fn test_key_format() {
        let (_, persistence) = persistence();
        assert_eq!(
            persistence.key(SubscriptionKind::Measurement, &ADDR),
            "BC-001A7DDA7113"
        );
        assert_eq!(
            persistence.key(SubscriptionKind::IntermediateCuffPressure, &ADDR),
            "IC-001A7DDA7113"
        );
    }

    #[test]
    fn test_memory_store_sections() {
        let store = MemoryConfigStore::new();
        tokio_test::block_on(async {
            store.write_integer("A", "key", 1).await.unwrap();
            store.write_integer("B", "key", 2).await.unwrap();
            assert_eq!(store.read_integer("A", "key").await.unwrap(), Some(1));
            assert_eq!(store.read_integer("A", "other").await.unwrap(), None);
        });
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let (store, persistence) = persistence();
        assert_eq!(persistence.load(&ADDR).await.unwrap(), None);

        let state = PersistedCccd {
            measurement: true,
            cuff_pressure: false,
        };
        persistence.store(&ADDR, state).await.unwrap();
        assert_eq!(store.get("BLPM-Collector", "BC-001A7DDA7113"), Some(1));
        assert_eq!(store.get("BLPM-Collector", "IC-001A7DDA7113"), Some(0));
        assert_eq!(persistence.load(&ADDR).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_clear_only_when_stored() {
        let (store, persistence) = persistence();
        persistence.clear(&ADDR).await.unwrap();
        assert!(store.is_empty());

        persistence
            .store(
                &ADDR,
                PersistedCccd {
                    measurement: false,
                    cuff_pressure: true,
                },
            )
            .await
            .unwrap();
        persistence.clear(&ADDR).await.unwrap();
        assert_eq!(persistence.load(&ADDR).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_migrate() {
        let (_, persistence) = persistence();
        let current = BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let state = PersistedCccd {
            measurement: true,
            cuff_pressure: true,
        };
        persistence.store(&ADDR, state).await.unwrap();

        persistence
            .apply(PersistOp::Migrate {
                previous: ADDR,
                current,
            })
            .await
            .unwrap();
        assert_eq!(persistence.load(&ADDR).await.unwrap(), None);
        assert_eq!(persistence.load(&current).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_disabled_persistence_is_inert() {
        let store = Arc::new(MemoryConfigStore::new());
        let config = ManagerConfig {
            persist_cccd_state: false,
            ..Default::default()
        };
        let persistence = CccdPersistence::new(store.clone(), &config);
        persistence
            .store(
                &ADDR,
                PersistedCccd {
                    measurement: true,
                    cuff_pressure: false,
                },
            )
            .await
            .unwrap();
        assert!(store.is_empty());
    }
}
