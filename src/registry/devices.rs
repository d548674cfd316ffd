//! Device registry.
//!
//! One entry per connected peripheral with a bound Blood Pressure service.

use std::collections::HashMap;

use crate::ble::address::BdAddr;
use crate::ble::gatt::AttributeHandle;
use crate::error::{Error, Result};
use crate::registry::cccd::CccdTracker;
use crate::registry::subscriptions::SubscriptionKind;

/// Capability flags reported in the Connected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceFlags(u32);

impl DeviceFlags {
    /// The device exposes Intermediate Cuff Pressure.
    pub const INTERMEDIATE_CUFF_PRESSURE_SUPPORTED: u32 = 0x0000_0001;

    /// Create from the raw flags.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw flags.
    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// Check for Intermediate Cuff Pressure support.
    pub fn supports_intermediate_cuff_pressure(&self) -> bool {
        self.0 & Self::INTERMEDIATE_CUFF_PRESSURE_SUPPORTED != 0
    }
}

/// Characteristic handles cached from service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceHandles {
    /// Blood Pressure Measurement value handle.
    pub measurement: AttributeHandle,
    /// Blood Pressure Measurement CCCD handle.
    pub measurement_cccd: AttributeHandle,
    /// Intermediate Cuff Pressure value and CCCD handles, if supported.
    pub cuff_pressure: Option<(AttributeHandle, AttributeHandle)>,
    /// Blood Pressure Feature value handle.
    pub feature: AttributeHandle,
}

impl DeviceHandles {
    /// CCCD handle for a subscription kind.
    pub fn cccd(&self, kind: SubscriptionKind) -> Option<AttributeHandle> {
        match kind {
            SubscriptionKind::Measurement => Some(self.measurement_cccd),
            SubscriptionKind::IntermediateCuffPressure => self.cuff_pressure.map(|(_, cccd)| cccd),
        }
    }

    /// Value handle for a subscription kind.
    pub fn value(&self, kind: SubscriptionKind) -> Option<AttributeHandle> {
        match kind {
            SubscriptionKind::Measurement => Some(self.measurement),
            SubscriptionKind::IntermediateCuffPressure => {
                self.cuff_pressure.map(|(value, _)| value)
            }
        }
    }
}

/// A peripheral with a bound Blood Pressure service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Current address.
    pub address: BdAddr,
    /// Capability flags.
    pub flags: DeviceFlags,
    /// Cached handles.
    pub handles: DeviceHandles,
    measurement: CccdTracker,
    cuff_pressure: CccdTracker,
}

impl DeviceEntry {
    /// Create an entry with both CCCDs disabled.
    pub fn new(address: BdAddr, handles: DeviceHandles) -> Self {
        let flags = if handles.cuff_pressure.is_some() {
            DeviceFlags::from_raw(DeviceFlags::INTERMEDIATE_CUFF_PRESSURE_SUPPORTED)
        } else {
            DeviceFlags::default()
        };

        Self {
            address,
            flags,
            handles,
            measurement: CccdTracker::default(),
            cuff_pressure: CccdTracker::default(),
        }
    }

    /// Check if a subscription kind is available on this device.
    pub fn supports(&self, kind: SubscriptionKind) -> bool {
        self.handles.cccd(kind).is_some()
    }

    /// CCCD tracker for a subscription kind.
    pub fn tracker(&self, kind: SubscriptionKind) -> &CccdTracker {
        match kind {
            SubscriptionKind::Measurement => &self.measurement,
            SubscriptionKind::IntermediateCuffPressure => &self.cuff_pressure,
        }
    }

    /// Mutable CCCD tracker for a subscription kind.
    pub fn tracker_mut(&mut self, kind: SubscriptionKind) -> &mut CccdTracker {
        match kind {
            SubscriptionKind::Measurement => &mut self.measurement,
            SubscriptionKind::IntermediateCuffPressure => &mut self.cuff_pressure,
        }
    }

    /// Subscription kind whose value handle matches, if any.
    pub fn kind_for_value_handle(&self, handle: AttributeHandle) -> Option<SubscriptionKind> {
        [
            SubscriptionKind::Measurement,
            SubscriptionKind::IntermediateCuffPressure,
        ]
        .into_iter()
        .find(|kind| self.handles.value(*kind) == Some(handle))
    }
}

/// Keyed store of bound devices.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<BdAddr, DeviceEntry>,
}

impl DeviceRegistry {
    /// Look up a device.
    pub fn find(&self, address: &BdAddr) -> Option<&DeviceEntry> {
        self.devices.get(address)
    }

    /// Look up a device for mutation.
    pub fn find_mut(&mut self, address: &BdAddr) -> Option<&mut DeviceEntry> {
        self.devices.get_mut(address)
    }

    /// Insert a device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the address is already present.
    pub fn insert(&mut self, entry: DeviceEntry) -> Result<()> {
        if self.devices.contains_key(&entry.address) {
            return Err(Error::InvalidParameter {
                name: "address".to_string(),
                value: entry.address.to_string(),
            });
        }
        self.devices.insert(entry.address, entry);
        Ok(())
    }

    /// Remove a device.
    pub fn remove(&mut self, address: &BdAddr) -> Option<DeviceEntry> {
        self.devices.remove(address)
    }

    /// Move an entry to a new address, keeping its state.
    ///
    /// Returns `false` if no entry exists under `previous` or one already
    /// exists under `current`.
    pub fn rekey(&mut self, previous: &BdAddr, current: BdAddr) -> bool {
        if self.devices.contains_key(&current) {
            return false;
        }
        match self.devices.remove(previous) {
            Some(mut entry) => {
                entry.address = current;
                self.devices.insert(current, entry);
                true
            }
            None => false,
        }
    }

    /// Addresses of every bound device.
    pub fn addresses(&self) -> Vec<BdAddr> {
        self.devices.keys().copied().collect()
    }

    /// Number of bound devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if no device is bound.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
