//! Per-callback subscription sets.

use std::collections::HashMap;
use std::fmt;

use crate::ble::address::BdAddr;

/// The two subscribable characteristics of the Blood Pressure service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SubscriptionKind {
    /// Blood Pressure Measurement indications.
    Measurement,
    /// Intermediate Cuff Pressure notifications.
    IntermediateCuffPressure,
}

impl SubscriptionKind {
    /// CCCD value that enables this kind of push.
    pub fn enable_value(&self) -> u16 {
        match self {
            Self::Measurement => 0x0002,
            Self::IntermediateCuffPressure => 0x0001,
        }
    }

    /// Create from the wire byte.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Measurement),
            1 => Some(Self::IntermediateCuffPressure),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn to_raw(&self) -> u8 {
        match self {
            Self::Measurement => 0,
            Self::IntermediateCuffPressure => 1,
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measurement => write!(f, "BPM"),
            Self::IntermediateCuffPressure => write!(f, "ICP"),
        }
    }
}

/// Devices one callback wants events from, with the number of outstanding
/// enables per device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    entries: HashMap<BdAddr, u32>,
}

impl SubscriptionSet {
    /// Add one reference for a device. Returns the new reference count.
    pub fn add(&mut self, address: BdAddr) -> u32 {
        let count = self.entries.entry(address).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop one reference for a device. Returns `false` if none was held.
    pub fn remove_one(&mut self, address: &BdAddr) -> bool {
        match self.entries.get_mut(address) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.entries.remove(address);
                true
            }
            None => false,
        }
    }

    /// Drop every reference for a device. Returns how many were held.
    pub fn remove_all(&mut self, address: &BdAddr) -> u32 {
        self.entries.remove(address).unwrap_or(0)
    }

    /// Check if the device is subscribed.
    pub fn contains(&self, address: &BdAddr) -> bool {
        self.entries.contains_key(address)
    }

    /// References held for a device.
    pub fn count(&self, address: &BdAddr) -> u32 {
        self.entries.get(address).copied().unwrap_or(0)
    }

    /// Move a device's references to a new address.
    pub fn rekey(&mut self, previous: &BdAddr, current: BdAddr) {
        if let Some(count) = self.entries.remove(previous) {
            *self.entries.entry(current).or_insert(0) += count;
        }
    }

    /// Drain every device and its reference count.
    pub fn drain(&mut self) -> impl Iterator<Item = (BdAddr, u32)> + '_ {
        self.entries.drain()
    }

    /// Check if nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct devices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
