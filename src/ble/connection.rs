//! Device connection and pairing state feed.
//!
//! The device manager that owns links and bonds reports changes as
//! [`DeviceEvent`]s. The collector only needs one query back into it:
//! whether a device is bonded over an encrypted link, which gates CCCD
//! persistence.

use crate::ble::address::BdAddr;

/// A change reported by the device manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The local controller powered on.
    PoweredOn,
    /// The local controller is powering off.
    PoweredOff,
    /// An LE link is up and the remote services are known.
    Connected {
        /// The device.
        address: BdAddr,
    },
    /// The LE link went down.
    Disconnected {
        /// The device.
        address: BdAddr,
    },
    /// The remote services are no longer known (e.g. Service Changed).
    ServicesUnknown {
        /// The device.
        address: BdAddr,
    },
    /// The device is paired and the link is encrypted.
    Paired {
        /// The device.
        address: BdAddr,
    },
    /// The pairing was removed.
    Unpaired {
        /// The device.
        address: BdAddr,
    },
    /// The device's resolvable address rotated.
    AddressChanged {
        /// Address the device was known under.
        previous: BdAddr,
        /// Address the device is known under now.
        current: BdAddr,
    },
    /// The device was deleted from the device manager.
    Deleted {
        /// The device.
        address: BdAddr,
    },
}

/// Link security queries answered by the device manager.
#[cfg_attr(test, mockall::automock)]
pub trait LinkSecurity: Send + Sync {
    /// Paired over LE, link currently encrypted, services known.
    fn is_bonded(&self, address: &BdAddr) -> bool;
}
