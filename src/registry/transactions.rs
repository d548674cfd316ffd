//! Outstanding GATT transactions issued on behalf of collector requests.

use std::collections::BTreeMap;

use crate::ble::address::BdAddr;
use crate::ble::gatt::{AttributeHandle, GattTransactionId};
use crate::error::{Error, Result};
use crate::registry::devices::DeviceRegistry;
use crate::registry::subscriptions::SubscriptionKind;
use crate::registry::{CallbackId, TransactionId};
use crate::utils::next_id;

/// Operation a transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Read the Blood Pressure Feature value.
    ReadFeature,
    /// Write a CCCD.
    WriteCccd {
        /// Characteristic whose CCCD is written.
        kind: SubscriptionKind,
        /// Enable (`true`) or disable (`false`).
        enable: bool,
    },
}

/// One outstanding transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEntry {
    /// Id handed to the collector.
    pub id: TransactionId,
    /// Id assigned by the GATT layer once submitted.
    pub gatt_id: Option<GattTransactionId>,
    /// Operation.
    pub kind: TransactionKind,
    /// Target device.
    pub address: BdAddr,
    /// Callback that caused the transaction.
    pub callback_id: CallbackId,
    /// Issued by the manager to bring the CCCD back in line with the
    /// subscriber count, not on behalf of a request.
    pub corrective: bool,
    /// Target attribute handle.
    pub handle: AttributeHandle,
}

/// Keyed store of outstanding transactions.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    entries: BTreeMap<TransactionId, TransactionEntry>,
    next_id: u32,
}

impl TransactionRegistry {
    /// Start a transaction.
    ///
    /// Resolves the target handle from the device entry before an id is
    /// allocated.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownDevice`] if no device is bound under `address`.
    /// - [`Error::DuplicateOutstandingRequest`] if the same operation is
    ///   already outstanding for this device and callback.
    /// - [`Error::AttributeNotSupported`] if the device lacks the attribute.
    pub fn begin(
        &mut self,
        callback_id: CallbackId,
        devices: &DeviceRegistry,
        address: BdAddr,
        kind: TransactionKind,
    ) -> Result<TransactionId> {
        let device = devices.find(&address).ok_or(Error::UnknownDevice)?;

        let duplicate = self.entries.values().any(|entry| {
            entry.address == address && entry.kind == kind && entry.callback_id == callback_id
        });
        if duplicate {
            return Err(Error::DuplicateOutstandingRequest);
        }

        let handle = match kind {
            TransactionKind::ReadFeature => Some(device.handles.feature),
            TransactionKind::WriteCccd { kind, .. } => device.handles.cccd(kind),
        }
        .ok_or(Error::AttributeNotSupported)?;

        let id = self.allocate_id();
        self.entries.insert(
            id,
            TransactionEntry {
                id,
                gatt_id: None,
                kind,
                address,
                callback_id,
                corrective: false,
                handle,
            },
        );

        Ok(id)
    }

    fn allocate_id(&mut self) -> TransactionId {
        loop {
            let id = TransactionId::new(next_id(&mut self.next_id));
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Record the GATT-layer id once the request is submitted.
    pub fn attach_gatt_id(&mut self, id: TransactionId, gatt_id: GattTransactionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.gatt_id = Some(gatt_id);
        }
    }

    /// Flag a transaction as a corrective CCCD write.
    pub fn mark_corrective(&mut self, id: TransactionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.corrective = true;
        }
    }

    /// Look up a transaction.
    pub fn get(&self, id: TransactionId) -> Option<&TransactionEntry> {
        self.entries.get(&id)
    }

    /// Remove and return a transaction by its own id.
    pub fn complete_by_id(&mut self, id: TransactionId) -> Option<TransactionEntry> {
        self.entries.remove(&id)
    }

    /// Remove and return a transaction by its GATT-layer id.
    pub fn complete_by_gatt_id(&mut self, gatt_id: GattTransactionId) -> Option<TransactionEntry> {
        let id = self
            .entries
            .values()
            .find(|entry| entry.gatt_id == Some(gatt_id))
            .map(|entry| entry.id)?;
        self.entries.remove(&id)
    }

    /// Remove a transaction the collector no longer wants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if no such transaction is outstanding.
    pub fn cancel(&mut self, id: TransactionId) -> Result<TransactionEntry> {
        self.entries
            .remove(&id)
            .ok_or_else(|| Error::InvalidParameter {
                name: "transaction_id".to_string(),
                value: id.to_string(),
            })
    }

    /// Remove and return every transaction for a device, oldest first.
    pub fn purge_for_device(&mut self, address: &BdAddr) -> Vec<TransactionEntry> {
        let ids: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.address == *address)
            .map(|entry| entry.id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Remove and return every transaction.
    pub fn drain(&mut self) -> Vec<TransactionEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Point every transaction for a device at its new address.
    pub fn rekey_device(&mut self, previous: &BdAddr, current: BdAddr) {
        for entry in self.entries.values_mut() {
            if entry.address == *previous {
                entry.address = current;
            }
        }
    }

    /// Ids of the transactions outstanding for a device.
    pub fn ids_for_device(&self, address: &BdAddr) -> Vec<TransactionId> {
        self.entries
            .values()
            .filter(|entry| entry.address == *address)
            .map(|entry| entry.id)
            .collect()
    }

    /// Number of outstanding transactions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::devices::{DeviceEntry, DeviceHandles};

    const ADDR: BdAddr = BdAddr::new([0xAA, 0, 0, 0, 0, 1]);

    fn devices() -> DeviceRegistry {
        let mut devices = DeviceRegistry::default();
        devices
            .insert(DeviceEntry::new(
                ADDR,
                DeviceHandles {
                    measurement: 0x10,
                    measurement_cccd: 0x11,
                    cuff_pressure: None,
                    feature: 0x15,
                },
            ))
            .unwrap();
        devices
    }

    #[test]
    fn test_begin_resolves_handles() {
        let devices = devices();
        let mut txns = TransactionRegistry::default();
        let cb = CallbackId::new(1);

        let read = txns.begin(cb, &devices, ADDR, TransactionKind::ReadFeature).unwrap();
        assert_eq!(txns.get(read).unwrap().handle, 0x15);

        let write = txns
            .begin(
                cb,
                &devices,
                ADDR,
                TransactionKind::WriteCccd {
                    kind: SubscriptionKind::Measurement,
                    enable: true,
                },
            )
            .unwrap();
        assert_eq!(txns.get(write).unwrap().handle, 0x11);
        assert_ne!(read, write);
    }

    #[test]
    fn test_begin_errors() {
        let devices = devices();
        let mut txns = TransactionRegistry::default();
        let cb = CallbackId::new(1);

        assert_eq!(
            txns.begin(cb, &devices, BdAddr::NULL, TransactionKind::ReadFeature),
            Err(Error::UnknownDevice)
        );

        txns.begin(cb, &devices, ADDR, TransactionKind::ReadFeature).unwrap();
        assert_eq!(
            txns.begin(cb, &devices, ADDR, TransactionKind::ReadFeature),
            Err(Error::DuplicateOutstandingRequest)
        );

        // Another callback may issue the same operation.
        assert!(txns
            .begin(CallbackId::new(2), &devices, ADDR, TransactionKind::ReadFeature)
            .is_ok());

        assert_eq!(
            txns.begin(
                cb,
                &devices,
                ADDR,
                TransactionKind::WriteCccd {
                    kind: SubscriptionKind::IntermediateCuffPressure,
                    enable: true,
                },
            ),
            Err(Error::AttributeNotSupported)
        );
        assert_eq!(txns.len(), 2);
    }

    #[test]
    fn test_complete_by_gatt_id() {
        let devices = devices();
        let mut txns = TransactionRegistry::default();
        let id = txns
            .begin(CallbackId::new(1), &devices, ADDR, TransactionKind::ReadFeature)
            .unwrap();
        txns.attach_gatt_id(id, 77);

        assert!(txns.complete_by_gatt_id(78).is_none());
        let entry = txns.complete_by_gatt_id(77).unwrap();
        assert_eq!(entry.id, id);
        assert!(txns.is_empty());
    }

    #[test]
    fn test_cancel_unknown() {
        let mut txns = TransactionRegistry::default();
        assert!(matches!(
            txns.cancel(TransactionId::new(9)),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_purge_and_rekey() {
        let devices = devices();
        let mut txns = TransactionRegistry::default();
        let a = txns
            .begin(CallbackId::new(1), &devices, ADDR, TransactionKind::ReadFeature)
            .unwrap();
        let b = txns
            .begin(CallbackId::new(2), &devices, ADDR, TransactionKind::ReadFeature)
            .unwrap();

        let new = BdAddr::new([0xBB, 0, 0, 0, 0, 2]);
        txns.rekey_device(&ADDR, new);
        assert_eq!(txns.ids_for_device(&new), vec![a, b]);
        assert!(txns.purge_for_device(&ADDR).is_empty());

        let purged = txns.purge_for_device(&new);
        assert_eq!(purged.len(), 2);
        assert!(txns.is_empty());
    }
}
