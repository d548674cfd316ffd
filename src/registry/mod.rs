//! Collector registries.
//!
//! [`Registry`] bundles the callback, device and transaction registries
//! behind the manager's single lock and implements every operation that
//! touches more than one of them. Operations never call user code: they
//! queue events and persistence steps in an [`Outbox`] that the caller
//! flushes after releasing the lock.

pub mod callbacks;
pub mod cccd;
pub mod devices;
pub mod subscriptions;
pub mod transactions;

use std::fmt;

use tracing::{debug, info, warn};

use crate::ble::address::BdAddr;
use crate::ble::connection::LinkSecurity;
use crate::ble::gatt::{error_from_att_code, AttributeHandle, GattClient, GattEvent};
use crate::data::feature::BloodPressureFeature;
use crate::dispatch::{Event, Outbox};
use crate::error::{Error, Result};
use crate::protocol::measurement::decode_measurement;
use crate::storage::{PersistOp, PersistedCccd};

use callbacks::{AddressId, CallbackRegistry, Endpoint};
use cccd::{CccdAction, CccdState};
use devices::{DeviceEntry, DeviceHandles, DeviceRegistry};
use subscriptions::SubscriptionKind;
use transactions::{TransactionEntry, TransactionKind, TransactionRegistry};

/// Identifier of a collector registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallbackId(u32);

impl CallbackId {
    /// Create from the raw id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw id.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an outstanding collector transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransactionId(u32);

impl TransactionId {
    /// Create from the raw id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw id.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// All collector state guarded by the manager lock.
#[derive(Debug, Default)]
pub struct Registry {
    /// Registered consumers.
    pub callbacks: CallbackRegistry,
    /// Bound sensors.
    pub devices: DeviceRegistry,
    /// Outstanding GATT transactions.
    pub transactions: TransactionRegistry,
}

impl Registry {
    /// Create empty registries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event consumer.
    pub fn register(&mut self, endpoint: Endpoint) -> Result<CallbackId> {
        let id = self.callbacks.register(endpoint)?;
        info!("Registered collector callback {}", id);
        Ok(id)
    }

    /// Remove a registration and release every subscription it holds.
    ///
    /// Each held reference is released as if the callback had disabled it,
    /// so a device whose count reaches zero gets a disable write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallbackNotRegistered`] if `id` is not registered.
    pub fn unregister(&mut self, id: CallbackId, gatt: &dyn GattClient) -> Result<()> {
        let mut entry = self.callbacks.remove(id).ok_or(Error::CallbackNotRegistered)?;

        for kind in [
            SubscriptionKind::Measurement,
            SubscriptionKind::IntermediateCuffPressure,
        ] {
            let held: Vec<(BdAddr, u32)> = entry.subscriptions_mut(kind).drain().collect();
            for (address, references) in held {
                for _ in 0..references {
                    self.release_reference(id, address, kind, gatt);
                }
            }
        }

        info!("Unregistered collector callback {}", id);
        Ok(())
    }

    fn release_reference(
        &mut self,
        callback_id: CallbackId,
        address: BdAddr,
        kind: SubscriptionKind,
        gatt: &dyn GattClient,
    ) {
        let action = match self.devices.find_mut(&address) {
            Some(device) => device.tracker_mut(kind).request_disable(),
            None => return,
        };

        if let CccdAction::Write(enable) = action {
            if let Err(e) = self.submit_cccd_write(gatt, callback_id, address, kind, enable) {
                warn!("Failed to disable {} on {}: {}", kind, address, e);
                if let Some(device) = self.devices.find_mut(&address) {
                    device.tracker_mut(kind).write_completed(enable, false);
                }
            }
        }
    }

    /// Unregister every callback owned by a messaging endpoint.
    pub fn purge_endpoint(&mut self, address_id: AddressId, gatt: &dyn GattClient) -> usize {
        let ids = self.callbacks.ids_for_endpoint(address_id);
        for id in &ids {
            let _ = self.unregister(*id, gatt);
        }
        if !ids.is_empty() {
            info!(
                "Endpoint {:#010x} closed, removed {} callback(s)",
                address_id,
                ids.len()
            );
        }
        ids.len()
    }

    /// Unregister every callback.
    pub fn purge_all(&mut self, gatt: &dyn GattClient) {
        for id in self.callbacks.ids() {
            let _ = self.unregister(id, gatt);
        }
    }

    /// Enable Blood Pressure Measurement indications or Intermediate Cuff
    /// Pressure notifications from a device for a callback.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCallbackSpecified`] if the callback is not registered.
    /// - [`Error::UnknownDevice`] if the device is not bound.
    /// - [`Error::AttributeNotSupported`] if the device lacks the characteristic.
    /// - The mapped GATT error if the CCCD write could not be submitted.
    pub fn enable(
        &mut self,
        callback_id: CallbackId,
        address: BdAddr,
        kind: SubscriptionKind,
        gatt: &dyn GattClient,
    ) -> Result<()> {
        if self.callbacks.lookup(callback_id).is_none() {
            return Err(Error::InvalidCallbackSpecified);
        }

        let action = {
            let device = self.devices.find_mut(&address).ok_or(Error::UnknownDevice)?;
            if !device.supports(kind) {
                return Err(Error::AttributeNotSupported);
            }
            device.tracker_mut(kind).request_enable()
        };

        if let CccdAction::Write(enable) = action {
            if let Err(e) = self.submit_cccd_write(gatt, callback_id, address, kind, enable) {
                if let Some(device) = self.devices.find_mut(&address) {
                    device.tracker_mut(kind).abort_write(enable);
                }
                return Err(e);
            }
        }

        if let Some(entry) = self.callbacks.lookup_mut(callback_id) {
            entry.subscriptions_mut(kind).add(address);
        }
        debug!("Callback {} enabled {} on {}", callback_id, kind, address);
        Ok(())
    }

    /// Drop one of a callback's references to a device's characteristic.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCallbackSpecified`] if the callback is not registered.
    /// - [`Error::UnknownDevice`] if the device is not bound.
    /// - [`Error::NotSubscribed`] if the callback holds no reference.
    /// - The mapped GATT error if the CCCD write could not be submitted.
    pub fn disable(
        &mut self,
        callback_id: CallbackId,
        address: BdAddr,
        kind: SubscriptionKind,
        gatt: &dyn GattClient,
    ) -> Result<()> {
        let entry = self
            .callbacks
            .lookup_mut(callback_id)
            .ok_or(Error::InvalidCallbackSpecified)?;
        let device = self.devices.find_mut(&address).ok_or(Error::UnknownDevice)?;
        if !entry.subscriptions_mut(kind).remove_one(&address) {
            return Err(Error::NotSubscribed);
        }

        let action = device.tracker_mut(kind).request_disable();
        if let CccdAction::Write(enable) = action {
            if let Err(e) = self.submit_cccd_write(gatt, callback_id, address, kind, enable) {
                if let Some(device) = self.devices.find_mut(&address) {
                    device.tracker_mut(kind).abort_write(enable);
                }
                if let Some(entry) = self.callbacks.lookup_mut(callback_id) {
                    entry.subscriptions_mut(kind).add(address);
                }
                return Err(e);
            }
        }

        debug!("Callback {} disabled {} on {}", callback_id, kind, address);
        Ok(())
    }

    fn submit_cccd_write(
        &mut self,
        gatt: &dyn GattClient,
        callback_id: CallbackId,
        address: BdAddr,
        kind: SubscriptionKind,
        enable: bool,
    ) -> Result<TransactionId> {
        let id = self.transactions.begin(
            callback_id,
            &self.devices,
            address,
            TransactionKind::WriteCccd { kind, enable },
        )?;
        let handle = self.transaction_handle(id)?;
        let value = if enable { kind.enable_value() } else { 0 };

        match gatt.write_value(&address, handle, &value.to_le_bytes()) {
            Ok(gatt_id) => {
                self.transactions.attach_gatt_id(id, gatt_id);
                debug!(
                    "CCCD write {} ({} {}) submitted to {} as {}",
                    id,
                    kind,
                    if enable { "on" } else { "off" },
                    address,
                    gatt_id
                );
                Ok(id)
            }
            Err(e) => {
                self.transactions.complete_by_id(id);
                Err(e.into())
            }
        }
    }

    fn transaction_handle(&self, id: TransactionId) -> Result<AttributeHandle> {
        self.transactions
            .get(id)
            .map(|entry| entry.handle)
            .ok_or(Error::InvalidHandle)
    }

    /// Read a device's Blood Pressure Feature.
    ///
    /// The value arrives later as [`Event::FeatureResponse`] for the
    /// returned transaction.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCallbackSpecified`] if the callback is not registered.
    /// - [`Error::UnknownDevice`] if the device is not bound.
    /// - [`Error::DuplicateOutstandingRequest`] if this callback already has
    ///   a feature read outstanding on the device.
    /// - The mapped GATT error if the read could not be submitted.
    pub fn get_feature(
        &mut self,
        callback_id: CallbackId,
        address: BdAddr,
        gatt: &dyn GattClient,
    ) -> Result<TransactionId> {
        if self.callbacks.lookup(callback_id).is_none() {
            return Err(Error::InvalidCallbackSpecified);
        }

        let id = self.transactions.begin(
            callback_id,
            &self.devices,
            address,
            TransactionKind::ReadFeature,
        )?;
        let handle = self.transaction_handle(id)?;

        match gatt.read_value(&address, handle) {
            Ok(gatt_id) => {
                self.transactions.attach_gatt_id(id, gatt_id);
                debug!("Feature read {} submitted to {} as {}", id, address, gatt_id);
                Ok(id)
            }
            Err(e) => {
                self.transactions.complete_by_id(id);
                Err(e.into())
            }
        }
    }

    /// Cancel a transaction owned by `callback_id`.
    ///
    /// A cancelled CCCD write is rolled back like a failed one. No outcome
    /// event is delivered.
    ///
    /// # Errors
    ///
    /// - [`Error::CallbackNotRegistered`] if the callback is not registered.
    /// - [`Error::InvalidParameter`] if the transaction is not outstanding or
    ///   belongs to another callback.
    pub fn cancel(
        &mut self,
        callback_id: CallbackId,
        transaction_id: TransactionId,
        gatt: &dyn GattClient,
    ) -> Result<()> {
        if self.callbacks.lookup(callback_id).is_none() {
            return Err(Error::CallbackNotRegistered);
        }

        let owned = self
            .transactions
            .get(transaction_id)
            .map_or(false, |entry| entry.callback_id == callback_id);
        if !owned {
            return Err(Error::InvalidParameter {
                name: "transaction_id".to_string(),
                value: transaction_id.to_string(),
            });
        }

        let entry = self.transactions.cancel(transaction_id)?;
        if let Some(gatt_id) = entry.gatt_id {
            if let Err(e) = gatt.cancel_transaction(gatt_id) {
                debug!("GATT cancel of {} failed: {}", gatt_id, e);
            }
        }

        if let TransactionKind::WriteCccd { kind, enable } = entry.kind {
            if let Some(device) = self.devices.find_mut(&entry.address) {
                device.tracker_mut(kind).write_completed(enable, false);
            }
            if !entry.corrective {
                self.roll_back_reference(callback_id, entry.address, kind, enable);
            }
        }

        debug!("Cancelled transaction {}", transaction_id);
        Ok(())
    }

    /// Handle an asynchronous GATT event.
    pub fn handle_gatt_event(
        &mut self,
        event: GattEvent,
        gatt: &dyn GattClient,
        link: &dyn LinkSecurity,
        outbox: &mut Outbox,
    ) {
        match event {
            GattEvent::ReadResponse {
                transaction_id,
                value,
            } => {
                let Some(entry) = self.transactions.complete_by_gatt_id(transaction_id) else {
                    debug!("Read response for unknown transaction {}", transaction_id);
                    return;
                };
                match entry.kind {
                    TransactionKind::ReadFeature => {
                        let result =
                            BloodPressureFeature::from_bytes(&value).ok_or(Error::ResponseInvalid);
                        self.feature_response(&entry, result, outbox);
                    }
                    TransactionKind::WriteCccd { .. } => {
                        warn!("Read response for CCCD write {}", entry.id);
                    }
                }
            }
            GattEvent::WriteResponse { transaction_id } => {
                let Some(entry) = self.transactions.complete_by_gatt_id(transaction_id) else {
                    debug!("Write response for unknown transaction {}", transaction_id);
                    return;
                };
                match entry.kind {
                    TransactionKind::WriteCccd { kind, enable } => {
                        self.finish_cccd_write(&entry, kind, enable, Ok(()), gatt, link, outbox);
                    }
                    TransactionKind::ReadFeature => {
                        warn!("Write response for feature read {}", entry.id);
                    }
                }
            }
            GattEvent::ErrorResponse {
                transaction_id,
                error_code,
            } => {
                let Some(entry) = self.transactions.complete_by_gatt_id(transaction_id) else {
                    debug!("Error response for unknown transaction {}", transaction_id);
                    return;
                };
                let error = error_from_att_code(error_code);
                debug!(
                    "Transaction {} failed with ATT error {:#04x}",
                    entry.id, error_code
                );
                match entry.kind {
                    TransactionKind::ReadFeature => {
                        self.feature_response(&entry, Err(error), outbox);
                    }
                    TransactionKind::WriteCccd { kind, enable } => {
                        self.finish_cccd_write(&entry, kind, enable, Err(error), gatt, link, outbox);
                    }
                }
            }
            GattEvent::Indication {
                address,
                handle,
                value,
            } => self.handle_value(address, handle, &value, true, outbox),
            GattEvent::Notification {
                address,
                handle,
                value,
            } => self.handle_value(address, handle, &value, false, outbox),
        }
    }

    fn feature_response(
        &self,
        entry: &TransactionEntry,
        result: Result<BloodPressureFeature>,
        outbox: &mut Outbox,
    ) {
        outbox.dispatch_to(
            &self.callbacks,
            entry.callback_id,
            Event::FeatureResponse {
                address: entry.address,
                transaction_id: entry.id,
                result,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_cccd_write(
        &mut self,
        entry: &TransactionEntry,
        kind: SubscriptionKind,
        enable: bool,
        result: Result<()>,
        gatt: &dyn GattClient,
        link: &dyn LinkSecurity,
        outbox: &mut Outbox,
    ) {
        let address = entry.address;
        let success = result.is_ok();

        let action = match self.devices.find_mut(&address) {
            Some(device) => device.tracker_mut(kind).write_completed(enable, success),
            None => CccdAction::None,
        };

        if !success && !entry.corrective {
            self.roll_back_reference(entry.callback_id, address, kind, enable);
        }

        if let CccdAction::Write(next) = action {
            match self.submit_cccd_write(gatt, entry.callback_id, address, kind, next) {
                Ok(id) => self.transactions.mark_corrective(id),
                Err(e) => {
                    warn!("Failed to reconcile {} on {}: {}", kind, address, e);
                    if let Some(device) = self.devices.find_mut(&address) {
                        device.tracker_mut(kind).write_completed(next, false);
                    }
                }
            }
        }

        if success && link.is_bonded(&address) {
            if let Some(state) = self.persisted_state(&address) {
                outbox.persist(PersistOp::Store { address, state });
            }
        }

        if let Err(e) = &result {
            warn!("CCCD write for {} on {} failed: {}", kind, address, e);
        }

        // Nobody asked for a corrective write.
        if entry.corrective {
            return;
        }
        outbox.dispatch_to(
            &self.callbacks,
            entry.callback_id,
            Event::ConfigurationResponse {
                address,
                kind,
                enable,
                result,
            },
        );
    }

    /// Undo the requesting callback's reference after a failed write. A
    /// callback that has since dropped the reference, or gone away, has
    /// nothing to undo.
    fn roll_back_reference(
        &mut self,
        callback_id: CallbackId,
        address: BdAddr,
        kind: SubscriptionKind,
        enable: bool,
    ) {
        let Some(callback) = self.callbacks.lookup_mut(callback_id) else {
            return;
        };
        let Some(device) = self.devices.find_mut(&address) else {
            return;
        };

        if enable {
            if callback.subscriptions_mut(kind).remove_one(&address) {
                device.tracker_mut(kind).release();
            }
        } else {
            callback.subscriptions_mut(kind).add(address);
            device.tracker_mut(kind).retain();
        }
    }

    /// Dispatch a pushed value to the callbacks subscribed to it.
    ///
    /// Indications are accepted only from the Measurement handle and
    /// notifications only from the Intermediate Cuff Pressure handle.
    pub fn handle_value(
        &self,
        address: BdAddr,
        handle: AttributeHandle,
        value: &[u8],
        indication: bool,
        outbox: &mut Outbox,
    ) {
        let Some(device) = self.devices.find(&address) else {
            debug!("Value from unbound device {}", address);
            return;
        };

        let kind = match device.kind_for_value_handle(handle) {
            Some(SubscriptionKind::Measurement) if indication => SubscriptionKind::Measurement,
            Some(SubscriptionKind::IntermediateCuffPressure) if !indication => {
                SubscriptionKind::IntermediateCuffPressure
            }
            _ => {
                debug!("Ignoring value on handle {:#06x} from {}", handle, address);
                return;
            }
        };

        let measurement = match decode_measurement(value) {
            Ok(measurement) => measurement,
            Err(e) => {
                warn!("Dropping {} value from {}: {}", kind, address, e);
                return;
            }
        };

        let event = match kind {
            SubscriptionKind::Measurement => Event::Measurement {
                address,
                measurement,
            },
            SubscriptionKind::IntermediateCuffPressure => Event::IntermediateCuffPressure {
                address,
                measurement,
            },
        };
        outbox.broadcast_filtered(&self.callbacks, event, |entry| {
            entry.is_subscribed(kind, &address)
        });
    }

    /// Add a device whose Blood Pressure service was discovered and tell
    /// every callback it connected.
    pub fn bind_device(
        &mut self,
        address: BdAddr,
        handles: DeviceHandles,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let entry = DeviceEntry::new(address, handles);
        let flags = entry.flags;
        self.devices.insert(entry)?;

        info!("Bound Blood Pressure sensor {}", address);
        outbox.broadcast(&self.callbacks, Event::Connected { address, flags });
        Ok(())
    }

    /// Remove a device.
    ///
    /// Pending transactions complete with [`Error::NotConnected`] before the
    /// device is removed and [`Event::Disconnected`] is broadcast. Returns
    /// `false` if the device was not bound.
    pub fn disconnect_device(&mut self, address: &BdAddr, outbox: &mut Outbox) -> bool {
        if self.devices.find(address).is_none() {
            return false;
        }

        for entry in self.transactions.purge_for_device(address) {
            if entry.corrective {
                continue;
            }
            let event = match entry.kind {
                TransactionKind::ReadFeature => Event::FeatureResponse {
                    address: entry.address,
                    transaction_id: entry.id,
                    result: Err(Error::NotConnected),
                },
                TransactionKind::WriteCccd { kind, enable } => Event::ConfigurationResponse {
                    address: entry.address,
                    kind,
                    enable,
                    result: Err(Error::NotConnected),
                },
            };
            outbox.dispatch_to(&self.callbacks, entry.callback_id, event);
        }

        self.devices.remove(address);
        outbox.broadcast(&self.callbacks, Event::Disconnected { address: *address });
        self.callbacks.remove_device(address);

        info!("Removed Blood Pressure sensor {}", address);
        true
    }

    /// Disconnect every device.
    pub fn disconnect_all(&mut self, outbox: &mut Outbox) {
        for address in self.devices.addresses() {
            self.disconnect_device(&address, outbox);
        }
    }

    /// Follow a resolvable address rotation.
    ///
    /// Moves the device entry, subscriptions and transactions to the new
    /// address and migrates persisted state. Returns `false` if no device
    /// was bound under `previous`.
    pub fn rekey_device(
        &mut self,
        previous: &BdAddr,
        current: BdAddr,
        link: &dyn LinkSecurity,
        outbox: &mut Outbox,
    ) -> bool {
        outbox.persist(PersistOp::Migrate {
            previous: *previous,
            current,
        });

        if !self.devices.rekey(previous, current) {
            return false;
        }
        self.callbacks.rekey_device(previous, current);
        self.transactions.rekey_device(previous, current);

        if link.is_bonded(&current) {
            if let Some(state) = self.persisted_state(&current) {
                outbox.persist(PersistOp::Store {
                    address: current,
                    state,
                });
            }
        }

        info!("Sensor {} is now {}", previous, current);
        true
    }

    /// Merge persisted CCCD flags into a newly paired device.
    ///
    /// A persisted "enabled" flag marks a settled disabled characteristic
    /// enabled. The merged state is written back when it differs from
    /// what was stored.
    pub fn apply_persisted(
        &mut self,
        address: &BdAddr,
        persisted: Option<PersistedCccd>,
        link: &dyn LinkSecurity,
        outbox: &mut Outbox,
    ) {
        if !link.is_bonded(address) {
            return;
        }
        let Some(device) = self.devices.find_mut(address) else {
            return;
        };

        let stored = persisted.unwrap_or_default();
        for kind in [
            SubscriptionKind::Measurement,
            SubscriptionKind::IntermediateCuffPressure,
        ] {
            if device.supports(kind) {
                device.tracker_mut(kind).restore(stored.get(kind));
            }
        }

        if let Some(merged) = self.persisted_state(address) {
            if merged != stored {
                outbox.persist(PersistOp::Store {
                    address: *address,
                    state: merged,
                });
            }
        }
    }

    /// CCCD flags of a device as they would be persisted.
    pub fn persisted_state(&self, address: &BdAddr) -> Option<PersistedCccd> {
        self.devices.find(address).map(|device| PersistedCccd {
            measurement: device.tracker(SubscriptionKind::Measurement).is_enabled(),
            cuff_pressure: device
                .tracker(SubscriptionKind::IntermediateCuffPressure)
                .is_enabled(),
        })
    }

    /// Remove every transaction, best-effort cancelling the ones already
    /// submitted.
    pub fn cancel_all(&mut self, gatt: &dyn GattClient) {
        for entry in self.transactions.drain() {
            if let Some(gatt_id) = entry.gatt_id {
                if let Err(e) = gatt.cancel_transaction(gatt_id) {
                    debug!("GATT cancel of {} failed: {}", gatt_id, e);
                }
            }
        }
    }

    /// Subscriber references for a device's characteristic.
    pub fn reference_count(&self, address: &BdAddr, kind: SubscriptionKind) -> Option<u32> {
        self.devices
            .find(address)
            .map(|device| device.tracker(kind).count())
    }

    /// CCCD state of a device's characteristic.
    pub fn cccd_state(&self, address: &BdAddr, kind: SubscriptionKind) -> Option<CccdState> {
        self.devices
            .find(address)
            .map(|device| device.tracker(kind).state())
    }
}
