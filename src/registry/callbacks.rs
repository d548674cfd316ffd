//! Callback registry.
//!
//! Holds the registered event consumers and their subscription sets.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::ble::address::BdAddr;
use crate::dispatch::Event;
use crate::error::{Error, Result};
use crate::registry::subscriptions::{SubscriptionKind, SubscriptionSet};
use crate::registry::CallbackId;
use crate::utils::next_id;

/// Maximum number of collector registrations alive at once.
pub const MAX_COLLECTOR_CALLBACKS: usize = 1;

/// Identity of a messaging endpoint.
pub type AddressId = u32;

/// In-process event handler.
pub type EventHandler = Arc<dyn Fn(CallbackId, &Event) + Send + Sync>;

/// Where a callback's events go.
#[derive(Clone)]
pub enum Endpoint {
    /// A handler in this process.
    Local(EventHandler),
    /// A client process reached over the messaging channel.
    Remote(AddressId),
}

impl Endpoint {
    /// Messaging address, for remote endpoints.
    pub fn remote_address(&self) -> Option<AddressId> {
        match self {
            Self::Local(_) => None,
            Self::Remote(address) => Some(*address),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_) => write!(f, "Local"),
            Self::Remote(address) => write!(f, "Remote({address:#010x})"),
        }
    }
}

/// One registered event consumer.
#[derive(Debug, Clone)]
pub struct CallbackEntry {
    /// Registration id.
    pub id: CallbackId,
    /// Event destination.
    pub endpoint: Endpoint,
    measurement: SubscriptionSet,
    cuff_pressure: SubscriptionSet,
}

impl CallbackEntry {
    fn new(id: CallbackId, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            measurement: SubscriptionSet::default(),
            cuff_pressure: SubscriptionSet::default(),
        }
    }

    /// Subscription set for a kind.
    pub fn subscriptions(&self, kind: SubscriptionKind) -> &SubscriptionSet {
        match kind {
            SubscriptionKind::Measurement => &self.measurement,
            SubscriptionKind::IntermediateCuffPressure => &self.cuff_pressure,
        }
    }

    /// Mutable subscription set for a kind.
    pub fn subscriptions_mut(&mut self, kind: SubscriptionKind) -> &mut SubscriptionSet {
        match kind {
            SubscriptionKind::Measurement => &mut self.measurement,
            SubscriptionKind::IntermediateCuffPressure => &mut self.cuff_pressure,
        }
    }

    /// Check if this callback wants `kind` events from a device.
    pub fn is_subscribed(&self, kind: SubscriptionKind, address: &BdAddr) -> bool {
        self.subscriptions(kind).contains(address)
    }

    /// Check if this callback belongs to a messaging endpoint.
    pub fn is_owned_by(&self, address_id: AddressId) -> bool {
        self.endpoint.remote_address() == Some(address_id)
    }
}

/// Keyed store of callback registrations.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    entries: BTreeMap<CallbackId, CallbackEntry>,
    next_id: u32,
}

impl CallbackRegistry {
    /// Register a consumer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] if the registry is full.
    pub fn register(&mut self, endpoint: Endpoint) -> Result<CallbackId> {
        if self.entries.len() >= MAX_COLLECTOR_CALLBACKS {
            return Err(Error::AlreadyRegistered);
        }

        let id = loop {
            let id = CallbackId::new(next_id(&mut self.next_id));
            if !self.entries.contains_key(&id) {
                break id;
            }
        };

        self.entries.insert(id, CallbackEntry::new(id, endpoint));
        Ok(id)
    }

    /// Remove a registration, returning it with its subscription sets.
    pub fn remove(&mut self, id: CallbackId) -> Option<CallbackEntry> {
        self.entries.remove(&id)
    }

    /// Look up a registration.
    pub fn lookup(&self, id: CallbackId) -> Option<&CallbackEntry> {
        self.entries.get(&id)
    }

    /// Look up a registration for mutation.
    pub fn lookup_mut(&mut self, id: CallbackId) -> Option<&mut CallbackEntry> {
        self.entries.get_mut(&id)
    }

    /// Iterate registrations in id order.
    pub fn iter(&self) -> impl Iterator<Item = &CallbackEntry> {
        self.entries.values()
    }

    /// Every registration id.
    pub fn ids(&self) -> Vec<CallbackId> {
        self.entries.keys().copied().collect()
    }

    /// Registrations owned by a messaging endpoint.
    pub fn ids_for_endpoint(&self, address_id: AddressId) -> Vec<CallbackId> {
        self.entries
            .values()
            .filter(|entry| entry.is_owned_by(address_id))
            .map(|entry| entry.id)
            .collect()
    }

    /// Drop every subscription to a device.
    pub fn remove_device(&mut self, address: &BdAddr) {
        for entry in self.entries.values_mut() {
            entry.measurement.remove_all(address);
            entry.cuff_pressure.remove_all(address);
        }
    }

    /// Move every subscription to a device onto its new address.
    pub fn rekey_device(&mut self, previous: &BdAddr, current: BdAddr) {
        for entry in self.entries.values_mut() {
            entry.measurement.rekey(previous, current);
            entry.cuff_pressure.rekey(previous, current);
        }
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
