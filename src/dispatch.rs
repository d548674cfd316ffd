//! Event fan-out.
//!
//! Targets are resolved while the registry lock is held and collected into
//! an [`Outbox`]. The outbox is delivered by an [`EventDispatcher`] only
//! after the lock is released, so a local handler may call straight back
//! into the manager. Deliveries keep the order in which they were queued.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::ble::address::BdAddr;
use crate::data::feature::BloodPressureFeature;
use crate::data::measurement::PressureMeasurement;
use crate::error::Result;
use crate::protocol::messages::encode_event;
use crate::protocol::transport::MessageTransport;
use crate::registry::callbacks::{CallbackEntry, CallbackRegistry, Endpoint};
use crate::registry::devices::DeviceFlags;
use crate::registry::subscriptions::SubscriptionKind;
use crate::registry::{CallbackId, TransactionId};
use crate::storage::PersistOp;

/// An event delivered to a collector callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A sensor with a Blood Pressure service connected.
    Connected {
        /// The sensor.
        address: BdAddr,
        /// Capability flags.
        flags: DeviceFlags,
    },
    /// A sensor disconnected.
    Disconnected {
        /// The sensor.
        address: BdAddr,
    },
    /// A Blood Pressure Measurement was indicated.
    Measurement {
        /// The sensor.
        address: BdAddr,
        /// Decoded value.
        measurement: PressureMeasurement,
    },
    /// An Intermediate Cuff Pressure value was notified.
    IntermediateCuffPressure {
        /// The sensor.
        address: BdAddr,
        /// Decoded value.
        measurement: PressureMeasurement,
    },
    /// A Blood Pressure Feature read completed.
    FeatureResponse {
        /// The sensor.
        address: BdAddr,
        /// Transaction returned by the request.
        transaction_id: TransactionId,
        /// Feature bits, or why the read failed.
        result: Result<BloodPressureFeature>,
    },
    /// A CCCD write issued for this callback completed.
    ConfigurationResponse {
        /// The sensor.
        address: BdAddr,
        /// Characteristic whose CCCD was written.
        kind: SubscriptionKind,
        /// Enable (`true`) or disable (`false`).
        enable: bool,
        /// Outcome of the write.
        result: Result<()>,
    },
}

impl Event {
    /// Sensor the event concerns.
    pub fn address(&self) -> BdAddr {
        match self {
            Self::Connected { address, .. }
            | Self::Disconnected { address }
            | Self::Measurement { address, .. }
            | Self::IntermediateCuffPressure { address, .. }
            | Self::FeatureResponse { address, .. }
            | Self::ConfigurationResponse { address, .. } => *address,
        }
    }
}

/// An event bound for one callback.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Target registration.
    pub callback_id: CallbackId,
    /// Where to send it.
    pub endpoint: Endpoint,
    /// The event.
    pub event: Event,
}

/// Side effects collected under the registry lock.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Events to deliver.
    pub deliveries: Vec<Delivery>,
    /// Persistence steps to run.
    pub persistence: Vec<PersistOp>,
}

impl Outbox {
    /// Queue an event for one callback. Returns `false` if it is not registered.
    pub fn dispatch_to(
        &mut self,
        callbacks: &CallbackRegistry,
        callback_id: CallbackId,
        event: Event,
    ) -> bool {
        match callbacks.lookup(callback_id) {
            Some(entry) => {
                self.push(entry, event);
                true
            }
            None => {
                debug!("Dropping event for unregistered callback {}", callback_id);
                false
            }
        }
    }

    /// Queue an event for every callback.
    pub fn broadcast(&mut self, callbacks: &CallbackRegistry, event: Event) {
        self.broadcast_filtered(callbacks, event, |_| true);
    }

    /// Queue an event for every callback matching `predicate`.
    pub fn broadcast_filtered<P>(&mut self, callbacks: &CallbackRegistry, event: Event, predicate: P)
    where
        P: Fn(&CallbackEntry) -> bool,
    {
        for entry in callbacks.iter().filter(|entry| predicate(entry)) {
            self.push(entry, event.clone());
        }
    }

    fn push(&mut self, entry: &CallbackEntry, event: Event) {
        self.deliveries.push(Delivery {
            callback_id: entry.id,
            endpoint: entry.endpoint.clone(),
            event,
        });
    }

    /// Queue a persistence step.
    pub fn persist(&mut self, op: PersistOp) {
        self.persistence.push(op);
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.persistence.is_empty()
    }
}

/// Delivers events to local handlers and remote endpoints.
#[derive(Clone)]
pub struct EventDispatcher {
    transport: Arc<dyn MessageTransport>,
}

impl EventDispatcher {
    /// Create a dispatcher sending remote events over `transport`.
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self { transport }
    }

    /// Deliver events in order. Must be called without the registry lock.
    pub fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.deliver_one(delivery);
        }
    }

    fn deliver_one(&self, delivery: Delivery) {
        let Delivery {
            callback_id,
            endpoint,
            event,
        } = delivery;

        match endpoint {
            Endpoint::Local(handler) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(callback_id, &event)));
                if outcome.is_err() {
                    error!("Event handler for callback {} panicked", callback_id);
                }
            }
            Endpoint::Remote(0) => {
                debug!("Callback {} has no endpoint address", callback_id);
            }
            Endpoint::Remote(address_id) => {
                let message = encode_event(
                    address_id,
                    self.transport.next_message_id(),
                    callback_id,
                    &event,
                );
                if let Err(e) = self.transport.send(message) {
                    warn!("Failed to send event to {:#010x}: {}", address_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::MessageFunction;
    use crate::protocol::transport::MockMessageTransport;
    use crate::registry::callbacks::EventHandler;
    use crate::registry::subscriptions::SubscriptionKind;
    use parking_lot::Mutex;

    const ADDR: BdAddr = BdAddr::new([1, 2, 3, 4, 5, 6]);

    fn recording_handler() -> (EventHandler, Arc<Mutex<Vec<(CallbackId, Event)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: EventHandler = Arc::new(move |id, event: &Event| {
            sink.lock().push((id, event.clone()));
        });
        (handler, seen)
    }

    #[test]
    fn test_broadcast_filtered_respects_subscriptions() {
        let (handler, _) = recording_handler();
        let mut callbacks = CallbackRegistry::default();
        let id = callbacks.register(Endpoint::Local(handler)).unwrap();

        let event = Event::Measurement {
            address: ADDR,
            measurement: PressureMeasurement::default(),
        };

        let mut outbox = Outbox::default();
        outbox.broadcast_filtered(&callbacks, event.clone(), |entry| {
            entry.is_subscribed(SubscriptionKind::Measurement, &ADDR)
        });
        assert!(outbox.deliveries.is_empty());

        callbacks
            .lookup_mut(id)
            .unwrap()
            .subscriptions_mut(SubscriptionKind::Measurement)
            .add(ADDR);
        outbox.broadcast_filtered(&callbacks, event, |entry| {
            entry.is_subscribed(SubscriptionKind::Measurement, &ADDR)
        });
        assert_eq!(outbox.deliveries.len(), 1);
        assert_eq!(outbox.deliveries[0].callback_id, id);
    }

    #[test]
    fn test_dispatch_to_unknown_callback() {
        let callbacks = CallbackRegistry::default();
        let mut outbox = Outbox::default();
        assert!(!outbox.dispatch_to(
            &callbacks,
            CallbackId::new(5),
            Event::Disconnected { address: ADDR }
        ));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_local_delivery_in_order() {
        let (handler, seen) = recording_handler();
        let mut callbacks = CallbackRegistry::default();
        let id = callbacks.register(Endpoint::Local(handler)).unwrap();

        let mut outbox = Outbox::default();
        outbox.broadcast(&callbacks, Event::Connected {
            address: ADDR,
            flags: DeviceFlags::default(),
        });
        outbox.broadcast(&callbacks, Event::Disconnected { address: ADDR });

        let dispatcher = EventDispatcher::new(Arc::new(MockMessageTransport::new()));
        dispatcher.deliver(outbox.deliveries);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, id);
        assert!(matches!(seen[0].1, Event::Connected { .. }));
        assert!(matches!(seen[1].1, Event::Disconnected { .. }));
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let handler: EventHandler = Arc::new(|_, _| panic!("handler failure"));
        let delivery = Delivery {
            callback_id: CallbackId::new(1),
            endpoint: Endpoint::Local(handler),
            event: Event::Disconnected { address: ADDR },
        };
        EventDispatcher::new(Arc::new(MockMessageTransport::new())).deliver(vec![delivery]);
    }

    #[test]
    fn test_remote_delivery_sends_event_message() {
        let mut transport = MockMessageTransport::new();
        transport.expect_next_message_id().return_const(40u32);
        transport
            .expect_send()
            .withf(|message| {
                message.header.address_id == 0x77
                    && message.header.message_id == 40
                    && message.header.message_function() == MessageFunction::Disconnected
            })
            .times(1)
            .returning(|_| Ok(()));

        let delivery = Delivery {
            callback_id: CallbackId::new(1),
            endpoint: Endpoint::Remote(0x77),
            event: Event::Disconnected { address: ADDR },
        };
        EventDispatcher::new(Arc::new(transport)).deliver(vec![delivery]);
    }

    #[test]
    fn test_remote_delivery_skips_null_endpoint() {
        let mut transport = MockMessageTransport::new();
        transport.expect_send().times(0);
        let delivery = Delivery {
            callback_id: CallbackId::new(1),
            endpoint: Endpoint::Remote(0),
            event: Event::Disconnected { address: ADDR },
        };
        EventDispatcher::new(Arc::new(transport)).deliver(vec![delivery]);
    }
}
