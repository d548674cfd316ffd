//! Blood Pressure collector manager.
//!
//! [`CollectorManager`] owns the registries and the worker task. Inbound IPC
//! messages, GATT events and device events are queued as [`Task`]s and run
//! one at a time by the worker. The local API runs on the caller's thread
//! under the same lock.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::ble::address::BdAddr;
use crate::ble::connection::{DeviceEvent, LinkSecurity};
use crate::ble::gatt::{GattClient, GattEvent};
use crate::config::ManagerConfig;
use crate::discovery;
use crate::dispatch::{Event, EventDispatcher, Outbox};
use crate::error::{Error, Result};
use crate::processor;
use crate::protocol::messages::Message;
use crate::protocol::transport::MessageTransport;
use crate::registry::callbacks::{AddressId, Endpoint, EventHandler};
use crate::registry::cccd::CccdState;
use crate::registry::subscriptions::SubscriptionKind;
use crate::registry::{CallbackId, Registry, TransactionId};
use crate::storage::{CccdPersistence, ConfigStore, PersistOp};

/// External systems the manager drives.
#[derive(Clone)]
pub struct Collaborators {
    /// GATT client primitives.
    pub gatt: Arc<dyn GattClient>,
    /// Outbound IPC channel.
    pub transport: Arc<dyn MessageTransport>,
    /// Pairing state of remote devices.
    pub link: Arc<dyn LinkSecurity>,
    /// Persistent key/value store.
    pub store: Arc<dyn ConfigStore>,
}

/// Unit of work for the manager's worker.
#[derive(Debug, Clone)]
pub enum Task {
    /// An inbound IPC message.
    Message(Message),
    /// An asynchronous GATT event.
    Gatt(GattEvent),
    /// A connection or pairing change.
    Device(DeviceEvent),
    /// A messaging endpoint went away.
    EndpointClosed(AddressId),
}

/// Handle for an event registration.
///
/// The registration is removed when this handle is dropped or
/// [`unregister`](Self::unregister) is called.
pub struct CallbackHandle {
    id: CallbackId,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: CallbackId, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> CallbackId {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// State shared between the manager, its worker and callback handles.
struct Inner {
    config: ManagerConfig,
    registry: Mutex<Registry>,
    gatt: Arc<dyn GattClient>,
    link: Arc<dyn LinkSecurity>,
    transport: Arc<dyn MessageTransport>,
    dispatcher: EventDispatcher,
    persistence: CccdPersistence,
    persist_tx: RwLock<Option<mpsc::UnboundedSender<PersistOp>>>,
    is_running: AtomicBool,
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .try_lock_for(self.config.lock_timeout)
            .ok_or(Error::UnableToLockContext)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Run `f` under the lock. The returned outbox must be flushed by the
    /// caller once the lock is gone.
    fn with_registry<R>(
        &self,
        f: impl FnOnce(&mut Registry, &mut Outbox) -> Result<R>,
    ) -> Result<(R, Outbox)> {
        self.ensure_running()?;
        let mut outbox = Outbox::default();
        let mut registry = self.lock()?;
        let value = f(&mut registry, &mut outbox)?;
        drop(registry);
        Ok((value, outbox))
    }

    /// Deliver events now and hand persistence to the worker.
    fn flush(&self, outbox: Outbox) {
        self.dispatcher.deliver(outbox.deliveries);
        if outbox.persistence.is_empty() {
            return;
        }
        match self.persist_tx.read().as_ref() {
            Some(tx) => {
                for op in outbox.persistence {
                    if let Err(e) = tx.send(op) {
                        warn!("Dropping persistence step {:?}: worker has stopped", e.0);
                    }
                }
            }
            None => warn!(
                "Dropping {} persistence step(s): worker is not running",
                outbox.persistence.len()
            ),
        }
    }

    /// Deliver events and run persistence in order.
    async fn flush_now(&self, outbox: Outbox) {
        self.dispatcher.deliver(outbox.deliveries);
        for op in outbox.persistence {
            self.persist(op).await;
        }
    }

    async fn persist(&self, op: PersistOp) {
        if let Err(e) = self.persistence.apply(op).await {
            warn!("Failed to persist {:?}: {}", op, e);
        }
    }

    fn run_local<R>(&self, f: impl FnOnce(&mut Registry, &dyn GattClient) -> Result<R>) -> Result<R> {
        let gatt = self.gatt.as_ref();
        let (value, outbox) = self.with_registry(|registry, _| f(registry, gatt))?;
        self.flush(outbox);
        Ok(value)
    }

    fn unregister(&self, id: CallbackId) -> Result<()> {
        self.run_local(|registry, gatt| registry.unregister(id, gatt))
    }

    async fn process(&self, task: Task) -> Result<()> {
        self.ensure_running()?;
        match task {
            Task::Message(message) => self.handle_message(message),
            Task::Gatt(event) => self.handle_gatt_event(event).await,
            Task::Device(event) => self.handle_device_event(event).await,
            Task::EndpointClosed(address_id) => {
                let gatt = self.gatt.as_ref();
                let (_, outbox) = self.with_registry(|registry, _| {
                    Ok(registry.purge_endpoint(address_id, gatt))
                })?;
                self.flush_now(outbox).await;
                Ok(())
            }
        }
    }

    fn handle_message(&self, message: Message) -> Result<()> {
        let Some(request) = processor::screen(&message) else {
            return Ok(());
        };

        let address_id = message.header.address_id;
        let gatt = self.gatt.as_ref();
        let (result, outbox) = match request {
            Ok(request) => match self.with_registry(|registry, _| {
                Ok(processor::execute(registry, address_id, request, gatt))
            }) {
                Ok((result, outbox)) => (result, outbox),
                Err(e) => (Err(e), Outbox::default()),
            },
            Err(e) => (Err(e), Outbox::default()),
        };

        let status = processor::response_status(&result);
        debug!(
            "Responding to {:#010x}/{:#010x} with {}",
            address_id, message.header.message_id, status
        );
        if let Err(e) = self.transport.send(message.response(status)) {
            warn!("Failed to send response to {:#010x}: {}", address_id, e);
        }

        self.flush(outbox);
        Ok(())
    }

    async fn handle_gatt_event(&self, event: GattEvent) -> Result<()> {
        let gatt = self.gatt.as_ref();
        let link = self.link.as_ref();
        let (_, outbox) = self.with_registry(|registry, outbox| {
            registry.handle_gatt_event(event, gatt, link, outbox);
            Ok(())
        })?;
        self.flush_now(outbox).await;
        Ok(())
    }

    async fn handle_device_event(&self, event: DeviceEvent) -> Result<()> {
        let link = self.link.as_ref();
        match event {
            DeviceEvent::PoweredOn => {
                if let Err(e) = self.gatt.register_connection_events() {
                    warn!("Failed to register GATT connection events: {}", e);
                }
            }
            DeviceEvent::PoweredOff => {
                let (_, outbox) = self.with_registry(|registry, outbox| {
                    registry.disconnect_all(outbox);
                    Ok(())
                })?;
                self.gatt.unregister_connection_events();
                self.flush_now(outbox).await;
            }
            DeviceEvent::Connected { address } => self.bind(address).await?,
            DeviceEvent::Disconnected { address } => {
                let (_, outbox) = self.with_registry(|registry, outbox| {
                    Ok(registry.disconnect_device(&address, outbox))
                })?;
                self.flush_now(outbox).await;
            }
            DeviceEvent::ServicesUnknown { address } | DeviceEvent::Deleted { address } => {
                let (_, mut outbox) = self.with_registry(|registry, outbox| {
                    Ok(registry.disconnect_device(&address, outbox))
                })?;
                outbox.persist(PersistOp::Clear { address });
                self.flush_now(outbox).await;
            }
            DeviceEvent::Paired { address } => {
                let persisted = match self.persistence.load(&address).await {
                    Ok(persisted) => persisted,
                    Err(e) => {
                        warn!("Failed to load CCCD state for {}: {}", address, e);
                        None
                    }
                };
                let (_, outbox) = self.with_registry(|registry, outbox| {
                    registry.apply_persisted(&address, persisted, link, outbox);
                    Ok(())
                })?;
                self.flush_now(outbox).await;
            }
            DeviceEvent::Unpaired { address } => {
                self.persist(PersistOp::Clear { address }).await;
            }
            DeviceEvent::AddressChanged { previous, current } => {
                let (_, outbox) = self.with_registry(|registry, outbox| {
                    Ok(registry.rekey_device(&previous, current, link, outbox))
                })?;
                self.flush_now(outbox).await;
            }
        }
        Ok(())
    }

    async fn bind(&self, address: BdAddr) -> Result<()> {
        let bound = {
            let registry = self.lock()?;
            registry.devices.find(&address).is_some()
        };
        if bound {
            debug!("{} is already bound", address);
            return Ok(());
        }

        let services = match self.gatt.query_services(&address) {
            Ok(services) => services,
            Err(e) => {
                debug!("Service query for {} failed: {}", address, e);
                return Ok(());
            }
        };
        let Some(handles) = discovery::bind(&address, &services) else {
            return Ok(());
        };

        let (_, outbox) =
            self.with_registry(|registry, outbox| registry.bind_device(address, handles, outbox))?;
        self.flush_now(outbox).await;
        Ok(())
    }
}

/// Server-side Blood Pressure collector session manager.
pub struct CollectorManager {
    inner: Arc<Inner>,
    task_tx: RwLock<Option<mpsc::Sender<Task>>>,
    shutdown_tx: RwLock<Option<watch::Sender<bool>>>,
    worker_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl CollectorManager {
    /// Create a stopped manager.
    pub fn new(config: ManagerConfig, collaborators: Collaborators) -> Self {
        let persistence = CccdPersistence::new(collaborators.store, &config);
        let dispatcher = EventDispatcher::new(collaborators.transport.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry::new()),
                gatt: collaborators.gatt,
                link: collaborators.link,
                transport: collaborators.transport,
                dispatcher,
                persistence,
                persist_tx: RwLock::new(None),
                is_running: AtomicBool::new(false),
            }),
            task_tx: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
            worker_handle: RwLock::new(None),
        }
    }

    /// Register for GATT connection events and start the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInitialized`] if the manager is running.
    pub async fn start(&self) -> Result<()> {
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        info!("Starting Blood Pressure collector manager");

        if let Err(e) = self.inner.gatt.register_connection_events() {
            warn!("Failed to register GATT connection events: {}", e);
        }

        let (task_tx, mut task_rx) = mpsc::channel(self.inner.config.queue_depth);
        let (persist_tx, mut persist_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.inner.persist_tx.write() = Some(persist_tx);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(task) = task_rx.recv() => {
                        if let Err(e) = inner.process(task).await {
                            warn!("Task failed: {}", e);
                        }
                    }
                    Some(op) = persist_rx.recv() => {
                        inner.persist(op).await;
                    }
                    _ = shutdown_rx.changed() => break,
                    else => break,
                }
            }

            debug!("Collector worker ended");
        });

        *self.task_tx.write() = Some(task_tx);
        *self.shutdown_tx.write() = Some(shutdown_tx);
        *self.worker_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop the worker and drop all collector state.
    ///
    /// Outstanding GATT transactions are cancelled, remaining registrations
    /// are removed with best-effort CCCD disable writes, and GATT connection
    /// events are unregistered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the manager is not running.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.inner.is_running.swap(false, Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }

        info!("Shutting down Blood Pressure collector manager");

        let shutdown_tx = self.shutdown_tx.write().take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }
        self.task_tx.write().take();
        self.inner.persist_tx.write().take();

        let handle = self.worker_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        {
            let gatt = self.inner.gatt.as_ref();
            let mut registry = self.inner.lock()?;
            registry.cancel_all(gatt);
            registry.purge_all(gatt);
            *registry = Registry::new();
        }
        self.inner.gatt.unregister_connection_events();

        Ok(())
    }

    /// Check if the manager is running.
    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    /// Queue a task for the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the manager is not running.
    pub async fn submit(&self, task: Task) -> Result<()> {
        let tx = self.task_tx.read().clone().ok_or(Error::NotInitialized)?;
        tx.send(task).await.map_err(|_| Error::NotInitialized)
    }

    /// Run a task on the caller's task, bypassing the queue.
    pub async fn process(&self, task: Task) -> Result<()> {
        self.inner.process(task).await
    }

    /// Register an in-process event handler.
    ///
    /// Only one registration may exist at a time. The registration lasts
    /// as long as the returned handle.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if the manager is not running.
    /// - [`Error::AlreadyRegistered`] if a collector is already registered.
    pub fn register_collector_events<F>(&self, handler: F) -> Result<CallbackHandle>
    where
        F: Fn(CallbackId, &Event) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        let id = self
            .inner
            .run_local(|registry, _| registry.register(Endpoint::Local(handler)))?;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(CallbackHandle::new(id, move || {
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = inner.unregister(id) {
                    debug!("Callback {} already gone: {}", id, e);
                }
            }
        }))
    }

    /// Remove a registration.
    pub fn unregister_collector_events(&self, callback_id: CallbackId) -> Result<()> {
        self.inner.unregister(callback_id)
    }

    /// Enable Blood Pressure Measurement indications from a sensor.
    pub fn enable_measurement_indications(
        &self,
        callback_id: CallbackId,
        address: BdAddr,
    ) -> Result<()> {
        self.enable(callback_id, address, SubscriptionKind::Measurement)
    }

    /// Disable Blood Pressure Measurement indications from a sensor.
    pub fn disable_measurement_indications(
        &self,
        callback_id: CallbackId,
        address: BdAddr,
    ) -> Result<()> {
        self.disable(callback_id, address, SubscriptionKind::Measurement)
    }

    /// Enable Intermediate Cuff Pressure notifications from a sensor.
    pub fn enable_cuff_pressure_notifications(
        &self,
        callback_id: CallbackId,
        address: BdAddr,
    ) -> Result<()> {
        self.enable(callback_id, address, SubscriptionKind::IntermediateCuffPressure)
    }

    /// Disable Intermediate Cuff Pressure notifications from a sensor.
    pub fn disable_cuff_pressure_notifications(
        &self,
        callback_id: CallbackId,
        address: BdAddr,
    ) -> Result<()> {
        self.disable(callback_id, address, SubscriptionKind::IntermediateCuffPressure)
    }

    /// Enable pushes of `kind` from a sensor.
    pub fn enable(
        &self,
        callback_id: CallbackId,
        address: BdAddr,
        kind: SubscriptionKind,
    ) -> Result<()> {
        self.inner
            .run_local(|registry, gatt| registry.enable(callback_id, address, kind, gatt))
    }

    /// Drop one reference to pushes of `kind` from a sensor.
    pub fn disable(
        &self,
        callback_id: CallbackId,
        address: BdAddr,
        kind: SubscriptionKind,
    ) -> Result<()> {
        self.inner
            .run_local(|registry, gatt| registry.disable(callback_id, address, kind, gatt))
    }

    /// Read a sensor's Blood Pressure Feature. The value is delivered as
    /// [`Event::FeatureResponse`].
    pub fn get_blood_pressure_feature(
        &self,
        callback_id: CallbackId,
        address: BdAddr,
    ) -> Result<TransactionId> {
        self.inner
            .run_local(|registry, gatt| registry.get_feature(callback_id, address, gatt))
    }

    /// Cancel an outstanding transaction.
    pub fn cancel_transaction(
        &self,
        callback_id: CallbackId,
        transaction_id: TransactionId,
    ) -> Result<()> {
        self.inner
            .run_local(|registry, gatt| registry.cancel(callback_id, transaction_id, gatt))
    }

    /// Addresses of the bound sensors.
    pub fn devices(&self) -> Result<Vec<BdAddr>> {
        self.inner
            .run_local(|registry, _| Ok(registry.devices.addresses()))
    }

    /// Subscriber references for a sensor's characteristic.
    pub fn reference_count(&self, address: &BdAddr, kind: SubscriptionKind) -> Result<Option<u32>> {
        self.inner
            .run_local(|registry, _| Ok(registry.reference_count(address, kind)))
    }

    /// CCCD state of a sensor's characteristic.
    pub fn cccd_state(&self, address: &BdAddr, kind: SubscriptionKind) -> Result<Option<CccdState>> {
        self.inner
            .run_local(|registry, _| Ok(registry.cccd_state(address, kind)))
    }

    /// Outstanding transactions for a sensor.
    pub fn transactions(&self, address: &BdAddr) -> Result<Vec<TransactionId>> {
        self.inner
            .run_local(|registry, _| Ok(registry.transactions.ids_for_device(address)))
    }
}

impl Drop for CollectorManager {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.write().take() {
            let _ = tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::connection::MockLinkSecurity;
    use crate::ble::gatt::{
        CharacteristicInfo, CharacteristicProperties, DescriptorInfo, MockGattClient, ServiceInfo,
    };
    use crate::ble::uuids::*;
    use crate::protocol::messages::{MessageFunction, Request};
    use crate::protocol::transport::MockMessageTransport;
    use crate::storage::MemoryConfigStore;
    use std::io;
    use std::time::Duration;

    const DEV: BdAddr = BdAddr::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);

    fn services() -> Vec<ServiceInfo> {
        vec![ServiceInfo {
            uuid: BLOOD_PRESSURE_SERVICE_UUID,
            start_handle: 0x000F,
            end_handle: 0x0020,
            characteristics: vec![
                CharacteristicInfo {
                    uuid: BLOOD_PRESSURE_MEASUREMENT_UUID,
                    handle: 0x0010,
                    properties: CharacteristicProperties::from_byte(
                        CharacteristicProperties::INDICATE,
                    ),
                    descriptors: vec![DescriptorInfo {
                        uuid: CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
                        handle: 0x0011,
                    }],
                },
                CharacteristicInfo {
                    uuid: BLOOD_PRESSURE_FEATURE_UUID,
                    handle: 0x0016,
                    properties: CharacteristicProperties::from_byte(CharacteristicProperties::READ),
                    descriptors: Vec::new(),
                },
            ],
        }]
    }

    fn gatt() -> MockGattClient {
        let mut gatt = MockGattClient::new();
        gatt.expect_register_connection_events().returning(|| Ok(()));
        gatt.expect_unregister_connection_events().return_const(());
        gatt.expect_query_services().returning(|_| Ok(services()));
        gatt.expect_cancel_transaction().returning(|_| Ok(()));
        gatt
    }

    fn manager_with(
        gatt: MockGattClient,
        transport: MockMessageTransport,
        bonded: bool,
    ) -> (CollectorManager, Arc<MemoryConfigStore>) {
        let mut link = MockLinkSecurity::new();
        link.expect_is_bonded().return_const(bonded);
        let store = Arc::new(MemoryConfigStore::new());
        let manager = CollectorManager::new(
            ManagerConfig::default(),
            Collaborators {
                gatt: Arc::new(gatt),
                transport: Arc::new(transport),
                link: Arc::new(link),
                store: store.clone(),
            },
        );
        (manager, store)
    }

    fn recorder() -> (
        Arc<Mutex<Vec<Event>>>,
        impl Fn(CallbackId, &Event) + Send + Sync + 'static,
    ) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |_: CallbackId, event: &Event| {
            sink.lock().push(event.clone())
        })
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (manager, _) = manager_with(gatt(), MockMessageTransport::new(), false);
        assert_eq!(
            manager.register_collector_events(|_, _| {}).err(),
            Some(Error::NotInitialized)
        );
        assert_eq!(manager.shutdown().await, Err(Error::NotInitialized));

        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.start().await, Err(Error::AlreadyInitialized));

        manager.shutdown().await.unwrap();
        assert!(!manager.is_running());
        assert_eq!(
            manager.submit(Task::EndpointClosed(1)).await,
            Err(Error::NotInitialized)
        );
    }

    #[tokio::test]
    async fn test_connect_binds_and_broadcasts() {
        let (manager, _) = manager_with(gatt(), MockMessageTransport::new(), false);
        manager.start().await.unwrap();
        let (events, handler) = recorder();
        let _handle = manager.register_collector_events(handler).unwrap();

        manager
            .process(Task::Device(DeviceEvent::Connected { address: DEV }))
            .await
            .unwrap();
        manager
            .process(Task::Device(DeviceEvent::Connected { address: DEV }))
            .await
            .unwrap();

        assert_eq!(manager.devices().unwrap(), vec![DEV]);
        assert_eq!(events.lock().len(), 1);
        assert!(matches!(events.lock()[0], Event::Connected { address: DEV, .. }));

        manager
            .process(Task::Device(DeviceEvent::Disconnected { address: DEV }))
            .await
            .unwrap();
        assert!(manager.devices().unwrap().is_empty());
        assert!(matches!(events.lock()[1], Event::Disconnected { address: DEV }));
    }

    #[tokio::test]
    async fn test_handle_drop_unregisters() {
        let (manager, _) = manager_with(gatt(), MockMessageTransport::new(), false);
        manager.start().await.unwrap();

        let handle = manager.register_collector_events(|_, _| {}).unwrap();
        assert_eq!(
            manager.register_collector_events(|_, _| {}).err(),
            Some(Error::AlreadyRegistered)
        );
        let first = handle.id();
        drop(handle);

        let second = manager.register_collector_events(|_, _| {}).unwrap();
        assert_ne!(first, second.id());
        second.unregister();
        assert_eq!(
            manager.unregister_collector_events(first),
            Err(Error::CallbackNotRegistered)
        );
    }

    #[tokio::test]
    async fn test_remote_register_gets_response() {
        let mut transport = MockMessageTransport::new();
        transport
            .expect_send()
            .withf(|message| {
                message.header.address_id == 0x42
                    && message.header.is_response()
                    && message.header.message_function() == MessageFunction::RegisterCollectorEvents
                    && message.response_status() == Ok(1)
            })
            .times(1)
            .returning(|_| Ok(()));
        let (manager, _) = manager_with(gatt(), transport, false);
        manager.start().await.unwrap();

        manager
            .process(Task::Message(Request::RegisterCollectorEvents.encode(0x42, 9)))
            .await
            .unwrap();
        // A response to someone else is ignored.
        manager
            .process(Task::Message(
                Request::RegisterCollectorEvents.encode(0x42, 10).response(0),
            ))
            .await
            .unwrap();

        manager.process(Task::EndpointClosed(0x42)).await.unwrap();
        let handle = manager.register_collector_events(|_, _| {}).unwrap();
        assert_eq!(handle.id().value(), 2);
    }

    #[tokio::test]
    async fn test_paired_device_restores_and_persists() {
        let mut gatt = gatt();
        gatt.expect_write_value().returning(|_, _, _| Ok(5));
        let (manager, store) = manager_with(gatt, MockMessageTransport::new(), true);
        manager.start().await.unwrap();
        let handle = manager.register_collector_events(|_, _| {}).unwrap();

        manager
            .process(Task::Device(DeviceEvent::Connected { address: DEV }))
            .await
            .unwrap();
        store.write_integer("BLPM-Collector", "BC-001A7DDA7113", 1).await.unwrap();
        manager
            .process(Task::Device(DeviceEvent::Paired { address: DEV }))
            .await
            .unwrap();
        assert_eq!(
            manager.cccd_state(&DEV, SubscriptionKind::Measurement).unwrap(),
            Some(CccdState::Enabled)
        );

        // Already enabled on the sensor, so no write is needed.
        manager.enable_measurement_indications(handle.id(), DEV).unwrap();
        assert!(manager.transactions(&DEV).unwrap().is_empty());

        manager
            .process(Task::Device(DeviceEvent::Deleted { address: DEV }))
            .await
            .unwrap();
        assert_eq!(store.get("BLPM-Collector", "BC-001A7DDA7113"), Some(0));
        assert!(manager.devices().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_address_change_migrates_store() {
        let (manager, store) = manager_with(gatt(), MockMessageTransport::new(), true);
        manager.start().await.unwrap();
        let current = BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

        manager
            .process(Task::Device(DeviceEvent::Connected { address: DEV }))
            .await
            .unwrap();
        store.write_integer("BLPM-Collector", "BC-001A7DDA7113", 1).await.unwrap();
        manager
            .process(Task::Device(DeviceEvent::Paired { address: DEV }))
            .await
            .unwrap();
        manager
            .process(Task::Device(DeviceEvent::AddressChanged {
                previous: DEV,
                current,
            }))
            .await
            .unwrap();

        assert_eq!(manager.devices().unwrap(), vec![current]);
        assert_eq!(store.get("BLPM-Collector", "BC-112233445566"), Some(1));
        assert_eq!(store.get("BLPM-Collector", "IC-112233445566"), Some(0));
        assert_eq!(store.get("BLPM-Collector", "BC-001A7DDA7113"), Some(0));
        assert_eq!(
            manager.cccd_state(&current, SubscriptionKind::Measurement).unwrap(),
            Some(CccdState::Enabled)
        );
    }

    #[tokio::test]
    async fn test_power_off_disconnects_everything() {
        let mut gatt = gatt();
        gatt.expect_read_value().returning(|_, _| Ok(3));
        let (manager, _) = manager_with(gatt, MockMessageTransport::new(), false);
        manager.start().await.unwrap();
        let (events, handler) = recorder();
        let handle = manager.register_collector_events(handler).unwrap();

        manager
            .process(Task::Device(DeviceEvent::Connected { address: DEV }))
            .await
            .unwrap();
        let txn = manager.get_blood_pressure_feature(handle.id(), DEV).unwrap();
        manager.process(Task::Device(DeviceEvent::PoweredOff)).await.unwrap();

        let events = events.lock();
        assert!(matches!(
            events[1],
            Event::FeatureResponse { transaction_id, result: Err(Error::NotConnected), .. }
                if transaction_id == txn
        ));
        assert!(matches!(events[2], Event::Disconnected { address: DEV }));
    }

    #[tokio::test]
    async fn test_handler_can_call_back_into_manager() {
        let mut gatt = gatt();
        gatt.expect_write_value().returning(|_, _, _| Ok(7));
        let (manager, _) = manager_with(gatt, MockMessageTransport::new(), false);
        let manager = Arc::new(manager);
        manager.start().await.unwrap();

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let weak = Arc::downgrade(&manager);
        let handle = manager
            .register_collector_events(move |id, event: &Event| {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let outcome = match event {
                    Event::Connected { address, .. } => {
                        manager.enable_measurement_indications(id, *address)
                    }
                    Event::Measurement { .. } => manager.unregister_collector_events(id),
                    _ => return,
                };
                sink.lock().push(outcome);
            })
            .unwrap();
        let id = handle.id();

        let connect = manager.process(Task::Device(DeviceEvent::Connected { address: DEV }));
        tokio::time::timeout(Duration::from_secs(10), connect)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            manager.reference_count(&DEV, SubscriptionKind::Measurement).unwrap(),
            Some(1)
        );

        let indication = manager.process(Task::Gatt(GattEvent::Indication {
            address: DEV,
            handle: 0x0010,
            value: vec![0x00, 0x78, 0x00, 0x50, 0x00, 0x5A, 0x00],
        }));
        tokio::time::timeout(Duration::from_secs(10), indication)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*outcomes.lock(), vec![Ok(()), Ok(())]);
        assert_eq!(
            manager.unregister_collector_events(id),
            Err(Error::CallbackNotRegistered)
        );
        assert_eq!(
            manager.reference_count(&DEV, SubscriptionKind::Measurement).unwrap(),
            Some(0)
        );
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_persistence_after_worker_stopped_is_logged() {
        let (manager, _) = manager_with(gatt(), MockMessageTransport::new(), false);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        *manager.inner.persist_tx.write() = Some(tx);

        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let mut outbox = Outbox::default();
            outbox.persist(PersistOp::Clear { address: DEV });
            manager.inner.flush(outbox);
        });

        let logs = logs.contents();
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("worker has stopped"), "{logs}");
    }
}
