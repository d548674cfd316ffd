// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # blood-pressure-collector
//!
//! Server-side session manager for a Bluetooth Low Energy Blood Pressure
//! collector. It sits between a GATT client and any number of collector
//! clients, in-process or over an IPC channel.
//!
//! ## Features
//!
//! - **Service Binding**: Recognise connected sensors exposing the Blood
//!   Pressure service and cache their attribute handles
//! - **Shared Subscriptions**: Reference-counted CCCD writes, so a sensor is
//!   configured once no matter how many clients subscribe
//! - **Measurement Decoding**: Blood Pressure Measurement and Intermediate
//!   Cuff Pressure values, including time stamps and status bits
//! - **Feature Reads**: Asynchronous Blood Pressure Feature reads with
//!   cancellable transactions
//! - **Bond Persistence**: CCCD state remembered across reconnects for
//!   bonded sensors, following address rotation
//! - **Remote Clients**: A message protocol for clients living in another
//!   process, with one response per request
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blood_pressure_collector::{
//!     Collaborators, CollectorManager, Event, ManagerConfig, MemoryConfigStore, Result,
//! };
//! # use blood_pressure_collector::{GattClient, LinkSecurity, MessageTransport};
//! # fn platform() -> (Arc<dyn GattClient>, Arc<dyn MessageTransport>, Arc<dyn LinkSecurity>) {
//! #     unimplemented!()
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (gatt, transport, link) = platform();
//!     let manager = CollectorManager::new(
//!         ManagerConfig::default(),
//!         Collaborators {
//!             gatt,
//!             transport,
//!             link,
//!             store: Arc::new(MemoryConfigStore::new()),
//!         },
//!     );
//!     manager.start().await?;
//!
//!     let handle = manager.register_collector_events(|_, event| {
//!         if let Event::Measurement { address, measurement } = event {
//!             println!(
//!                 "{}: {:?}/{:?} mmHg",
//!                 address,
//!                 measurement.systolic_mmhg(),
//!                 measurement.diastolic_mmhg()
//!             );
//!         }
//!     })?;
//!
//!     for address in manager.devices()? {
//!         manager.enable_measurement_indications(handle.id(), address)?;
//!     }
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!
//!     drop(handle);
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod processor;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod utils;

// Re-exports for convenience
pub use config::ManagerConfig;
pub use dispatch::Event;
pub use error::{Error, Result};
pub use manager::{CallbackHandle, Collaborators, CollectorManager, Task};
pub use registry::{CallbackId, TransactionId};
pub use storage::{ConfigStore, MemoryConfigStore};
pub use utils::{kpa_to_mmhg, mmhg_to_kpa};

// Re-export commonly used types from submodules
pub use ble::{BdAddr, DeviceEvent, GattClient, GattEvent, LinkSecurity};
pub use data::{BloodPressureFeature, PressureMeasurement, PressureUnit};
pub use protocol::{Message, MessageTransport};
pub use registry::callbacks::AddressId;
pub use registry::cccd::CccdState;
pub use registry::subscriptions::SubscriptionKind;
