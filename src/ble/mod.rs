//! BLE plumbing module.
//!
//! This module holds the Bluetooth-facing pieces the collector sits on:
//! device addresses, Blood Pressure service UUIDs, the GATT client seam
//! and the device manager's connection feed.

pub mod address;
pub mod connection;
pub mod gatt;
pub mod uuids;

pub use address::BdAddr;
pub use connection::{DeviceEvent, LinkSecurity};
pub use gatt::{
    AttributeHandle, CharacteristicInfo, CharacteristicProperties, DescriptorInfo, GattClient,
    GattError, GattEvent, GattTransactionId, ServiceInfo,
};
pub use uuids::*;
