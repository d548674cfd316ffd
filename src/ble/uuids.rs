//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants used by the Blood Pressure collector.

use uuid::Uuid;

/// Bluetooth Base UUID, into which 16-bit assigned numbers are spliced.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

// Blood Pressure Service (Standard BLE)
/// Blood Pressure Service UUID (0x1810).
pub const BLOOD_PRESSURE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1810_0000_1000_8000_00805f9b34fb);
/// Blood Pressure Measurement characteristic UUID (Indicate).
pub const BLOOD_PRESSURE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a35_0000_1000_8000_00805f9b34fb);
/// Intermediate Cuff Pressure characteristic UUID (Notify).
pub const INTERMEDIATE_CUFF_PRESSURE_UUID: Uuid =
    Uuid::from_u128(0x0000_2a36_0000_1000_8000_00805f9b34fb);
/// Blood Pressure Feature characteristic UUID (Read).
pub const BLOOD_PRESSURE_FEATURE_UUID: Uuid =
    Uuid::from_u128(0x0000_2a49_0000_1000_8000_00805f9b34fb);

// Descriptors
/// Client Characteristic Configuration descriptor UUID (0x2902).
pub const CLIENT_CHARACTERISTIC_CONFIGURATION_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Expand a 16-bit assigned number into a full UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Check if a service UUID is the Blood Pressure service.
pub fn is_blood_pressure_service(uuid: &Uuid) -> bool {
    *uuid == BLOOD_PRESSURE_SERVICE_UUID
}

/// Check if a descriptor UUID is a Client Characteristic Configuration descriptor.
pub fn is_cccd(uuid: &Uuid) -> bool {
    *uuid == CLIENT_CHARACTERISTIC_CONFIGURATION_UUID
}
