//! Blood Pressure service discovery.
//!
//! Turns the service list reported by the GATT layer into the handles a
//! [`DeviceEntry`](crate::registry::devices::DeviceEntry) needs.

use tracing::debug;

use crate::ble::address::BdAddr;
use crate::ble::gatt::{AttributeHandle, CharacteristicInfo, ServiceInfo};
use crate::ble::uuids::*;
use crate::registry::devices::DeviceHandles;

/// Locate and validate the Blood Pressure service.
///
/// # Arguments
///
/// * `address` - Device the services belong to, for logging
/// * `services` - Services discovered on the device
///
/// # Returns
///
/// The cached handles, or `None` if the device has no usable Blood Pressure
/// service. The service is unusable when:
///
/// - no Blood Pressure Measurement can indicate
/// - the first indicating Blood Pressure Measurement has no CCCD
/// - Blood Pressure Feature is missing or cannot be read
///
/// An Intermediate Cuff Pressure characteristic that cannot notify or has
/// no CCCD is dropped and discovery continues without it.
pub fn bind(address: &BdAddr, services: &[ServiceInfo]) -> Option<DeviceHandles> {
    let Some(service) = services
        .iter()
        .find(|service| is_blood_pressure_service(&service.uuid))
    else {
        debug!("{} has no Blood Pressure service", address);
        return None;
    };

    let mut measurement = None;
    let mut cuff_pressure = None;
    let mut feature = None;

    for characteristic in &service.characteristics {
        let uuid = characteristic.uuid;
        if uuid == BLOOD_PRESSURE_MEASUREMENT_UUID && measurement.is_none() {
            if !characteristic.properties.can_indicate() {
                debug!(
                    "{}: skipping Blood Pressure Measurement {:#06x} without indicate",
                    address, characteristic.handle
                );
                continue;
            }
            let Some(cccd) = cccd_handle(characteristic) else {
                debug!("{}: Blood Pressure Measurement has no CCCD", address);
                return None;
            };
            measurement = Some((characteristic.handle, cccd));
        } else if uuid == INTERMEDIATE_CUFF_PRESSURE_UUID && cuff_pressure.is_none() {
            match cccd_handle(characteristic) {
                Some(cccd) if characteristic.properties.can_notify() => {
                    cuff_pressure = Some((characteristic.handle, cccd));
                }
                _ => debug!("{}: ignoring unusable Intermediate Cuff Pressure", address),
            }
        } else if uuid == BLOOD_PRESSURE_FEATURE_UUID
            && feature.is_none()
            && characteristic.properties.can_read()
        {
            feature = Some(characteristic.handle);
        }
    }

    let (Some((measurement, measurement_cccd)), Some(feature)) = (measurement, feature) else {
        debug!("{}: Blood Pressure service is missing mandatory characteristics", address);
        return None;
    };

    Some(DeviceHandles {
        measurement,
        measurement_cccd,
        cuff_pressure,
        feature,
    })
}

fn cccd_handle(characteristic: &CharacteristicInfo) -> Option<AttributeHandle> {
    characteristic
        .descriptors
        .iter()
        .find(|descriptor| is_cccd(&descriptor.uuid))
        .map(|descriptor| descriptor.handle)
}
