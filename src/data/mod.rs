//! Data structures for sensor data.
//!
//! This module contains the value types carried by collector events.

pub mod feature;
pub mod measurement;

pub use feature::BloodPressureFeature;
pub use measurement::{
    MeasurementFlags, MeasurementStatus, PressureMeasurement, PressureUnit, PulseRateRange,
    SFloat, TimeStamp,
};
