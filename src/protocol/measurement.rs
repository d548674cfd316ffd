//! Blood Pressure Measurement value decoding.
//!
//! Layout (little-endian):
//! - Byte 0: Flags
//! - Bytes 1-6: Compound value (systolic, diastolic, MAP as SFLOAT)
//! - Time stamp (7 bytes), if flagged
//! - Pulse rate (SFLOAT), if flagged
//! - User id (1 byte), if flagged
//! - Measurement status (2 bytes), if flagged

use bytes::Buf;

use crate::data::measurement::{
    MeasurementFlags, MeasurementStatus, PressureMeasurement, SFloat, TimeStamp,
};
use crate::error::{Error, Result};

/// Smallest valid measurement value: flags plus the compound value.
pub const MIN_MEASUREMENT_SIZE: usize = 7;

/// Decode a Blood Pressure Measurement or Intermediate Cuff Pressure value.
pub fn decode_measurement(data: &[u8]) -> Result<PressureMeasurement> {
    if data.len() < MIN_MEASUREMENT_SIZE {
        return Err(Error::ResponseInvalid);
    }

    let expected = expected_length(data[0]);
    if data.len() < expected {
        tracing::debug!(
            "Measurement truncated: {} bytes, flags {:#04x} need {}",
            data.len(),
            data[0],
            expected
        );
        return Err(Error::ResponseInvalid);
    }

    let mut buf = data;
    let flags = MeasurementFlags::from_byte(buf.get_u8());
    let systolic = SFloat::from_raw(buf.get_u16_le());
    let diastolic = SFloat::from_raw(buf.get_u16_le());
    let mean_arterial_pressure = SFloat::from_raw(buf.get_u16_le());

    let time_stamp = flags.has_time_stamp().then(|| TimeStamp {
        year: buf.get_u16_le(),
        month: buf.get_u8(),
        day: buf.get_u8(),
        hours: buf.get_u8(),
        minutes: buf.get_u8(),
        seconds: buf.get_u8(),
    });
    let pulse_rate = flags
        .has_pulse_rate()
        .then(|| SFloat::from_raw(buf.get_u16_le()));
    let user_id = flags.has_user_id().then(|| buf.get_u8());
    let status = flags
        .has_measurement_status()
        .then(|| MeasurementStatus::from_raw(buf.get_u16_le()));

    Ok(PressureMeasurement {
        flags,
        systolic,
        diastolic,
        mean_arterial_pressure,
        time_stamp,
        pulse_rate,
        user_id,
        status,
    })
}

/// Length a value with these flags must have.
fn expected_length(flags: u8) -> usize {
    let flags = MeasurementFlags::from_byte(flags);
    let mut len = MIN_MEASUREMENT_SIZE;
    if flags.has_time_stamp() {
        len += TimeStamp::SIZE;
    }
    if flags.has_pulse_rate() {
        len += 2;
    }
    if flags.has_user_id() {
        len += 1;
    }
    if flags.has_measurement_status() {
        len += 2;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::measurement::PulseRateRange;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_decode_minimal() {
        // mmHg, 120/80, MAP 93
        let data = [0x00, 0x78, 0x00, 0x50, 0x00, 0x5D, 0x00];
        let m = decode_measurement(&data).unwrap();
        assert_eq!(m.systolic.value(), Some(120.0));
        assert_eq!(m.diastolic.value(), Some(80.0));
        assert_eq!(m.mean_arterial_pressure.value(), Some(93.0));
        assert_eq!(m.time_stamp, None);
        assert_eq!(m.pulse_rate, None);
        assert_eq!(m.user_id, None);
        assert_eq!(m.status, None);
    }

    #[test]
    fn test_decode_all_fields() {
        let data = [
            0x1E, // time stamp, pulse, user id, status
            0x78, 0x00, 0x50, 0x00, 0x5D, 0x00, // compound
            0xE8, 0x07, 0x03, 0x0F, 0x08, 0x1E, 0x05, // 2024-03-15 08:30:05
            0x48, 0x00, // pulse 72
            0x02, // user 2
            0x05, 0x00, // body movement + irregular pulse
        ];
        let m = decode_measurement(&data).unwrap();
        assert_eq!(
            m.time_stamp,
            Some(TimeStamp {
                year: 2024,
                month: 3,
                day: 15,
                hours: 8,
                minutes: 30,
                seconds: 5,
            })
        );
        assert_eq!(m.pulse_rate.and_then(|p| p.value()), Some(72.0));
        assert_eq!(m.user_id, Some(2));
        let status = m.status.unwrap();
        assert!(status.body_movement());
        assert!(status.irregular_pulse());
        assert_eq!(status.pulse_rate_range(), PulseRateRange::WithinRange);
    }

    #[test]
    fn test_decode_undersized() {
        assert_eq!(decode_measurement(&[0x00, 0x78]), Err(Error::ResponseInvalid));
    }

    #[test]
    fn test_decode_truncated_optional_field() {
        // pulse rate flagged but missing
        let data = [0x04, 0x78, 0x00, 0x50, 0x00, 0x5D, 0x00, 0x48];
        assert_eq!(decode_measurement(&data), Err(Error::ResponseInvalid));
    }

    #[test]
    fn test_decode_intermediate_cuff_pressure() {
        let data = [0x00, 0x8C, 0x00, 0xFF, 0x07, 0xFF, 0x07];
        let m = decode_measurement(&data).unwrap();
        assert_eq!(m.cuff_pressure().value(), Some(140.0));
        assert_eq!(m.diastolic.value(), None);
    }

    proptest! {
        #[test]
        fn test_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let result = decode_measurement(&data);
            if data.len() < MIN_MEASUREMENT_SIZE {
                prop_assert_eq!(result, Err(Error::ResponseInvalid));
            }
        }
    }
}
