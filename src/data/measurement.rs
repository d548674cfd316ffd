//! Blood pressure measurement records.
//!
//! A Blood Pressure Measurement indication and an Intermediate Cuff Pressure
//! notification share one layout. For cuff pressure only the first compound
//! field carries a value; the other two are NaN.

use chrono::{NaiveDate, NaiveDateTime};

use crate::utils::kpa_to_mmhg;

/// Measurement flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeasurementFlags(u8);

impl MeasurementFlags {
    /// Pressure values are in kPa instead of mmHg.
    pub const UNITS_KPA: u8 = 0x01;
    /// Time stamp field present.
    pub const TIME_STAMP_PRESENT: u8 = 0x02;
    /// Pulse rate field present.
    pub const PULSE_RATE_PRESENT: u8 = 0x04;
    /// User id field present.
    pub const USER_ID_PRESENT: u8 = 0x08;
    /// Measurement status field present.
    pub const MEASUREMENT_STATUS_PRESENT: u8 = 0x10;

    /// Create from the raw flags byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Convert to the raw flags byte.
    pub fn to_byte(&self) -> u8 {
        self.0
    }

    /// Unit the pressure values are expressed in.
    pub fn unit(&self) -> PressureUnit {
        if self.0 & Self::UNITS_KPA != 0 {
            PressureUnit::KiloPascal
        } else {
            PressureUnit::MillimetresOfMercury
        }
    }

    /// Check if a time stamp follows the compound value.
    pub fn has_time_stamp(&self) -> bool {
        self.0 & Self::TIME_STAMP_PRESENT != 0
    }

    /// Check if a pulse rate is present.
    pub fn has_pulse_rate(&self) -> bool {
        self.0 & Self::PULSE_RATE_PRESENT != 0
    }

    /// Check if a user id is present.
    pub fn has_user_id(&self) -> bool {
        self.0 & Self::USER_ID_PRESENT != 0
    }

    /// Check if a measurement status is present.
    pub fn has_measurement_status(&self) -> bool {
        self.0 & Self::MEASUREMENT_STATUS_PRESENT != 0
    }
}

/// Pressure unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PressureUnit {
    /// mmHg.
    #[default]
    MillimetresOfMercury,
    /// kPa.
    KiloPascal,
}

/// IEEE 11073-20601 16-bit SFLOAT.
///
/// 4-bit signed exponent in the high nibble, 12-bit signed mantissa below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SFloat(u16);

impl SFloat {
    /// Not a Number.
    pub const NAN: Self = Self(0x07FF);
    /// Not at this resolution.
    pub const NRES: Self = Self(0x0800);
    /// Positive infinity.
    pub const POSITIVE_INFINITY: Self = Self(0x07FE);
    /// Negative infinity.
    pub const NEGATIVE_INFINITY: Self = Self(0x0802);

    /// Create from the raw 16-bit word.
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Create from a mantissa and exponent.
    pub fn new(mantissa: i16, exponent: i8) -> Self {
        let mantissa = (mantissa as u16) & 0x0FFF;
        let exponent = ((exponent as u16) & 0x000F) << 12;
        Self(exponent | mantissa)
    }

    /// The raw 16-bit word.
    pub fn to_raw(&self) -> u16 {
        self.0
    }

    /// Decoded value, or `None` for NaN, NRes and the reserved value.
    pub fn value(&self) -> Option<f64> {
        match self.0 {
            0x07FF | 0x0800 | 0x0801 => None,
            0x07FE => Some(f64::INFINITY),
            0x0802 => Some(f64::NEG_INFINITY),
            raw => {
                // Sign-extend both fields.
                let mantissa = (((raw & 0x0FFF) << 4) as i16) >> 4;
                let exponent = ((raw as i16) >> 12) as i32;
                Some(mantissa as f64 * 10f64.powi(exponent))
            }
        }
    }
}

/// Time stamp carried with a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeStamp {
    /// Year (1582-9999, 0 = unknown).
    pub year: u16,
    /// Month (1-12, 0 = unknown).
    pub month: u8,
    /// Day of month (1-31, 0 = unknown).
    pub day: u8,
    /// Hours (0-23).
    pub hours: u8,
    /// Minutes (0-59).
    pub minutes: u8,
    /// Seconds (0-59).
    pub seconds: u8,
}

impl TimeStamp {
    /// Size of the time stamp on the wire.
    pub const SIZE: usize = 7;

    /// Convert to a calendar date-time, if every field is known and valid.
    pub fn to_naive_date_time(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?.and_hms_opt(
            self.hours as u32,
            self.minutes as u32,
            self.seconds as u32,
        )
    }
}

/// Range of the pulse rate reported in the measurement status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PulseRateRange {
    /// Within range.
    #[default]
    WithinRange,
    /// Exceeds the upper limit.
    ExceedsUpperLimit,
    /// Below the lower limit.
    BelowLowerLimit,
    /// Reserved encoding.
    Reserved,
}

/// Measurement status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeasurementStatus(u16);

impl MeasurementStatus {
    /// Body movement detected during measurement.
    pub const BODY_MOVEMENT: u16 = 0x0001;
    /// Cuff too loose.
    pub const CUFF_TOO_LOOSE: u16 = 0x0002;
    /// Irregular pulse detected.
    pub const IRREGULAR_PULSE: u16 = 0x0004;
    /// Pulse rate range field (two bits).
    pub const PULSE_RATE_RANGE_MASK: u16 = 0x0018;
    /// Improper measurement position.
    pub const IMPROPER_POSITION: u16 = 0x0020;

    /// Create from the raw status word.
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// The raw status word.
    pub fn to_raw(&self) -> u16 {
        self.0
    }

    /// Body movement was detected.
    pub fn body_movement(&self) -> bool {
        self.0 & Self::BODY_MOVEMENT != 0
    }

    /// The cuff fit was too loose.
    pub fn cuff_too_loose(&self) -> bool {
        self.0 & Self::CUFF_TOO_LOOSE != 0
    }

    /// An irregular pulse was detected.
    pub fn irregular_pulse(&self) -> bool {
        self.0 & Self::IRREGULAR_PULSE != 0
    }

    /// Reported pulse rate range.
    pub fn pulse_rate_range(&self) -> PulseRateRange {
        match (self.0 & Self::PULSE_RATE_RANGE_MASK) >> 3 {
            0 => PulseRateRange::WithinRange,
            1 => PulseRateRange::ExceedsUpperLimit,
            2 => PulseRateRange::BelowLowerLimit,
            _ => PulseRateRange::Reserved,
        }
    }

    /// The measurement position was improper.
    pub fn improper_position(&self) -> bool {
        self.0 & Self::IMPROPER_POSITION != 0
    }
}

/// A decoded Blood Pressure Measurement or Intermediate Cuff Pressure value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PressureMeasurement {
    /// Flags byte as received.
    pub flags: MeasurementFlags,
    /// Systolic pressure, or current cuff pressure for an intermediate value.
    pub systolic: SFloat,
    /// Diastolic pressure.
    pub diastolic: SFloat,
    /// Mean arterial pressure.
    pub mean_arterial_pressure: SFloat,
    /// Time stamp.
    pub time_stamp: Option<TimeStamp>,
    /// Pulse rate in beats per minute.
    pub pulse_rate: Option<SFloat>,
    /// User id (0xFF = unknown user).
    pub user_id: Option<u8>,
    /// Measurement status.
    pub status: Option<MeasurementStatus>,
}

impl PressureMeasurement {
    /// Unit of the pressure fields.
    pub fn unit(&self) -> PressureUnit {
        self.flags.unit()
    }

    /// Current cuff pressure of an intermediate value.
    pub fn cuff_pressure(&self) -> SFloat {
        self.systolic
    }

    /// Systolic pressure converted to mmHg.
    pub fn systolic_mmhg(&self) -> Option<f64> {
        self.to_mmhg(self.systolic)
    }

    /// Diastolic pressure converted to mmHg.
    pub fn diastolic_mmhg(&self) -> Option<f64> {
        self.to_mmhg(self.diastolic)
    }

    fn to_mmhg(&self, value: SFloat) -> Option<f64> {
        let value = value.value()?;
        Some(match self.unit() {
            PressureUnit::MillimetresOfMercury => value,
            PressureUnit::KiloPascal => kpa_to_mmhg(value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sfloat_values() {
        assert_eq!(SFloat::from_raw(0x0078).value(), Some(120.0));
        assert_eq!(SFloat::new(120, 0).to_raw(), 0x0078);
        // 0xF4D2 = exponent -1, mantissa 1234
        let v = SFloat::from_raw(0xF4D2).value().unwrap();
        assert!((v - 123.4).abs() < 1e-9);
        assert_eq!(SFloat::new(1234, -1).to_raw(), 0xF4D2);
        // negative mantissa
        assert_eq!(SFloat::new(-5, 0).value(), Some(-5.0));
    }

    #[test]
    fn test_sfloat_special_values() {
        assert_eq!(SFloat::NAN.value(), None);
        assert_eq!(SFloat::NRES.value(), None);
        assert_eq!(SFloat::POSITIVE_INFINITY.value(), Some(f64::INFINITY));
        assert_eq!(SFloat::NEGATIVE_INFINITY.value(), Some(f64::NEG_INFINITY));
    }

    #[test]
    fn test_measurement_status() {
        let status = MeasurementStatus::from_raw(0x0001 | 0x0004 | 0x0010);
        assert!(status.body_movement());
        assert!(!status.cuff_too_loose());
        assert!(status.irregular_pulse());
        assert_eq!(status.pulse_rate_range(), PulseRateRange::BelowLowerLimit);
        assert!(!status.improper_position());

        let status = MeasurementStatus::from_raw(0x0008 | 0x0020);
        assert_eq!(status.pulse_rate_range(), PulseRateRange::ExceedsUpperLimit);
        assert!(status.improper_position());
    }

    #[test]
    fn test_time_stamp_conversion() {
        let stamp = TimeStamp {
            year: 2024,
            month: 3,
            day: 15,
            hours: 8,
            minutes: 30,
            seconds: 5,
        };
        let dt = stamp.to_naive_date_time().unwrap();
        assert_eq!(dt.to_string(), "2024-03-15 08:30:05");

        assert!(TimeStamp::default().to_naive_date_time().is_none());
    }

    #[test]
    fn test_kpa_conversion() {
        let measurement = PressureMeasurement {
            flags: MeasurementFlags::from_byte(MeasurementFlags::UNITS_KPA),
            systolic: SFloat::new(16, 0),
            diastolic: SFloat::NAN,
            ..Default::default()
        };
        assert_eq!(measurement.unit(), PressureUnit::KiloPascal);
        let mmhg = measurement.systolic_mmhg().unwrap();
        assert!((mmhg - 120.01).abs() < 0.01);
        assert_eq!(measurement.diastolic_mmhg(), None);
    }
}
