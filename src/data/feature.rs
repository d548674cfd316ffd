//! Blood Pressure Feature characteristic.

/// Supported-feature bitmask read from the Blood Pressure Feature characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BloodPressureFeature(u16);

impl BloodPressureFeature {
    /// Body movement detection.
    pub const BODY_MOVEMENT_DETECTION: u16 = 0x0001;
    /// Cuff fit detection.
    pub const CUFF_FIT_DETECTION: u16 = 0x0002;
    /// Irregular pulse detection.
    pub const IRREGULAR_PULSE_DETECTION: u16 = 0x0004;
    /// Pulse rate range detection.
    pub const PULSE_RATE_RANGE_DETECTION: u16 = 0x0008;
    /// Measurement position detection.
    pub const MEASUREMENT_POSITION_DETECTION: u16 = 0x0010;
    /// Multiple bonds supported.
    pub const MULTIPLE_BONDS: u16 = 0x0020;

    /// Create from the raw bitmask.
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Parse the characteristic value (little-endian u16, extra bytes ignored).
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        match data {
            [lo, hi, ..] => Some(Self(u16::from_le_bytes([*lo, *hi]))),
            _ => None,
        }
    }

    /// The raw bitmask.
    pub fn to_raw(&self) -> u16 {
        self.0
    }

    /// Check a feature bit.
    pub fn supports(&self, feature: u16) -> bool {
        self.0 & feature == feature
    }

    /// Body movement detection is supported.
    pub fn body_movement_detection(&self) -> bool {
        self.supports(Self::BODY_MOVEMENT_DETECTION)
    }

    /// Cuff fit detection is supported.
    pub fn cuff_fit_detection(&self) -> bool {
        self.supports(Self::CUFF_FIT_DETECTION)
    }

    /// Irregular pulse detection is supported.
    pub fn irregular_pulse_detection(&self) -> bool {
        self.supports(Self::IRREGULAR_PULSE_DETECTION)
    }

    /// Pulse rate range detection is supported.
    pub fn pulse_rate_range_detection(&self) -> bool {
        self.supports(Self::PULSE_RATE_RANGE_DETECTION)
    }

    /// Measurement position detection is supported.
    pub fn measurement_position_detection(&self) -> bool {
        self.supports(Self::MEASUREMENT_POSITION_DETECTION)
    }

    /// The sensor can hold more than one bond.
    pub fn multiple_bonds(&self) -> bool {
        self.supports(Self::MULTIPLE_BONDS)
    }
}
