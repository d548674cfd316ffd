//! Bluetooth device addresses.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A 48-bit Bluetooth device address.
///
/// Bytes are held most significant first, so `AA:BB:CC:DD:EE:FF` is
/// `[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    /// Size of an address in bytes.
    pub const SIZE: usize = 6;

    /// The all-zero address.
    pub const NULL: Self = Self([0; 6]);

    /// Create an address from bytes, most significant first.
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Create an address from over-the-air (little-endian) byte order.
    pub fn from_le_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    /// Bytes, most significant first.
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Bytes in over-the-air (little-endian) order.
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// Check for the all-zero address.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Uppercase hex without separators, as used in persisted key names.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BdAddr({self})")
    }
}

impl FromStr for BdAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidParameter {
            name: "address".to_string(),
            value: s.to_string(),
        };

        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(bytes))
    }
}

impl From<[u8; 6]> for BdAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let addr: BdAddr = "00:1A:7D:DA:71:13".parse().unwrap();
        assert_eq!(addr.as_bytes(), &[0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
        assert_eq!(addr.to_string(), "00:1A:7D:DA:71:13");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("00:1A:7D:DA:71".parse::<BdAddr>().is_err());
        assert!("00:1A:7D:DA:71:13:FF".parse::<BdAddr>().is_err());
        assert!("00:1A:7D:DA:71:1".parse::<BdAddr>().is_err());
        assert!("zz:1A:7D:DA:71:13".parse::<BdAddr>().is_err());
    }

    #[test]
    fn test_hex_key_is_most_significant_first() {
        let addr = BdAddr::new([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(addr.to_hex(), "AABBCC010203");
    }

    #[test]
    fn test_le_bytes() {
        let addr = BdAddr::from_le_bytes([1, 2, 3, 4, 5, 6]);
        assert_eq!(addr.as_bytes(), &[6, 5, 4, 3, 2, 1]);
        assert_eq!(addr.to_le_bytes(), [1, 2, 3, 4, 5, 6]);
        assert!(BdAddr::NULL.is_null());
        assert!(!addr.is_null());
    }
}
