//! GATT client seam.
//!
//! The collector does not speak ATT itself. It drives a [`GattClient`] that
//! returns a transaction id immediately and later reports the outcome as a
//! [`GattEvent`] queued onto the manager's worker.

use thiserror::Error;
use uuid::Uuid;

use crate::ble::address::BdAddr;

/// Identifier the GATT layer assigns to an outstanding request.
pub type GattTransactionId = u32;

/// An ATT attribute handle.
pub type AttributeHandle = u16;

/// Errors returned synchronously by the GATT layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattError {
    /// The GATT layer does not support the request.
    #[error("GATT operation not supported")]
    NotSupported,
    /// The GATT layer has not been initialized.
    #[error("GATT not initialized")]
    NotInitialized,
    /// A parameter was rejected.
    #[error("GATT invalid parameter")]
    InvalidParameter,
    /// The service table is invalid.
    #[error("GATT invalid service table")]
    InvalidServiceTable,
    /// No connection exists for the device.
    #[error("GATT invalid connection")]
    InvalidConnection,
    /// The attribute handle is invalid.
    #[error("GATT invalid handle")]
    InvalidHandle,
    /// Any other stack error code.
    #[error("GATT error {0}")]
    Other(i32),
}

/// ATT error codes a peer may return in an Error Response.
pub mod att_error {
    /// Invalid Handle.
    pub const INVALID_HANDLE: u8 = 0x01;
    /// Read Not Permitted.
    pub const READ_NOT_PERMITTED: u8 = 0x02;
    /// Write Not Permitted.
    pub const WRITE_NOT_PERMITTED: u8 = 0x03;
    /// Request Not Supported.
    pub const REQUEST_NOT_SUPPORTED: u8 = 0x06;
    /// Attribute Not Found.
    pub const ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
}

/// Characteristic property bits from the characteristic declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// Broadcast.
    pub const BROADCAST: u8 = 0x01;
    /// Read.
    pub const READ: u8 = 0x02;
    /// Write Without Response.
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    /// Write.
    pub const WRITE: u8 = 0x08;
    /// Notify.
    pub const NOTIFY: u8 = 0x10;
    /// Indicate.
    pub const INDICATE: u8 = 0x20;

    /// Create from the raw property byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Convert to the raw property byte.
    pub fn to_byte(&self) -> u8 {
        self.0
    }

    /// Check if the characteristic can be read.
    pub fn can_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    /// Check if the characteristic supports notifications.
    pub fn can_notify(&self) -> bool {
        self.0 & Self::NOTIFY != 0
    }

    /// Check if the characteristic supports indications.
    pub fn can_indicate(&self) -> bool {
        self.0 & Self::INDICATE != 0
    }
}

/// A descriptor found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    /// Descriptor type.
    pub uuid: Uuid,
    /// Descriptor handle.
    pub handle: AttributeHandle,
}

/// A characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic type.
    pub uuid: Uuid,
    /// Value handle.
    pub handle: AttributeHandle,
    /// Declared properties.
    pub properties: CharacteristicProperties,
    /// Descriptors that follow the declaration.
    pub descriptors: Vec<DescriptorInfo>,
}

/// A primary service found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service type.
    pub uuid: Uuid,
    /// First handle of the service.
    pub start_handle: AttributeHandle,
    /// Last handle of the service.
    pub end_handle: AttributeHandle,
    /// Included characteristics.
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Primitive operations the collector needs from the GATT layer.
///
/// Read, write and cancel return immediately. The result of a read or
/// write arrives later as a [`GattEvent`] carrying the same transaction id.
#[cfg_attr(test, mockall::automock)]
pub trait GattClient: Send + Sync {
    /// Register for connection-level GATT events (notifications, indications).
    fn register_connection_events(&self) -> Result<(), GattError>;

    /// Stop receiving connection-level GATT events.
    fn unregister_connection_events(&self);

    /// Issue a Read Request for a characteristic value.
    fn read_value(
        &self,
        address: &BdAddr,
        handle: AttributeHandle,
    ) -> Result<GattTransactionId, GattError>;

    /// Issue a Write Request for a characteristic or descriptor value.
    fn write_value(
        &self,
        address: &BdAddr,
        handle: AttributeHandle,
        value: &[u8],
    ) -> Result<GattTransactionId, GattError>;

    /// Cancel an outstanding request.
    fn cancel_transaction(&self, transaction_id: GattTransactionId) -> Result<(), GattError>;

    /// Services discovered on a connected device.
    fn query_services(&self, address: &BdAddr) -> Result<Vec<ServiceInfo>, GattError>;
}

/// Asynchronous outcome or push from the GATT layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// A Read Request completed.
    ReadResponse {
        /// Transaction the response belongs to.
        transaction_id: GattTransactionId,
        /// Attribute value.
        value: Vec<u8>,
    },
    /// A Write Request completed.
    WriteResponse {
        /// Transaction the response belongs to.
        transaction_id: GattTransactionId,
    },
    /// The peer answered with an ATT Error Response, or the request timed out.
    ErrorResponse {
        /// Transaction the response belongs to.
        transaction_id: GattTransactionId,
        /// ATT error code (see [`att_error`]).
        error_code: u8,
    },
    /// A Handle Value Notification.
    Notification {
        /// Device that sent the value.
        address: BdAddr,
        /// Attribute handle.
        handle: AttributeHandle,
        /// Attribute value.
        value: Vec<u8>,
    },
    /// A Handle Value Indication.
    Indication {
        /// Device that sent the value.
        address: BdAddr,
        /// Attribute handle.
        handle: AttributeHandle,
        /// Attribute value.
        value: Vec<u8>,
    },
}

/// Map an ATT error code from an Error Response to a domain error.
pub fn error_from_att_code(code: u8) -> crate::error::Error {
    use crate::error::Error;

    match code {
        att_error::INVALID_HANDLE => Error::InvalidHandle,
        att_error::ATTRIBUTE_NOT_FOUND | att_error::REQUEST_NOT_SUPPORTED => {
            Error::AttributeNotSupported
        }
        att_error::READ_NOT_PERMITTED | att_error::WRITE_NOT_PERMITTED => Error::InvalidOperation,
        _ => Error::ResponseInvalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_properties() {
        let props = CharacteristicProperties::from_byte(
            CharacteristicProperties::READ | CharacteristicProperties::INDICATE,
        );
        assert!(props.can_read());
        assert!(props.can_indicate());
        assert!(!props.can_notify());
        assert_eq!(props.to_byte(), 0x22);
    }

    #[test]
    fn test_att_error_mapping() {
        assert_eq!(error_from_att_code(att_error::INVALID_HANDLE), Error::InvalidHandle);
        assert_eq!(
            error_from_att_code(att_error::ATTRIBUTE_NOT_FOUND),
            Error::AttributeNotSupported
        );
        assert_eq!(
            error_from_att_code(att_error::WRITE_NOT_PERMITTED),
            Error::InvalidOperation
        );
        assert_eq!(error_from_att_code(0x80), Error::ResponseInvalid);
    }
}
