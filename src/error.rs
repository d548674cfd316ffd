//! Error types for the blood-pressure-collector crate.
//!
//! Every error carries a stable negative status code so it can travel inside
//! an IPC response or event message and be reconstructed on the other side.

use thiserror::Error;

use crate::ble::gatt::GattError;

/// The main error type for this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The collector manager has not been started, or has been shut down.
    #[error("Blood pressure collector not initialized")]
    NotInitialized,

    /// The collector manager was started twice.
    #[error("Blood pressure collector already initialized")]
    AlreadyInitialized,

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// The shared registry lock could not be acquired in time.
    #[error("Unable to lock context")]
    UnableToLockContext,

    /// A collector callback is already registered.
    #[error("Collector callback already registered")]
    AlreadyRegistered,

    /// No collector callback is registered.
    #[error("Collector callback not registered")]
    CallbackNotRegistered,

    /// The callback id does not name a live registration owned by the caller.
    #[error("Invalid callback specified")]
    InvalidCallbackSpecified,

    /// No Blood Pressure device is bound under the given address.
    #[error("Unknown device")]
    UnknownDevice,

    /// The same request is already outstanding for this device and callback.
    #[error("Same request already outstanding")]
    DuplicateOutstandingRequest,

    /// A disable was requested without a matching enable.
    #[error("Not subscribed")]
    NotSubscribed,

    /// The device is no longer connected.
    #[error("Device not connected")]
    NotConnected,

    /// A malformed or undersized message or attribute value.
    #[error("Response message invalid")]
    ResponseInvalid,

    /// The attribute is not supported by the device or the stack.
    #[error("Attribute not supported")]
    AttributeNotSupported,

    /// The GATT connection identifier is invalid.
    #[error("Invalid connection")]
    InvalidConnection,

    /// The attribute handle is invalid.
    #[error("Invalid attribute handle")]
    InvalidHandle,

    /// The GATT stack rejected the operation.
    #[error("Invalid operation")]
    InvalidOperation,

    /// The messaging transport failed to deliver a message.
    #[error("Transport error: {reason}")]
    Transport {
        /// Description of the failure.
        reason: String,
    },

    /// The configuration store failed.
    #[error("Storage error: {reason}")]
    Storage {
        /// Description of the failure.
        reason: String,
    },
}

impl Error {
    /// Wire status for this error. Always negative.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::InvalidParameter { .. } => -1,
            Self::UnableToLockContext => -2,
            Self::InvalidCallbackSpecified => -3,
            Self::UnknownDevice => -4,
            Self::NotConnected => -5,
            Self::ResponseInvalid => -6,
            Self::AttributeNotSupported => -7,
            Self::InvalidConnection => -8,
            Self::InvalidHandle => -9,
            Self::InvalidOperation => -10,
            Self::Transport { .. } => -11,
            Self::Storage { .. } => -12,
            Self::NotInitialized => -1100,
            Self::AlreadyInitialized => -1101,
            Self::AlreadyRegistered => -1102,
            Self::CallbackNotRegistered => -1103,
            Self::DuplicateOutstandingRequest => -1104,
            Self::NotSubscribed => -1105,
        }
    }

    /// Rebuild an error from a wire status.
    ///
    /// Returns `None` for non-negative statuses, which denote success.
    pub fn from_status_code(status: i32) -> Option<Self> {
        if status >= 0 {
            return None;
        }

        let error = match status {
            -2 => Self::UnableToLockContext,
            -3 => Self::InvalidCallbackSpecified,
            -4 => Self::UnknownDevice,
            -5 => Self::NotConnected,
            -6 => Self::ResponseInvalid,
            -7 => Self::AttributeNotSupported,
            -8 => Self::InvalidConnection,
            -9 => Self::InvalidHandle,
            -10 => Self::InvalidOperation,
            -11 => Self::Transport {
                reason: "remote".to_string(),
            },
            -12 => Self::Storage {
                reason: "remote".to_string(),
            },
            -1100 => Self::NotInitialized,
            -1101 => Self::AlreadyInitialized,
            -1102 => Self::AlreadyRegistered,
            -1103 => Self::CallbackNotRegistered,
            -1104 => Self::DuplicateOutstandingRequest,
            -1105 => Self::NotSubscribed,
            other => Self::InvalidParameter {
                name: "status".to_string(),
                value: other.to_string(),
            },
        };

        Some(error)
    }
}

impl From<GattError> for Error {
    fn from(error: GattError) -> Self {
        match error {
            GattError::NotSupported | GattError::NotInitialized => Self::AttributeNotSupported,
            GattError::InvalidParameter => Self::InvalidParameter {
                name: "gatt".to_string(),
                value: error.to_string(),
            },
            GattError::InvalidConnection => Self::InvalidConnection,
            GattError::InvalidHandle => Self::InvalidHandle,
            GattError::InvalidServiceTable | GattError::Other(_) => Self::InvalidOperation,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
