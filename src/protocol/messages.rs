//! Collector IPC message types and parsing.
//!
//! Every message starts with a fixed header of five little-endian `u32`s:
//! AddressID(4) + MessageID(4) + MessageGroup(4) + MessageFunction(4) +
//! PayloadLength(4). A response reuses the request's message id with the
//! top bit set and carries a single `i32` status.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ble::address::BdAddr;
use crate::data::feature::BloodPressureFeature;
use crate::data::measurement::{
    MeasurementFlags, MeasurementStatus, PressureMeasurement, SFloat, TimeStamp,
};
use crate::dispatch::Event;
use crate::error::{Error, Result};
use crate::registry::callbacks::AddressId;
use crate::registry::devices::DeviceFlags;
use crate::registry::subscriptions::SubscriptionKind;
use crate::registry::{CallbackId, TransactionId};

/// Message group of the Blood Pressure collector.
pub const BLOOD_PRESSURE_MESSAGE_GROUP: u32 = 0x0000_1108;

/// Bit set in the message id of a response.
pub const RESPONSE_MESSAGE_ID_MASK: u32 = 0x8000_0000;

/// Collector message functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageFunction {
    /// Register for collector events.
    RegisterCollectorEvents = 0x0000_1001,
    /// Unregister collector events.
    UnregisterCollectorEvents = 0x0000_1002,
    /// Enable Blood Pressure Measurement indications.
    EnableBpmIndications = 0x0000_1101,
    /// Disable Blood Pressure Measurement indications.
    DisableBpmIndications = 0x0000_1102,
    /// Enable Intermediate Cuff Pressure notifications.
    EnableIcpNotifications = 0x0000_1103,
    /// Disable Intermediate Cuff Pressure notifications.
    DisableIcpNotifications = 0x0000_1104,
    /// Read the Blood Pressure Feature.
    GetBloodPressureFeature = 0x0000_1105,
    /// Cancel an outstanding transaction.
    CancelTransaction = 0x0000_1106,

    /// A sensor connected.
    Connected = 0x0001_0001,
    /// A sensor disconnected.
    Disconnected = 0x0001_0002,
    /// A Blood Pressure Measurement arrived.
    BloodPressureMeasurement = 0x0001_1003,
    /// An Intermediate Cuff Pressure value arrived.
    IntermediateCuffPressure = 0x0001_1004,
    /// A Blood Pressure Feature read completed.
    FeatureResponse = 0x0001_1005,
    /// A CCCD write completed.
    ConfigurationResponse = 0x0001_1006,

    /// Unknown function.
    Unknown = 0xFFFF_FFFF,
}

impl MessageFunction {
    /// Create from raw value.
    pub fn from_raw(value: u32) -> Self {
        match value {
            0x0000_1001 => Self::RegisterCollectorEvents,
            0x0000_1002 => Self::UnregisterCollectorEvents,
            0x0000_1101 => Self::EnableBpmIndications,
            0x0000_1102 => Self::DisableBpmIndications,
            0x0000_1103 => Self::EnableIcpNotifications,
            0x0000_1104 => Self::DisableIcpNotifications,
            0x0000_1105 => Self::GetBloodPressureFeature,
            0x0000_1106 => Self::CancelTransaction,
            0x0001_0001 => Self::Connected,
            0x0001_0002 => Self::Disconnected,
            0x0001_1003 => Self::BloodPressureMeasurement,
            0x0001_1004 => Self::IntermediateCuffPressure,
            0x0001_1005 => Self::FeatureResponse,
            0x0001_1006 => Self::ConfigurationResponse,
            _ => Self::Unknown,
        }
    }

    /// Convert to raw value.
    pub fn to_raw(&self) -> u32 {
        *self as u32
    }

    /// Check if this function is an asynchronous event.
    pub fn is_event(&self) -> bool {
        !matches!(self, Self::Unknown) && self.to_raw() >= 0x0001_0000
    }

    /// Smallest payload a request with this function may carry.
    pub fn min_request_payload(&self) -> Option<usize> {
        match self {
            Self::RegisterCollectorEvents => Some(0),
            Self::UnregisterCollectorEvents => Some(4),
            Self::EnableBpmIndications
            | Self::DisableBpmIndications
            | Self::EnableIcpNotifications
            | Self::DisableIcpNotifications
            | Self::GetBloodPressureFeature => Some(4 + BdAddr::SIZE),
            Self::CancelTransaction => Some(8),
            _ => None,
        }
    }
}

/// Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Endpoint the message came from or goes to.
    pub address_id: AddressId,
    /// Message id; the top bit marks a response.
    pub message_id: u32,
    /// Message group.
    pub group: u32,
    /// Message function.
    pub function: u32,
    /// Length of payload in bytes.
    pub payload_length: u32,
}

impl MessageHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 20;

    /// Parse a header from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::ResponseInvalid);
        }

        let mut buf = data;
        Ok(Self {
            address_id: buf.get_u32_le(),
            message_id: buf.get_u32_le(),
            group: buf.get_u32_le(),
            function: buf.get_u32_le(),
            payload_length: buf.get_u32_le(),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.address_id);
        buf.put_u32_le(self.message_id);
        buf.put_u32_le(self.group);
        buf.put_u32_le(self.function);
        buf.put_u32_le(self.payload_length);
    }

    /// Check if this is a response.
    pub fn is_response(&self) -> bool {
        self.message_id & RESPONSE_MESSAGE_ID_MASK != 0
    }

    /// The message function.
    pub fn message_function(&self) -> MessageFunction {
        MessageFunction::from_raw(self.function)
    }
}

/// A complete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message header.
    pub header: MessageHeader,
    /// Message payload.
    pub payload: Bytes,
}

impl Message {
    /// Create a collector message.
    pub fn new(
        address_id: AddressId,
        message_id: u32,
        function: MessageFunction,
        payload: Bytes,
    ) -> Self {
        Self {
            header: MessageHeader {
                address_id,
                message_id,
                group: BLOOD_PRESSURE_MESSAGE_GROUP,
                function: function.to_raw(),
                payload_length: payload.len() as u32,
            },
            payload,
        }
    }

    /// Parse a complete message from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = MessageHeader::parse(data)?;
        let end = MessageHeader::SIZE + header.payload_length as usize;
        if data.len() < end {
            return Err(Error::ResponseInvalid);
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&data[MessageHeader::SIZE..end]),
        })
    }

    /// Serialize the message to bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MessageHeader::SIZE + self.payload.len());
        self.header.write(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Build the response to this message.
    pub fn response(&self, status: i32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_i32_le(status);
        Self {
            header: MessageHeader {
                message_id: self.header.message_id | RESPONSE_MESSAGE_ID_MASK,
                payload_length: 4,
                ..self.header
            },
            payload: payload.freeze(),
        }
    }

    /// Status carried by a response.
    pub fn response_status(&self) -> Result<i32> {
        if !self.header.is_response() || self.payload.len() < 4 {
            return Err(Error::ResponseInvalid);
        }
        let mut buf = &self.payload[..];
        Ok(buf.get_i32_le())
    }
}

/// A decoded collector request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Register for collector events.
    RegisterCollectorEvents,
    /// Unregister collector events.
    UnregisterCollectorEvents {
        /// Registration to remove.
        callback_id: CallbackId,
    },
    /// Enable a subscription.
    Enable {
        /// Requesting registration.
        callback_id: CallbackId,
        /// Target device.
        address: BdAddr,
        /// Characteristic.
        kind: SubscriptionKind,
    },
    /// Disable a subscription.
    Disable {
        /// Requesting registration.
        callback_id: CallbackId,
        /// Target device.
        address: BdAddr,
        /// Characteristic.
        kind: SubscriptionKind,
    },
    /// Read the Blood Pressure Feature.
    GetBloodPressureFeature {
        /// Requesting registration.
        callback_id: CallbackId,
        /// Target device.
        address: BdAddr,
    },
    /// Cancel an outstanding transaction.
    CancelTransaction {
        /// Requesting registration.
        callback_id: CallbackId,
        /// Transaction to cancel.
        transaction_id: TransactionId,
    },
}

impl Request {
    /// Decode a request message.
    ///
    /// # Errors
    ///
    /// - [`Error::ResponseInvalid`] if the payload is shorter than the
    ///   function requires.
    /// - [`Error::InvalidParameter`] for an unknown function.
    pub fn decode(message: &Message) -> Result<Self> {
        let function = message.header.message_function();
        let min = function
            .min_request_payload()
            .ok_or_else(|| Error::InvalidParameter {
                name: "function".to_string(),
                value: format!("{:#010x}", message.header.function),
            })?;

        if message.payload.len() < min {
            return Err(Error::ResponseInvalid);
        }

        let mut buf = &message.payload[..];
        let request = match function {
            MessageFunction::RegisterCollectorEvents => Self::RegisterCollectorEvents,
            MessageFunction::UnregisterCollectorEvents => Self::UnregisterCollectorEvents {
                callback_id: CallbackId::new(buf.get_u32_le()),
            },
            MessageFunction::EnableBpmIndications | MessageFunction::EnableIcpNotifications => {
                Self::Enable {
                    callback_id: CallbackId::new(buf.get_u32_le()),
                    address: get_address(&mut buf),
                    kind: subscription_kind(function),
                }
            }
            MessageFunction::DisableBpmIndications | MessageFunction::DisableIcpNotifications => {
                Self::Disable {
                    callback_id: CallbackId::new(buf.get_u32_le()),
                    address: get_address(&mut buf),
                    kind: subscription_kind(function),
                }
            }
            MessageFunction::GetBloodPressureFeature => Self::GetBloodPressureFeature {
                callback_id: CallbackId::new(buf.get_u32_le()),
                address: get_address(&mut buf),
            },
            MessageFunction::CancelTransaction => Self::CancelTransaction {
                callback_id: CallbackId::new(buf.get_u32_le()),
                transaction_id: TransactionId::new(buf.get_u32_le()),
            },
            _ => {
                return Err(Error::InvalidParameter {
                    name: "function".to_string(),
                    value: format!("{:#010x}", message.header.function),
                })
            }
        };

        Ok(request)
    }

    /// Function code of this request.
    pub fn function(&self) -> MessageFunction {
        match self {
            Self::RegisterCollectorEvents => MessageFunction::RegisterCollectorEvents,
            Self::UnregisterCollectorEvents { .. } => MessageFunction::UnregisterCollectorEvents,
            Self::Enable {
                kind: SubscriptionKind::Measurement,
                ..
            } => MessageFunction::EnableBpmIndications,
            Self::Enable { .. } => MessageFunction::EnableIcpNotifications,
            Self::Disable {
                kind: SubscriptionKind::Measurement,
                ..
            } => MessageFunction::DisableBpmIndications,
            Self::Disable { .. } => MessageFunction::DisableIcpNotifications,
            Self::GetBloodPressureFeature { .. } => MessageFunction::GetBloodPressureFeature,
            Self::CancelTransaction { .. } => MessageFunction::CancelTransaction,
        }
    }

    /// Encode as a message from `address_id`.
    pub fn encode(&self, address_id: AddressId, message_id: u32) -> Message {
        let mut payload = BytesMut::new();
        match self {
            Self::RegisterCollectorEvents => {}
            Self::UnregisterCollectorEvents { callback_id } => {
                payload.put_u32_le(callback_id.value());
            }
            Self::Enable {
                callback_id,
                address,
                ..
            }
            | Self::Disable {
                callback_id,
                address,
                ..
            }
            | Self::GetBloodPressureFeature {
                callback_id,
                address,
            } => {
                payload.put_u32_le(callback_id.value());
                payload.put_slice(&address.to_le_bytes());
            }
            Self::CancelTransaction {
                callback_id,
                transaction_id,
            } => {
                payload.put_u32_le(callback_id.value());
                payload.put_u32_le(transaction_id.value());
            }
        }

        Message::new(address_id, message_id, self.function(), payload.freeze())
    }
}

fn subscription_kind(function: MessageFunction) -> SubscriptionKind {
    match function {
        MessageFunction::EnableIcpNotifications | MessageFunction::DisableIcpNotifications => {
            SubscriptionKind::IntermediateCuffPressure
        }
        _ => SubscriptionKind::Measurement,
    }
}

fn get_address(buf: &mut &[u8]) -> BdAddr {
    let mut bytes = [0u8; BdAddr::SIZE];
    buf.copy_to_slice(&mut bytes);
    BdAddr::from_le_bytes(bytes)
}

fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(error) => error.status_code(),
    }
}

fn put_measurement(buf: &mut BytesMut, m: &PressureMeasurement) {
    buf.put_u8(m.flags.to_byte());
    buf.put_u16_le(m.systolic.to_raw());
    buf.put_u16_le(m.diastolic.to_raw());
    buf.put_u16_le(m.mean_arterial_pressure.to_raw());
    let stamp = m.time_stamp.unwrap_or_default();
    buf.put_u16_le(stamp.year);
    buf.put_u8(stamp.month);
    buf.put_u8(stamp.day);
    buf.put_u8(stamp.hours);
    buf.put_u8(stamp.minutes);
    buf.put_u8(stamp.seconds);
    buf.put_u16_le(m.pulse_rate.unwrap_or_default().to_raw());
    buf.put_u8(m.user_id.unwrap_or_default());
    buf.put_u16_le(m.status.unwrap_or_default().to_raw());
}

fn get_measurement(buf: &mut &[u8]) -> PressureMeasurement {
    let flags = MeasurementFlags::from_byte(buf.get_u8());
    let systolic = SFloat::from_raw(buf.get_u16_le());
    let diastolic = SFloat::from_raw(buf.get_u16_le());
    let mean_arterial_pressure = SFloat::from_raw(buf.get_u16_le());
    let stamp = TimeStamp {
        year: buf.get_u16_le(),
        month: buf.get_u8(),
        day: buf.get_u8(),
        hours: buf.get_u8(),
        minutes: buf.get_u8(),
        seconds: buf.get_u8(),
    };
    let pulse_rate = SFloat::from_raw(buf.get_u16_le());
    let user_id = buf.get_u8();
    let status = MeasurementStatus::from_raw(buf.get_u16_le());

    PressureMeasurement {
        flags,
        systolic,
        diastolic,
        mean_arterial_pressure,
        time_stamp: flags.has_time_stamp().then_some(stamp),
        pulse_rate: flags.has_pulse_rate().then_some(pulse_rate),
        user_id: flags.has_user_id().then_some(user_id),
        status: flags.has_measurement_status().then_some(status),
    }
}

/// Size of an encoded measurement record.
const MEASUREMENT_RECORD_SIZE: usize = 19;

/// Encode an event for a remote callback.
pub fn encode_event(
    address_id: AddressId,
    message_id: u32,
    callback_id: CallbackId,
    event: &Event,
) -> Message {
    let mut payload = BytesMut::new();
    payload.put_u32_le(callback_id.value());
    payload.put_slice(&event.address().to_le_bytes());

    let function = match event {
        Event::Connected { flags, .. } => {
            payload.put_u32_le(flags.to_raw());
            MessageFunction::Connected
        }
        Event::Disconnected { .. } => MessageFunction::Disconnected,
        Event::Measurement { measurement, .. } => {
            put_measurement(&mut payload, measurement);
            MessageFunction::BloodPressureMeasurement
        }
        Event::IntermediateCuffPressure { measurement, .. } => {
            put_measurement(&mut payload, measurement);
            MessageFunction::IntermediateCuffPressure
        }
        Event::FeatureResponse {
            transaction_id,
            result,
            ..
        } => {
            payload.put_u32_le(transaction_id.value());
            payload.put_i32_le(status_of(result));
            payload.put_u16_le(result.as_ref().map(|f| f.to_raw()).unwrap_or(0));
            MessageFunction::FeatureResponse
        }
        Event::ConfigurationResponse {
            kind,
            enable,
            result,
            ..
        } => {
            payload.put_u8(kind.to_raw());
            payload.put_u8(u8::from(*enable));
            payload.put_i32_le(status_of(result));
            MessageFunction::ConfigurationResponse
        }
    };

    Message::new(address_id, message_id, function, payload.freeze())
}

/// Decode an event message, as a client library would.
///
/// # Errors
///
/// Returns [`Error::ResponseInvalid`] for a non-event or undersized message.
pub fn decode_event(message: &Message) -> Result<(CallbackId, Event)> {
    let function = message.header.message_function();
    let body = match function {
        MessageFunction::Connected => 4,
        MessageFunction::Disconnected => 0,
        MessageFunction::BloodPressureMeasurement | MessageFunction::IntermediateCuffPressure => {
            MEASUREMENT_RECORD_SIZE
        }
        MessageFunction::FeatureResponse => 10,
        MessageFunction::ConfigurationResponse => 6,
        _ => return Err(Error::ResponseInvalid),
    };
    if message.payload.len() < 4 + BdAddr::SIZE + body {
        return Err(Error::ResponseInvalid);
    }

    let mut buf = &message.payload[..];
    let callback_id = CallbackId::new(buf.get_u32_le());
    let address = get_address(&mut buf);

    let event = match function {
        MessageFunction::Connected => Event::Connected {
            address,
            flags: DeviceFlags::from_raw(buf.get_u32_le()),
        },
        MessageFunction::Disconnected => Event::Disconnected { address },
        MessageFunction::BloodPressureMeasurement => Event::Measurement {
            address,
            measurement: get_measurement(&mut buf),
        },
        MessageFunction::IntermediateCuffPressure => Event::IntermediateCuffPressure {
            address,
            measurement: get_measurement(&mut buf),
        },
        MessageFunction::FeatureResponse => {
            let transaction_id = TransactionId::new(buf.get_u32_le());
            let status = buf.get_i32_le();
            let feature = BloodPressureFeature::from_raw(buf.get_u16_le());
            Event::FeatureResponse {
                address,
                transaction_id,
                result: Error::from_status_code(status).map_or(Ok(feature), Err),
            }
        }
        _ => {
            let kind = SubscriptionKind::from_raw(buf.get_u8()).ok_or(Error::ResponseInvalid)?;
            let enable = buf.get_u8() != 0;
            let status = buf.get_i32_le();
            Event::ConfigurationResponse {
                address,
                kind,
                enable,
                result: Error::from_status_code(status).map_or(Ok(()), Err),
            }
        }
    };

    Ok((callback_id, event))
}
