//! Protocol module for parsing and constructing messages.
//!
//! This module contains the implementations for:
//! - Blood Pressure Measurement value decoding
//! - Collector IPC message framing, requests and events
//! - The outbound messaging seam

pub mod measurement;
pub mod messages;
pub mod transport;

pub use measurement::decode_measurement;
pub use messages::{
    decode_event, encode_event, Message, MessageFunction, MessageHeader, Request,
    BLOOD_PRESSURE_MESSAGE_GROUP,
};
pub use transport::MessageTransport;
