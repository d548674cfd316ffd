//! Inbound collector request handling.
//!
//! Requests arrive as IPC [`Message`]s from client endpoints. Each accepted
//! request gets exactly one response whose status is negative on error and
//! otherwise carries the callback id (register), the transaction id
//! (feature read) or zero.

use tracing::{debug, warn};

use crate::ble::gatt::GattClient;
use crate::error::{Error, Result};
use crate::protocol::messages::{Message, Request, BLOOD_PRESSURE_MESSAGE_GROUP};
use crate::registry::callbacks::{AddressId, Endpoint};
use crate::registry::{CallbackId, Registry};

/// Decide whether a message is a request to act on.
///
/// Returns `None` for messages to ignore: responses and messages for another
/// group. Otherwise returns the decoded request, or the error to answer with
/// when the message is undersized or names an unknown function.
pub fn screen(message: &Message) -> Option<Result<Request>> {
    let header = &message.header;
    if header.is_response() {
        debug!("Ignoring response message {:#010x}", header.message_id);
        return None;
    }
    if header.group != BLOOD_PRESSURE_MESSAGE_GROUP {
        debug!("Ignoring message for group {:#010x}", header.group);
        return None;
    }

    let request = Request::decode(message);
    if let Err(e) = &request {
        warn!(
            "Rejecting function {:#010x} from {:#010x}: {}",
            header.function, header.address_id, e
        );
    }
    Some(request)
}

/// Run a request from a messaging endpoint against the registries.
///
/// # Returns
///
/// The non-negative response status on success.
///
/// # Errors
///
/// [`Error::InvalidCallbackSpecified`] if the request names a callback owned
/// by another endpoint, otherwise whatever the registry operation returns.
pub fn execute(
    registry: &mut Registry,
    address_id: AddressId,
    request: Request,
    gatt: &dyn GattClient,
) -> Result<i32> {
    debug!("{:?} from {:#010x}", request.function(), address_id);

    match request {
        Request::RegisterCollectorEvents => registry
            .register(Endpoint::Remote(address_id))
            .map(|id| status(id.value())),
        Request::UnregisterCollectorEvents { callback_id } => {
            check_owner(registry, address_id, callback_id)?;
            registry.unregister(callback_id, gatt).map(|_| 0)
        }
        Request::Enable {
            callback_id,
            address,
            kind,
        } => {
            check_owner(registry, address_id, callback_id)?;
            registry.enable(callback_id, address, kind, gatt).map(|_| 0)
        }
        Request::Disable {
            callback_id,
            address,
            kind,
        } => {
            check_owner(registry, address_id, callback_id)?;
            registry.disable(callback_id, address, kind, gatt).map(|_| 0)
        }
        Request::GetBloodPressureFeature {
            callback_id,
            address,
        } => {
            check_owner(registry, address_id, callback_id)?;
            registry
                .get_feature(callback_id, address, gatt)
                .map(|id| status(id.value()))
        }
        Request::CancelTransaction {
            callback_id,
            transaction_id,
        } => {
            check_owner(registry, address_id, callback_id)?;
            registry.cancel(callback_id, transaction_id, gatt).map(|_| 0)
        }
    }
}

/// A callback registered by one endpoint cannot be driven by another.
fn check_owner(registry: &Registry, address_id: AddressId, callback_id: CallbackId) -> Result<()> {
    match registry.callbacks.lookup(callback_id) {
        Some(entry) if !entry.is_owned_by(address_id) => Err(Error::InvalidCallbackSpecified),
        _ => Ok(()),
    }
}

// Ids are allocated below the sign bit.
fn status(id: u32) -> i32 {
    i32::try_from(id).unwrap_or(i32::MAX)
}

/// Response status for an operation outcome.
pub fn response_status(result: &Result<i32>) -> i32 {
    match result {
        Ok(status) => *status,
        Err(e) => e.status_code(),
    }
}
