//! Messaging channel seam.

use crate::error::Result;
use crate::protocol::messages::Message;

/// Outbound side of the IPC channel.
///
/// Sends are fire-and-forget; the collector never waits for an
/// acknowledgement of an event.
#[cfg_attr(test, mockall::automock)]
pub trait MessageTransport: Send + Sync {
    /// Allocate a message id for an unsolicited message.
    fn next_message_id(&self) -> u32;

    /// Queue a message for delivery.
    fn send(&self, message: Message) -> Result<()>;
}
