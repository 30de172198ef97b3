//! # Core Bus Types
//!
//! Identifiers, message envelopes, addressing, and send outcomes shared by
//! every bus implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a bus endpoint (worker, shiftboss, foreman, coordinator).
///
/// Assigned by the bus on `connect()`. Both bus implementations in this crate
/// hand out ids from a monotonically increasing counter and never reuse them,
/// even after `disconnect()`.
pub type ClientId = u32;

/// Application-defined tag identifying the kind of payload a message carries.
///
/// A client must register as a sender and/or receiver for a type before it may
/// send or receive messages of that type.
pub type MessageTypeId = u32;

/// Message urgency in `[0, 255]`; higher is more urgent.
pub type Priority = u8;

/// Default priority for ordinary traffic.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Highest priority, reserved for the synchronous-response message class.
pub const SYNC_RESPONSE_PRIORITY: Priority = 255;

/// An opaque payload tagged with its message type.
///
/// The bus routes on `message_type` only and never interprets `payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedMessage {
    pub message_type: MessageTypeId,
    pub payload: Vec<u8>,
}

impl TaggedMessage {
    pub fn new(message_type: MessageTypeId, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    /// Payload length in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.payload.len()
    }
}

/// A delivered message together with its envelope metadata.
#[derive(Debug, Clone)]
pub struct AnnotatedMessage {
    /// Client that sent the message.
    pub sender: ClientId,
    /// Wall-clock instant the bus accepted the send.
    pub send_time: DateTime<Utc>,
    /// Bus-assigned id, unique among live messages for this receiver. Needed
    /// to delete a message that was popped without immediate deletion.
    pub message_id: i64,
    pub message: TaggedMessage,
}

/// Destination of a send: every receiver registered for the message's type,
/// or an explicit recipient set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Address {
    send_to_all: bool,
    explicit_recipients: Vec<ClientId>,
}

impl Address {
    /// Address resolved at send time against the live receiver set for the
    /// message's type.
    pub fn all() -> Self {
        Self {
            send_to_all: true,
            explicit_recipients: Vec::new(),
        }
    }

    /// Address naming a single explicit recipient.
    pub fn to(recipient: ClientId) -> Self {
        Self {
            send_to_all: false,
            explicit_recipients: vec![recipient],
        }
    }

    pub fn add_recipient(&mut self, recipient: ClientId) -> &mut Self {
        self.explicit_recipients.push(recipient);
        self
    }

    pub fn is_send_to_all(&self) -> bool {
        self.send_to_all
    }

    pub fn explicit_recipients(&self) -> &[ClientId] {
        &self.explicit_recipients
    }
}

/// Delivery style of a send.
///
/// With `broadcast` unset and more than one valid recipient, the bus picks
/// exactly one uniformly at random. The sender has no say in the choice; this
/// is long-standing documented behavior that callers rely on for cheap load
/// spreading, not an accident to paper over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageStyle {
    pub broadcast: bool,
    /// Soft deadline. A message whose deadline has passed is never handed to
    /// a receiver; it is discarded on the next queue touch.
    pub expiration_time: Option<DateTime<Utc>>,
}

impl MessageStyle {
    pub fn broadcast() -> Self {
        Self {
            broadcast: true,
            expiration_time: None,
        }
    }

    pub fn with_expiration(mut self, expiration_time: DateTime<Utc>) -> Self {
        self.expiration_time = Some(expiration_time);
        self
    }
}

/// Outcome of a `send()` call. Protocol-level failures are data, never panics
/// or thrown errors; the caller decides whether to re-register or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    Ok,
    SenderNotConnected,
    SenderNotRegisteredForMessageType,
    /// An explicitly named recipient is connected but not registered for the
    /// message's type. Named recipients that are simply not connected are
    /// silently excluded instead.
    ReceiverNotRegisteredForMessageType,
    NoReceivers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_builders() {
        let all = Address::all();
        assert!(all.is_send_to_all());
        assert!(all.explicit_recipients().is_empty());

        let mut explicit = Address::to(3);
        explicit.add_recipient(7);
        assert!(!explicit.is_send_to_all());
        assert_eq!(explicit.explicit_recipients(), &[3, 7]);
    }

    #[test]
    fn test_message_style_expiration() {
        let style = MessageStyle::default();
        assert!(!style.broadcast);
        assert!(style.expiration_time.is_none());

        let deadline = Utc::now();
        let style = MessageStyle::broadcast().with_expiration(deadline);
        assert!(style.broadcast);
        assert_eq!(style.expiration_time, Some(deadline));
    }

    #[test]
    fn test_send_status_round_trip() {
        let json = serde_json::to_string(&SendStatus::NoReceivers).unwrap();
        let back: SendStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SendStatus::NoReceivers);
    }
}
