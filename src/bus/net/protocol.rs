//! # Wire Protocol for the Networked Bus
//!
//! Newline-delimited JSON frames over TCP. Every client call is one
//! request frame answered by exactly one response frame; a blocking receive
//! is simply a request whose response is deferred until the server-hosted
//! bus yields messages.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::bus::errors::{BusError, BusResult};
use crate::bus::types::{
    Address, AnnotatedMessage, ClientId, MessageStyle, MessageTypeId, Priority, SendStatus,
    TaggedMessage,
};

/// Client-to-server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request")]
pub enum Request {
    Connect,
    Disconnect {
        client: ClientId,
    },
    RegisterSender {
        client: ClientId,
        message_type: MessageTypeId,
    },
    RegisterReceiver {
        client: ClientId,
        message_type: MessageTypeId,
    },
    Send {
        sender: ClientId,
        address: Address,
        style: MessageStyle,
        message_type: MessageTypeId,
        payload: Vec<u8>,
        priority: Priority,
        /// When set, the server retains a cancellation token for this
        /// message, addressable by the returned message id.
        cancellable: bool,
    },
    CancelMessage {
        sender: ClientId,
        message_id: i64,
    },
    Receive {
        receiver: ClientId,
        min_priority: Priority,
        max_messages: usize,
        delete_immediately: bool,
        block: bool,
    },
    DeleteMessages {
        receiver: ClientId,
        message_ids: Vec<i64>,
    },
    CountQueued {
        receiver: ClientId,
    },
}

/// Server-to-client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response")]
pub enum Response {
    Connected { client: ClientId },
    Disconnected { existed: bool },
    Registered { accepted: bool },
    Sent { status: SendStatus, message_id: Option<i64> },
    Cancelled,
    Messages { messages: Vec<WireMessage> },
    Deleted,
    QueueLength { count: usize },
    Error { message: String },
}

/// A delivered message as it crosses the wire. The envelope fields
/// round-trip exactly; payload bytes are opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub sender: ClientId,
    pub send_time: DateTime<Utc>,
    pub message_type: MessageTypeId,
    pub payload: Vec<u8>,
    pub message_id: i64,
}

impl From<AnnotatedMessage> for WireMessage {
    fn from(message: AnnotatedMessage) -> Self {
        Self {
            sender: message.sender,
            send_time: message.send_time,
            message_type: message.message.message_type,
            payload: message.message.payload,
            message_id: message.message_id,
        }
    }
}

impl From<WireMessage> for AnnotatedMessage {
    fn from(wire: WireMessage) -> Self {
        Self {
            sender: wire.sender,
            send_time: wire.send_time,
            message_id: wire.message_id,
            message: TaggedMessage::new(wire.message_type, wire.payload),
        }
    }
}

/// Writes one frame followed by a newline.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> BusResult<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame; `Ok(None)` means the peer closed the connection.
pub async fn read_frame<R, T>(reader: &mut R) -> BusResult<Option<T>>
where
    R: AsyncBufReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return Err(BusError::protocol("empty frame"));
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frames_round_trip() {
        let request = Request::Send {
            sender: 4,
            address: Address::all(),
            style: MessageStyle::broadcast().with_expiration(Utc::now()),
            message_type: 11,
            payload: vec![1, 2, 3],
            priority: 200,
            cancellable: true,
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        match back {
            Request::Send {
                sender,
                message_type,
                payload,
                priority,
                cancellable,
                style,
                ..
            } => {
                assert_eq!(sender, 4);
                assert_eq!(message_type, 11);
                assert_eq!(payload, vec![1, 2, 3]);
                assert_eq!(priority, 200);
                assert!(cancellable);
                assert!(style.expiration_time.is_some());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_wire_message_preserves_envelope() {
        let annotated = AnnotatedMessage {
            sender: 9,
            send_time: Utc::now(),
            message_id: 77,
            message: TaggedMessage::new(5, b"abc".to_vec()),
        };
        let wire = WireMessage::from(annotated.clone());
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireMessage = serde_json::from_str(&json).unwrap();
        let restored = AnnotatedMessage::from(back);
        assert_eq!(restored.sender, annotated.sender);
        assert_eq!(restored.send_time, annotated.send_time);
        assert_eq!(restored.message_id, annotated.message_id);
        assert_eq!(restored.message, annotated.message);
    }
}
