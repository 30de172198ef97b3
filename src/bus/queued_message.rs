//! A message resident in a receiver's queue, plus its total delivery order.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};

use crate::bus::cancellation::SharedBool;
use crate::bus::types::{AnnotatedMessage, ClientId, Priority, TaggedMessage};

/// Sort key defining the total delivery order of queued messages.
///
/// Ranked by priority (higher first), then earlier expiration deadline
/// (messages without a deadline sort after all messages with one), then
/// earlier send time, then larger message id. Message ids are unique within a
/// queue, so the order is total and deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeliveryOrder {
    priority_rank: Reverse<Priority>,
    expires: DateTime<Utc>,
    send_time: DateTime<Utc>,
    id_rank: Reverse<i64>,
}

/// A message as it sits in a receiver's queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    sender: ClientId,
    priority: Priority,
    send_time: DateTime<Utc>,
    expiration_time: Option<DateTime<Utc>>,
    message_id: i64,
    cancel_flag: SharedBool,
    message: TaggedMessage,
}

impl QueuedMessage {
    pub fn new(
        sender: ClientId,
        priority: Priority,
        send_time: DateTime<Utc>,
        expiration_time: Option<DateTime<Utc>>,
        message_id: i64,
        cancel_flag: SharedBool,
        message: TaggedMessage,
    ) -> Self {
        Self {
            sender,
            priority,
            send_time,
            expiration_time,
            message_id,
            cancel_flag,
            message,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    pub fn message_type(&self) -> crate::bus::types::MessageTypeId {
        self.message.message_type
    }

    pub fn expired(&self) -> bool {
        self.expiration_time
            .map(|deadline| deadline <= Utc::now())
            .unwrap_or(false)
    }

    pub fn cancelled(&self) -> bool {
        self.cancel_flag.get()
    }

    pub fn expired_or_cancelled(&self) -> bool {
        self.expired() || self.cancelled()
    }

    pub fn delivery_order(&self) -> DeliveryOrder {
        DeliveryOrder {
            priority_rank: Reverse(self.priority),
            expires: self.expiration_time.unwrap_or(DateTime::<Utc>::MAX_UTC),
            send_time: self.send_time,
            id_rank: Reverse(self.message_id),
        }
    }

    pub fn to_annotated(&self) -> AnnotatedMessage {
        AnnotatedMessage {
            sender: self.sender,
            send_time: self.send_time,
            message_id: self.message_id,
            message: self.message.clone(),
        }
    }

    pub fn into_annotated(self) -> AnnotatedMessage {
        AnnotatedMessage {
            sender: self.sender,
            send_time: self.send_time,
            message_id: self.message_id,
            message: self.message,
        }
    }
}
