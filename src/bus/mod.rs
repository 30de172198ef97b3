//! # Typed Message Bus
//!
//! Priority-ordered, at-most-once, optionally cancellable message delivery
//! between distributed components. Clients connect, register the message
//! types they send and receive, and exchange opaque tagged payloads; the bus
//! resolves addresses against the live receiver registry and enqueues into
//! per-receiver priority queues.
//!
//! Two implementations share one contract: [`MemoryMessageBus`] for
//! components in the same process, and [`net::NetMessageBus`] speaking to a
//! [`net::BusServer`] for components spread across a cluster. Callers cannot
//! tell them apart short of measuring latency.

pub mod cancellation;
pub mod errors;
pub mod memory;
pub mod net;
pub mod queue;
pub mod queued_message;
pub mod rcu;
pub mod registry;
pub mod types;

use async_trait::async_trait;

pub use cancellation::{CancellationToken, SharedBool};
pub use errors::{BusError, BusResult};
pub use memory::MemoryMessageBus;
pub use types::{
    Address, AnnotatedMessage, ClientId, MessageStyle, MessageTypeId, Priority, SendStatus,
    TaggedMessage, DEFAULT_PRIORITY, SYNC_RESPONSE_PRIORITY,
};

/// The message-bus contract shared by every backend.
///
/// Registration calls return `Ok(false)` for "not connected or already
/// registered" rather than an error, mirroring the send-status philosophy:
/// the caller decides whether that is fatal.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Connects a new client, returning its bus-assigned id.
    async fn connect(&self) -> BusResult<ClientId>;

    /// Disconnects a client, draining its queue and removing it from every
    /// receiver-directory entry. Returns false for an unknown id. Safe to
    /// call concurrently with in-flight sends targeting this client.
    async fn disconnect(&self, client: ClientId) -> BusResult<bool>;

    async fn register_client_as_sender(
        &self,
        client: ClientId,
        message_type: MessageTypeId,
    ) -> BusResult<bool>;

    async fn register_client_as_receiver(
        &self,
        client: ClientId,
        message_type: MessageTypeId,
    ) -> BusResult<bool>;

    /// Sends `message` to the recipients `address` resolves to under
    /// `style`. All registry validation happens before any queue push, so a
    /// multi-recipient broadcast cannot partially fail.
    async fn send(
        &self,
        sender: ClientId,
        address: &Address,
        style: &MessageStyle,
        message: TaggedMessage,
        priority: Priority,
    ) -> BusResult<SendStatus>;

    /// Like [`send`](Self::send), additionally returning a cancellation
    /// token when the send was accepted.
    async fn send_cancellable(
        &self,
        sender: ClientId,
        address: &Address,
        style: &MessageStyle,
        message: TaggedMessage,
        priority: Priority,
    ) -> BusResult<(SendStatus, Option<CancellationToken>)>;

    /// Retracts a previously sent message. Fire-and-forget: cancelling an
    /// already delivered, expired, or cancelled message is a no-op.
    async fn cancel_message(&self, sender: ClientId, token: &CancellationToken) -> BusResult<()>;

    /// Receives one message, suspending until a message with priority at or
    /// above `min_priority` is available.
    async fn receive(
        &self,
        receiver: ClientId,
        min_priority: Priority,
        delete_immediately: bool,
    ) -> BusResult<AnnotatedMessage> {
        let mut batch = self
            .receive_batch(receiver, min_priority, 1, delete_immediately)
            .await?;
        batch.pop().ok_or(BusError::ConnectionClosed)
    }

    /// Receives up to `max_messages` messages (`0` = no limit), suspending
    /// until at least one qualifies.
    async fn receive_batch(
        &self,
        receiver: ClientId,
        min_priority: Priority,
        max_messages: usize,
        delete_immediately: bool,
    ) -> BusResult<Vec<AnnotatedMessage>>;

    /// Non-suspending variant of [`receive_batch`](Self::receive_batch);
    /// returns an empty batch when nothing currently qualifies.
    async fn try_receive_batch(
        &self,
        receiver: ClientId,
        min_priority: Priority,
        max_messages: usize,
        delete_immediately: bool,
    ) -> BusResult<Vec<AnnotatedMessage>>;

    /// Deletes messages previously received with `delete_immediately =
    /// false`. A no-op for ids already removed.
    async fn delete_messages(&self, receiver: ClientId, message_ids: &[i64]) -> BusResult<()>;

    /// Number of messages currently queued for a receiver.
    async fn count_queued_messages(&self, receiver: ClientId) -> BusResult<usize>;
}
