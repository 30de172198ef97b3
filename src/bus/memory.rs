//! # In-Process Message Bus
//!
//! The shared-memory reference implementation: a [`ClientRegistry`] of
//! per-client priority queues behind copy-on-write snapshots. All components
//! in one process share a single instance through `Arc`.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::bus::cancellation::{CancellationToken, SharedBool};
use crate::bus::errors::{BusError, BusResult};
use crate::bus::queued_message::QueuedMessage;
use crate::bus::registry::{ClientRegistry, RegistrationState};
use crate::bus::types::{
    Address, AnnotatedMessage, ClientId, MessageStyle, MessageTypeId, Priority, SendStatus,
    TaggedMessage,
};
use crate::bus::MessageBus;

/// Shared-memory bus for components running in one process.
#[derive(Debug)]
pub struct MemoryMessageBus {
    registry: ClientRegistry,
    /// Fallback message-id sequence, counting down from -1 so its ids can
    /// never collide with the `(sender << 32) | serial` scheme.
    message_id_sequence: AtomicI64,
}

impl MemoryMessageBus {
    pub fn new() -> Self {
        Self {
            registry: ClientRegistry::new(),
            message_id_sequence: AtomicI64::new(-1),
        }
    }

    fn next_message_id(&self, sender: ClientId) -> i64 {
        let handle = self.registry.lookup(sender);
        let serial = handle.as_ref().and_then(|h| h.next_sent_message_serial());
        match serial {
            Some(serial) => (i64::from(sender) << 32) | i64::from(serial),
            None => self.message_id_sequence.fetch_sub(1, Ordering::Relaxed),
        }
    }

    fn send_internal(
        &self,
        sender: ClientId,
        address: &Address,
        style: &MessageStyle,
        message: TaggedMessage,
        priority: Priority,
        with_token: bool,
    ) -> (SendStatus, Option<CancellationToken>) {
        let send_time = Utc::now();
        let snapshot = self.registry.clients_snapshot();

        match self
            .registry
            .check_sender(&snapshot, sender, message.message_type)
        {
            RegistrationState::NotConnected => return (SendStatus::SenderNotConnected, None),
            RegistrationState::NotRegistered => {
                return (SendStatus::SenderNotRegisteredForMessageType, None)
            }
            RegistrationState::Registered => {}
        }

        let receivers = match self.registry.finalize_receivers(
            &snapshot,
            address,
            style,
            message.message_type,
        ) {
            Ok(receivers) => receivers,
            Err(status) => return (status, None),
        };

        let message_id = self.next_message_id(sender);
        let cancel_flag = if with_token {
            SharedBool::new(false)
        } else {
            SharedBool::invalid()
        };
        let queued = QueuedMessage::new(
            sender,
            priority,
            send_time,
            style.expiration_time,
            message_id,
            cancel_flag.clone(),
            message,
        );

        // Registry validation is complete; from here the send cannot fail.
        // Recipients that disconnected since the snapshot was taken get their
        // push absorbed by their already drained and closed queue.
        for &receiver in &receivers {
            if let Some(handle) = snapshot.get(&receiver) {
                handle.incoming().push(queued.clone());
            }
        }
        debug!(
            sender = sender,
            message_type = queued.message_type(),
            receivers = receivers.len(),
            message_id = message_id,
            "bus send accepted"
        );

        let token = with_token.then(|| {
            let token = CancellationToken::new(cancel_flag, message_id);
            if let Some(handle) = snapshot.get(&sender) {
                handle.remember_cancel_token(token.clone());
            }
            token
        });
        (SendStatus::Ok, token)
    }

    /// Server-side cancellation by message id, for remote clients that only
    /// ship ids over the wire.
    pub(crate) fn cancel_by_message_id(&self, sender: ClientId, message_id: i64) {
        if let Some(handle) = self.registry.lookup(sender) {
            if let Some(token) = handle.take_cancel_token(message_id) {
                token.set_cancelled();
            }
        }
    }
}

#[async_trait]
impl MessageBus for MemoryMessageBus {
    async fn connect(&self) -> BusResult<ClientId> {
        let client = self.registry.insert_client();
        debug!(client = client, "bus client connected");
        Ok(client)
    }

    async fn disconnect(&self, client: ClientId) -> BusResult<bool> {
        let removed = self.registry.remove_client(client).is_some();
        debug!(client = client, removed = removed, "bus client disconnected");
        Ok(removed)
    }

    async fn register_client_as_sender(
        &self,
        client: ClientId,
        message_type: MessageTypeId,
    ) -> BusResult<bool> {
        Ok(self.registry.register_sender(client, message_type))
    }

    async fn register_client_as_receiver(
        &self,
        client: ClientId,
        message_type: MessageTypeId,
    ) -> BusResult<bool> {
        Ok(self.registry.register_receiver(client, message_type))
    }

    async fn send(
        &self,
        sender: ClientId,
        address: &Address,
        style: &MessageStyle,
        message: TaggedMessage,
        priority: Priority,
    ) -> BusResult<SendStatus> {
        let (status, _) = self.send_internal(sender, address, style, message, priority, false);
        Ok(status)
    }

    async fn send_cancellable(
        &self,
        sender: ClientId,
        address: &Address,
        style: &MessageStyle,
        message: TaggedMessage,
        priority: Priority,
    ) -> BusResult<(SendStatus, Option<CancellationToken>)> {
        Ok(self.send_internal(sender, address, style, message, priority, true))
    }

    async fn cancel_message(&self, _sender: ClientId, token: &CancellationToken) -> BusResult<()> {
        token.set_cancelled();
        Ok(())
    }

    async fn receive_batch(
        &self,
        receiver: ClientId,
        min_priority: Priority,
        max_messages: usize,
        delete_immediately: bool,
    ) -> BusResult<Vec<AnnotatedMessage>> {
        let handle = self
            .registry
            .lookup(receiver)
            .ok_or(BusError::NotConnected { client: receiver })?;
        let batch = handle
            .incoming()
            .pop(min_priority, max_messages, delete_immediately)
            .await;
        if batch.is_empty() {
            // The queue only yields an empty batch when drained by a
            // concurrent disconnect.
            return Err(BusError::NotConnected { client: receiver });
        }
        Ok(batch)
    }

    async fn try_receive_batch(
        &self,
        receiver: ClientId,
        min_priority: Priority,
        max_messages: usize,
        delete_immediately: bool,
    ) -> BusResult<Vec<AnnotatedMessage>> {
        let handle = self
            .registry
            .lookup(receiver)
            .ok_or(BusError::NotConnected { client: receiver })?;
        Ok(handle
            .incoming()
            .pop_if_available(min_priority, max_messages, delete_immediately))
    }

    async fn delete_messages(&self, receiver: ClientId, message_ids: &[i64]) -> BusResult<()> {
        let handle = self
            .registry
            .lookup(receiver)
            .ok_or(BusError::NotConnected { client: receiver })?;
        handle.incoming().delete_by_id(message_ids);
        Ok(())
    }

    async fn count_queued_messages(&self, receiver: ClientId) -> BusResult<usize> {
        let handle = self
            .registry
            .lookup(receiver)
            .ok_or(BusError::NotConnected { client: receiver })?;
        Ok(handle.incoming().len())
    }
}
