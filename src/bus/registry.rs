//! # Client Registry and Receiver Directory
//!
//! Maps connected clients to their registered message-type sets and private
//! incoming queues, and message types to the set of clients registered to
//! receive them. Structural changes (connect, disconnect, first registration
//! of a type) go through [`Rcu`] snapshots so they never block concurrent
//! sends and receives; a send always operates against the registry snapshot
//! taken when it started, which is what makes disconnect races resolve to
//! "recipient absent" instead of a fault.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::bus::cancellation::CancellationToken;
use crate::bus::queue::ReceiverQueue;
use crate::bus::rcu::Rcu;
use crate::bus::types::{Address, ClientId, MessageStyle, MessageTypeId, SendStatus};

/// Per-client state owned by the registry. Referenced (never owned) by
/// in-flight sends and receives through `Arc` snapshots.
#[derive(Debug)]
pub struct ClientHandle {
    sendable_types: RwLock<HashSet<MessageTypeId>>,
    receivable_types: RwLock<HashSet<MessageTypeId>>,
    incoming: ReceiverQueue,
    sent_message_counter: AtomicU32,
    /// Cancellation tokens for this client's cancellable sends, by message
    /// id. Used by the bus server, where the remote canceller only holds an
    /// id, not the shared flag.
    send_cancel_tokens: Mutex<HashMap<i64, CancellationToken>>,
}

impl ClientHandle {
    fn new() -> Self {
        Self {
            sendable_types: RwLock::new(HashSet::new()),
            receivable_types: RwLock::new(HashSet::new()),
            incoming: ReceiverQueue::new(),
            sent_message_counter: AtomicU32::new(0),
            send_cancel_tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn incoming(&self) -> &ReceiverQueue {
        &self.incoming
    }

    pub fn can_send(&self, message_type: MessageTypeId) -> bool {
        self.sendable_types.read().contains(&message_type)
    }

    pub fn can_receive(&self, message_type: MessageTypeId) -> bool {
        self.receivable_types.read().contains(&message_type)
    }

    /// Next value of the per-sender message counter, or `None` once the
    /// 32-bit space is exhausted (the bus then falls back to its global
    /// sequence). The counter saturates rather than wraps, so exhaustion is
    /// permanent and serials are never reissued.
    pub fn next_sent_message_serial(&self) -> Option<u32> {
        let mut current = self.sent_message_counter.load(Ordering::Relaxed);
        loop {
            if current == u32::MAX {
                return None;
            }
            match self.sent_message_counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current + 1),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn remember_cancel_token(&self, token: CancellationToken) {
        let mut tokens = self.send_cancel_tokens.lock();
        // Opportunistically purge flags whose messages are already settled.
        tokens.retain(|_, existing| !existing.cancel_flag().get());
        tokens.insert(token.message_id(), token);
    }

    pub fn take_cancel_token(&self, message_id: i64) -> Option<CancellationToken> {
        self.send_cancel_tokens.lock().remove(&message_id)
    }
}

/// Result of checking whether a client may send or receive a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    NotConnected,
    NotRegistered,
    Registered,
}

type ClientMap = HashMap<ClientId, Arc<ClientHandle>>;
type ReceiverSet = Arc<RwLock<HashSet<ClientId>>>;
type ReceiverDirectoryMap = HashMap<MessageTypeId, ReceiverSet>;

/// Snapshot-read registry of connected clients and type receivers.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Rcu<ClientMap>,
    receiver_directory: Rcu<ReceiverDirectoryMap>,
    client_id_sequence: AtomicU32,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh handle and returns its id. Ids are monotonically
    /// increasing and never reused.
    pub fn insert_client(&self) -> ClientId {
        let client = self.client_id_sequence.fetch_add(1, Ordering::Relaxed);
        self.clients.update(|clients| {
            clients.insert(client, Arc::new(ClientHandle::new()));
        });
        client
    }

    /// Removes a client, scrubs it from every receiver-directory entry, and
    /// drains its queue. Returns the removed handle, or `None` for an
    /// unknown id.
    pub fn remove_client(&self, client: ClientId) -> Option<Arc<ClientHandle>> {
        let removed = self.clients.update(|clients| clients.remove(&client))?;
        let directory = self.receiver_directory.snapshot();
        for receivers in directory.values() {
            receivers.write().remove(&client);
        }
        removed.incoming().drain();
        Some(removed)
    }

    pub fn lookup(&self, client: ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.snapshot().get(&client).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.clients.snapshot().len()
    }

    pub fn check_sender(
        &self,
        snapshot: &ClientMap,
        client: ClientId,
        message_type: MessageTypeId,
    ) -> RegistrationState {
        match snapshot.get(&client) {
            None => RegistrationState::NotConnected,
            Some(handle) if handle.can_send(message_type) => RegistrationState::Registered,
            Some(_) => RegistrationState::NotRegistered,
        }
    }

    pub fn check_receiver(
        &self,
        snapshot: &ClientMap,
        client: ClientId,
        message_type: MessageTypeId,
    ) -> RegistrationState {
        match snapshot.get(&client) {
            None => RegistrationState::NotConnected,
            Some(handle) if handle.can_receive(message_type) => RegistrationState::Registered,
            Some(_) => RegistrationState::NotRegistered,
        }
    }

    /// Registers `client` as a sender of `message_type`. False when not
    /// connected or already registered.
    pub fn register_sender(&self, client: ClientId, message_type: MessageTypeId) -> bool {
        let snapshot = self.clients.snapshot();
        match snapshot.get(&client) {
            None => false,
            Some(handle) => handle.sendable_types.write().insert(message_type),
        }
    }

    /// Registers `client` as a receiver of `message_type`, inserting it into
    /// the global receiver-directory entry for that type.
    pub fn register_receiver(&self, client: ClientId, message_type: MessageTypeId) -> bool {
        let snapshot = self.clients.snapshot();
        let Some(handle) = snapshot.get(&client) else {
            return false;
        };
        if !handle.receivable_types.write().insert(message_type) {
            return false;
        }
        self.receivers_for_type(message_type).write().insert(client);
        true
    }

    /// The live receiver set for a message type, creating the directory
    /// entry on first use.
    fn receivers_for_type(&self, message_type: MessageTypeId) -> ReceiverSet {
        if let Some(receivers) = self.receiver_directory.snapshot().get(&message_type) {
            return Arc::clone(receivers);
        }
        self.receiver_directory.update(|directory| {
            Arc::clone(
                directory
                    .entry(message_type)
                    .or_insert_with(|| Arc::new(RwLock::new(HashSet::new()))),
            )
        })
    }

    /// Resolves an address and style into the concrete recipient set for a
    /// send, against the given clients snapshot.
    ///
    /// Broadcast-all uses the live receiver directory for the type. Explicit
    /// recipients are each checked: a connected-but-unregistered recipient
    /// fails the whole call; a recipient that is simply not connected is
    /// silently excluded. A resolved set larger than one with a
    /// non-broadcast style collapses to a single uniformly random recipient.
    pub fn finalize_receivers(
        &self,
        snapshot: &ClientMap,
        address: &Address,
        style: &MessageStyle,
        message_type: MessageTypeId,
    ) -> Result<Vec<ClientId>, SendStatus> {
        let mut receivers = Vec::new();
        if address.is_send_to_all() {
            if let Some(registered) = self.receiver_directory.snapshot().get(&message_type) {
                receivers.extend(registered.read().iter().copied());
            }
        } else {
            receivers.reserve(address.explicit_recipients().len());
            for &recipient in address.explicit_recipients() {
                match self.check_receiver(snapshot, recipient, message_type) {
                    RegistrationState::NotConnected => {}
                    RegistrationState::NotRegistered => {
                        return Err(SendStatus::ReceiverNotRegisteredForMessageType)
                    }
                    RegistrationState::Registered => receivers.push(recipient),
                }
            }
        }
        if receivers.is_empty() {
            return Err(SendStatus::NoReceivers);
        }
        if receivers.len() > 1 && !style.broadcast {
            let chosen = receivers[rand::thread_rng().gen_range(0..receivers.len())];
            receivers.clear();
            receivers.push(chosen);
        }
        Ok(receivers)
    }

    pub fn clients_snapshot(&self) -> Arc<ClientMap> {
        self.clients.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_monotonic_and_never_reused() {
        let registry = ClientRegistry::new();
        let first = registry.insert_client();
        let second = registry.insert_client();
        assert!(second > first);

        assert!(registry.remove_client(first).is_some());
        let third = registry.insert_client();
        assert!(third > second);
    }

    #[test]
    fn test_serial_exhaustion_is_sticky() {
        let handle = ClientHandle::new();
        assert_eq!(handle.next_sent_message_serial(), Some(1));

        handle
            .sent_message_counter
            .store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(handle.next_sent_message_serial(), Some(u32::MAX));
        // Once exhausted, the counter never wraps back into issued serials.
        assert_eq!(handle.next_sent_message_serial(), None);
        assert_eq!(handle.next_sent_message_serial(), None);
    }

    #[test]
    fn test_register_sender_requires_connection_and_is_single_shot() {
        let registry = ClientRegistry::new();
        assert!(!registry.register_sender(42, 0));

        let client = registry.insert_client();
        assert!(registry.register_sender(client, 0));
        assert!(!registry.register_sender(client, 0));
    }

    #[test]
    fn test_receiver_directory_tracks_registration_and_disconnect() {
        let registry = ClientRegistry::new();
        let a = registry.insert_client();
        let b = registry.insert_client();
        assert!(registry.register_receiver(a, 5));
        assert!(registry.register_receiver(b, 5));

        let snapshot = registry.clients_snapshot();
        let receivers = registry
            .finalize_receivers(&snapshot, &Address::all(), &MessageStyle::broadcast(), 5)
            .unwrap();
        assert_eq!(receivers.len(), 2);

        registry.remove_client(a);
        let snapshot = registry.clients_snapshot();
        let receivers = registry
            .finalize_receivers(&snapshot, &Address::all(), &MessageStyle::broadcast(), 5)
            .unwrap();
        assert_eq!(receivers, vec![b]);
    }

    #[test]
    fn test_explicit_unregistered_recipient_fails_whole_send() {
        let registry = ClientRegistry::new();
        let registered = registry.insert_client();
        let unregistered = registry.insert_client();
        registry.register_receiver(registered, 9);

        let mut address = Address::to(registered);
        address.add_recipient(unregistered);
        let snapshot = registry.clients_snapshot();
        let result = registry.finalize_receivers(
            &snapshot,
            &address,
            &MessageStyle::broadcast(),
            9,
        );
        assert_eq!(
            result.unwrap_err(),
            SendStatus::ReceiverNotRegisteredForMessageType
        );
    }

    #[test]
    fn test_disconnected_explicit_recipient_silently_excluded() {
        let registry = ClientRegistry::new();
        let registered = registry.insert_client();
        registry.register_receiver(registered, 9);

        let mut address = Address::to(registered);
        address.add_recipient(10_000);
        let snapshot = registry.clients_snapshot();
        let receivers = registry
            .finalize_receivers(&snapshot, &address, &MessageStyle::broadcast(), 9)
            .unwrap();
        assert_eq!(receivers, vec![registered]);
    }

    #[test]
    fn test_non_broadcast_collapses_to_single_recipient() {
        let registry = ClientRegistry::new();
        let mut known = HashSet::new();
        for _ in 0..4 {
            let client = registry.insert_client();
            registry.register_receiver(client, 1);
            known.insert(client);
        }
        let snapshot = registry.clients_snapshot();
        for _ in 0..16 {
            let receivers = registry
                .finalize_receivers(&snapshot, &Address::all(), &MessageStyle::default(), 1)
                .unwrap();
            assert_eq!(receivers.len(), 1);
            assert!(known.contains(&receivers[0]));
        }
    }
}
