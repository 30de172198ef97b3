//! Integration tests for the in-process message bus.
//!
//! Covers the registry gating rules, priority-ordered delivery, expiration,
//! cancellation, deferred deletion, and the disconnect race.

use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;

use dispatch_core::bus::{
    Address, MemoryMessageBus, MessageBus, MessageStyle, Priority, SendStatus, TaggedMessage,
};

const TEST_TYPE: u32 = 7;

async fn sender_client(bus: &MemoryMessageBus, message_type: u32) -> u32 {
    let client = bus.connect().await.unwrap();
    assert!(bus
        .register_client_as_sender(client, message_type)
        .await
        .unwrap());
    client
}

async fn receiver_client(bus: &MemoryMessageBus, message_type: u32) -> u32 {
    let client = bus.connect().await.unwrap();
    assert!(bus
        .register_client_as_receiver(client, message_type)
        .await
        .unwrap());
    client
}

async fn send_with_priority(
    bus: &MemoryMessageBus,
    sender: u32,
    receiver: u32,
    payload: Vec<u8>,
    priority: Priority,
) -> SendStatus {
    bus.send(
        sender,
        &Address::to(receiver),
        &MessageStyle::default(),
        TaggedMessage::new(TEST_TYPE, payload),
        priority,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_send_requires_both_ends_registered() {
    let bus = MemoryMessageBus::new();
    let sender = bus.connect().await.unwrap();
    let receiver = bus.connect().await.unwrap();

    // Sender not registered for the type.
    let status = bus
        .send(
            sender,
            &Address::to(receiver),
            &MessageStyle::default(),
            TaggedMessage::new(TEST_TYPE, vec![1]),
            0,
        )
        .await
        .unwrap();
    assert_eq!(status, SendStatus::SenderNotRegisteredForMessageType);

    // Connected but unregistered explicit recipient fails the send.
    bus.register_client_as_sender(sender, TEST_TYPE)
        .await
        .unwrap();
    let status = send_with_priority(&bus, sender, receiver, vec![1], 0).await;
    assert_eq!(status, SendStatus::ReceiverNotRegisteredForMessageType);

    // Registering the receiver fixes it.
    bus.register_client_as_receiver(receiver, TEST_TYPE)
        .await
        .unwrap();
    let status = send_with_priority(&bus, sender, receiver, vec![1], 0).await;
    assert_eq!(status, SendStatus::Ok);
}

#[tokio::test]
async fn test_unconnected_sender_is_rejected() {
    let bus = MemoryMessageBus::new();
    let receiver = receiver_client(&bus, TEST_TYPE).await;
    let status = bus
        .send(
            9999,
            &Address::to(receiver),
            &MessageStyle::default(),
            TaggedMessage::new(TEST_TYPE, vec![]),
            0,
        )
        .await
        .unwrap();
    assert_eq!(status, SendStatus::SenderNotConnected);
}

#[tokio::test]
async fn test_broadcast_reaches_every_registered_receiver() {
    let bus = MemoryMessageBus::new();
    let sender = sender_client(&bus, TEST_TYPE).await;
    let first = receiver_client(&bus, TEST_TYPE).await;
    let second = receiver_client(&bus, TEST_TYPE).await;

    let status = bus
        .send(
            sender,
            &Address::all(),
            &MessageStyle::broadcast(),
            TaggedMessage::new(TEST_TYPE, b"hello".to_vec()),
            0,
        )
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Ok);

    for receiver in [first, second] {
        let envelope = bus.receive(receiver, 0, true).await.unwrap();
        assert_eq!(envelope.message.payload, b"hello".to_vec());
        assert_eq!(envelope.sender, sender);
    }
}

#[tokio::test]
async fn test_non_broadcast_multi_recipient_picks_exactly_one() {
    let bus = MemoryMessageBus::new();
    let sender = sender_client(&bus, TEST_TYPE).await;
    let first = receiver_client(&bus, TEST_TYPE).await;
    let second = receiver_client(&bus, TEST_TYPE).await;

    let mut address = Address::to(first);
    address.add_recipient(second);
    let status = bus
        .send(
            sender,
            &address,
            &MessageStyle::default(),
            TaggedMessage::new(TEST_TYPE, vec![42]),
            0,
        )
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Ok);

    let first_count = bus.count_queued_messages(first).await.unwrap();
    let second_count = bus.count_queued_messages(second).await.unwrap();
    assert_eq!(first_count + second_count, 1);
}

#[tokio::test]
async fn test_expired_messages_are_never_delivered() {
    let bus = MemoryMessageBus::new();
    let sender = sender_client(&bus, TEST_TYPE).await;
    let receiver = receiver_client(&bus, TEST_TYPE).await;

    let stale_style = MessageStyle::default().with_expiration(Utc::now() - Duration::seconds(5));
    let status = bus
        .send(
            sender,
            &Address::to(receiver),
            &stale_style,
            TaggedMessage::new(TEST_TYPE, b"stale".to_vec()),
            200,
        )
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Ok);
    send_with_priority(&bus, sender, receiver, b"fresh".to_vec(), 0).await;

    let envelope = bus.receive(receiver, 0, true).await.unwrap();
    assert_eq!(envelope.message.payload, b"fresh".to_vec());
    assert!(bus
        .try_receive_batch(receiver, 0, 0, true)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_cancelled_message_is_skipped_and_cancel_is_idempotent() {
    let bus = MemoryMessageBus::new();
    let sender = sender_client(&bus, TEST_TYPE).await;
    let receiver = receiver_client(&bus, TEST_TYPE).await;

    let (status, token) = bus
        .send_cancellable(
            sender,
            &Address::to(receiver),
            &MessageStyle::default(),
            TaggedMessage::new(TEST_TYPE, b"doomed".to_vec()),
            0,
        )
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Ok);
    let token = token.unwrap();

    bus.cancel_message(sender, &token).await.unwrap();
    // Cancelling again is a no-op.
    bus.cancel_message(sender, &token).await.unwrap();

    assert!(bus
        .try_receive_batch(receiver, 0, 0, true)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_deferred_deletion_keeps_message_until_deleted() {
    let bus = MemoryMessageBus::new();
    let sender = sender_client(&bus, TEST_TYPE).await;
    let receiver = receiver_client(&bus, TEST_TYPE).await;

    send_with_priority(&bus, sender, receiver, b"keep".to_vec(), 0).await;
    let batch = bus
        .try_receive_batch(receiver, 0, 0, false)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);

    // Still counted until explicitly deleted.
    assert_eq!(bus.count_queued_messages(receiver).await.unwrap(), 1);
    bus.delete_messages(receiver, &[batch[0].message_id])
        .await
        .unwrap();
    assert_eq!(bus.count_queued_messages(receiver).await.unwrap(), 0);
}

#[tokio::test]
async fn test_send_to_only_disconnected_recipient_reports_no_receivers() {
    let bus = MemoryMessageBus::new();
    let sender = sender_client(&bus, TEST_TYPE).await;
    let receiver = receiver_client(&bus, TEST_TYPE).await;

    assert!(bus.disconnect(receiver).await.unwrap());
    let status = send_with_priority(&bus, sender, receiver, vec![1], 0).await;
    assert_eq!(status, SendStatus::NoReceivers);
}

#[tokio::test]
async fn test_disconnect_races_resolve_to_recipient_absent() {
    let bus = Arc::new(MemoryMessageBus::new());
    let sender = sender_client(&bus, TEST_TYPE).await;
    let receiver = receiver_client(&bus, TEST_TYPE).await;

    let bus_for_sender = Arc::clone(&bus);
    let send_task = tokio::spawn(async move {
        let mut statuses = Vec::new();
        for index in 0..200u8 {
            let status = bus_for_sender
                .send(
                    sender,
                    &Address::to(receiver),
                    &MessageStyle::default(),
                    TaggedMessage::new(TEST_TYPE, vec![index]),
                    0,
                )
                .await
                .unwrap();
            statuses.push(status);
        }
        statuses
    });

    let bus_for_disconnect = Arc::clone(&bus);
    let disconnect_task =
        tokio::spawn(async move { bus_for_disconnect.disconnect(receiver).await.unwrap() });

    let statuses = send_task.await.unwrap();
    assert!(disconnect_task.await.unwrap());

    // Every send resolved to either delivery or a clean absent-recipient
    // status; nothing panicked or partially delivered.
    for status in statuses {
        assert!(matches!(status, SendStatus::Ok | SendStatus::NoReceivers));
    }
}

#[tokio::test]
async fn test_min_priority_receive_leaves_lower_priority_queued() {
    let bus = MemoryMessageBus::new();
    let sender = sender_client(&bus, TEST_TYPE).await;
    let receiver = receiver_client(&bus, TEST_TYPE).await;

    send_with_priority(&bus, sender, receiver, b"low".to_vec(), 10).await;
    send_with_priority(&bus, sender, receiver, b"high".to_vec(), 200).await;

    let batch = bus
        .try_receive_batch(receiver, 100, 0, true)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message.payload, b"high".to_vec());
    assert_eq!(bus.count_queued_messages(receiver).await.unwrap(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Delivery follows priority descending, then send order within a
    /// priority, for any interleaving of priorities.
    #[test]
    fn prop_delivery_order_is_priority_then_fifo(
        priorities in proptest::collection::vec(0u8..=255, 1..32)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let bus = MemoryMessageBus::new();
            let sender = sender_client(&bus, TEST_TYPE).await;
            let receiver = receiver_client(&bus, TEST_TYPE).await;

            for (index, &priority) in priorities.iter().enumerate() {
                let status = send_with_priority(
                    &bus,
                    sender,
                    receiver,
                    vec![index as u8],
                    priority,
                )
                .await;
                assert_eq!(status, SendStatus::Ok);
            }

            let batch = bus.try_receive_batch(receiver, 0, 0, true).await.unwrap();
            assert_eq!(batch.len(), priorities.len());

            let mut expected: Vec<usize> = (0..priorities.len()).collect();
            expected.sort_by(|&a, &b| {
                priorities[b].cmp(&priorities[a]).then(a.cmp(&b))
            });
            let delivered: Vec<usize> = batch
                .iter()
                .map(|envelope| envelope.message.payload[0] as usize)
                .collect();
            assert_eq!(delivered, expected);
        });
    }
}
