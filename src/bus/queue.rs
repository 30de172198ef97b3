//! # Per-Receiver Priority Queue
//!
//! An ordered multiset of queued messages ranked by the total delivery order
//! (priority, deadline, send time, id), with suspending pop, non-blocking
//! pop, and out-of-order deletion by message id. The ordered-map variant is
//! used (rather than a plain heap) because delete-by-id after a
//! non-destructive pop is a first-class operation here.
//!
//! Expired and cancelled messages are discarded lazily: every push and pop
//! sweeps dead entries from the head before doing anything else, bounding
//! staleness to "next touch". There is no background reaper.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::bus::queued_message::{DeliveryOrder, QueuedMessage};
use crate::bus::types::{AnnotatedMessage, Priority};

/// Sentinel above every representable priority; a stored minimum-waiting
/// priority of this value means no waiter needs a wakeup.
const ABOVE_MAX_PRIORITY: u16 = 256;

#[derive(Debug, Default)]
struct QueueInner {
    queue: BTreeMap<DeliveryOrder, QueuedMessage>,
    /// Popped-but-not-deleted messages, by id. Entries stay in `queue` (and
    /// may be redelivered) until explicitly deleted.
    checked_out: HashMap<i64, DeliveryOrder>,
    minimum_waiting_priority: u16,
    waiters: usize,
    closed: bool,
}

impl QueueInner {
    /// Sweeps expired or cancelled messages off the head of the queue.
    fn discard_dead(&mut self) {
        while let Some((order, message)) = self.queue.iter().next() {
            if !message.expired_or_cancelled() {
                break;
            }
            let order = order.clone();
            let message_id = message.message_id();
            self.queue.remove(&order);
            self.checked_out.remove(&message_id);
        }
    }

    fn head_satisfies(&self, min_priority: Priority) -> bool {
        self.queue
            .values()
            .next()
            .map(|message| message.priority() >= min_priority)
            .unwrap_or(false)
    }

    /// Collects up to `max_messages` qualifying messages in delivery order
    /// (`max_messages == 0` means no limit), erasing dead entries found along
    /// the way.
    fn collect(
        &mut self,
        min_priority: Priority,
        max_messages: usize,
        delete_immediately: bool,
    ) -> Vec<AnnotatedMessage> {
        let mut popped = Vec::new();
        let mut remove = Vec::new();
        for (order, message) in &self.queue {
            if message.priority() < min_priority {
                break;
            }
            if message.expired_or_cancelled() {
                remove.push((order.clone(), message.message_id()));
                continue;
            }
            if max_messages != 0 && popped.len() == max_messages {
                break;
            }
            popped.push(message.to_annotated());
            if delete_immediately {
                remove.push((order.clone(), message.message_id()));
            } else {
                self.checked_out
                    .insert(message.message_id(), order.clone());
            }
        }
        for (order, message_id) in remove {
            self.queue.remove(&order);
            self.checked_out.remove(&message_id);
        }
        popped
    }
}

/// Thread-safe incoming-message queue owned by a single bus client.
#[derive(Debug, Default)]
pub struct ReceiverQueue {
    inner: Mutex<QueueInner>,
    message_available: Notify,
    queue_length: AtomicUsize,
}

impl ReceiverQueue {
    pub fn new() -> Self {
        let queue = Self::default();
        queue.inner.lock().minimum_waiting_priority = ABOVE_MAX_PRIORITY;
        queue
    }

    /// Inserts a message, waking waiters whose priority threshold it meets.
    /// Waiters re-check their own threshold on wake.
    pub fn push(&self, message: QueuedMessage) {
        let signal;
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.discard_dead();
            signal = u16::from(message.priority()) >= inner.minimum_waiting_priority;
            inner.queue.insert(message.delivery_order(), message);
            self.queue_length.store(inner.queue.len(), Ordering::Relaxed);
        }
        if signal {
            self.message_available.notify_waiters();
        }
    }

    /// Suspends until at least one undelivered, unexpired, uncancelled
    /// message with priority at or above `min_priority` is available, then
    /// returns `1..=max_messages` such messages in delivery order
    /// (`max_messages == 0` drains everything currently qualifying).
    ///
    /// Returns an empty vector only if the queue is closed by `drain()`.
    pub async fn pop(
        &self,
        min_priority: Priority,
        max_messages: usize,
        delete_immediately: bool,
    ) -> Vec<AnnotatedMessage> {
        loop {
            let notified = self.message_available.notified();
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Vec::new();
                }
                inner.discard_dead();
                if inner.head_satisfies(min_priority) {
                    let popped = inner.collect(min_priority, max_messages, delete_immediately);
                    if inner.waiters == 0 {
                        inner.minimum_waiting_priority = ABOVE_MAX_PRIORITY;
                    }
                    self.queue_length.store(inner.queue.len(), Ordering::Relaxed);
                    return popped;
                }
                inner.minimum_waiting_priority =
                    inner.minimum_waiting_priority.min(u16::from(min_priority));
                inner.waiters += 1;
            }
            notified.await;
            self.inner.lock().waiters -= 1;
        }
    }

    /// Like `pop` but never suspends; returns an empty vector when nothing
    /// currently qualifies.
    pub fn pop_if_available(
        &self,
        min_priority: Priority,
        max_messages: usize,
        delete_immediately: bool,
    ) -> Vec<AnnotatedMessage> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Vec::new();
        }
        inner.discard_dead();
        let popped = inner.collect(min_priority, max_messages, delete_immediately);
        self.queue_length.store(inner.queue.len(), Ordering::Relaxed);
        popped
    }

    /// Removes previously popped-but-kept messages. A no-op for ids that were
    /// never checked out or were already removed.
    pub fn delete_by_id(&self, message_ids: &[i64]) {
        let mut inner = self.inner.lock();
        for message_id in message_ids {
            if let Some(order) = inner.checked_out.remove(message_id) {
                inner.queue.remove(&order);
            }
        }
        self.queue_length.store(inner.queue.len(), Ordering::Relaxed);
    }

    /// Empties and closes the queue (client disconnect), waking any
    /// suspended receivers. Returns the number of non-cancelled messages
    /// removed, for external cleanup accounting.
    pub fn drain(&self) -> usize {
        let removed;
        {
            let mut inner = self.inner.lock();
            removed = inner
                .queue
                .values()
                .filter(|message| !message.cancelled())
                .count();
            inner.queue.clear();
            inner.checked_out.clear();
            inner.closed = true;
            self.queue_length.store(0, Ordering::Relaxed);
        }
        self.message_available.notify_waiters();
        removed
    }

    pub fn len(&self) -> usize {
        self.queue_length.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::cancellation::SharedBool;
    use crate::bus::types::TaggedMessage;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn message(priority: Priority, message_id: i64) -> QueuedMessage {
        QueuedMessage::new(
            1,
            priority,
            Utc::now(),
            None,
            message_id,
            SharedBool::invalid(),
            TaggedMessage::new(0, vec![message_id as u8]),
        )
    }

    #[tokio::test]
    async fn test_pop_returns_highest_priority_first() {
        let queue = ReceiverQueue::new();
        queue.push(message(5, 1));
        queue.push(message(200, 2));
        queue.push(message(50, 3));

        let popped = queue.pop(0, 0, true).await;
        let priorities: Vec<i64> = popped.iter().map(|m| m.message_id).collect();
        assert_eq!(priorities, vec![2, 3, 1]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_respects_minimum_priority_and_max_count() {
        let queue = ReceiverQueue::new();
        for id in 0..4 {
            queue.push(message(100, id));
        }
        queue.push(message(3, 99));

        let popped = queue.pop(10, 2, true).await;
        assert_eq!(popped.len(), 2);
        // The low-priority message never qualifies at this threshold.
        let rest = queue.pop_if_available(10, 0, true);
        assert_eq!(rest.len(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_suspends_until_qualifying_push() {
        let queue = Arc::new(ReceiverQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(100, 1, true).await })
        };
        // A push below the waiter's threshold must not satisfy it.
        queue.push(message(10, 1));
        tokio::task::yield_now().await;
        assert!(!popper.is_finished());

        queue.push(message(150, 2));
        let popped = popper.await.unwrap();
        assert_eq!(popped[0].message_id, 2);
    }

    #[tokio::test]
    async fn test_expired_message_never_delivered() {
        let queue = ReceiverQueue::new();
        let dead = QueuedMessage::new(
            1,
            255,
            Utc::now(),
            Some(Utc::now() - Duration::seconds(1)),
            7,
            SharedBool::invalid(),
            TaggedMessage::new(0, vec![]),
        );
        queue.push(dead);
        queue.push(message(1, 8));

        let popped = queue.pop(0, 0, true).await;
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].message_id, 8);
    }

    #[tokio::test]
    async fn test_cancelled_message_skipped_and_erased() {
        let queue = ReceiverQueue::new();
        let flag = SharedBool::new(false);
        queue.push(QueuedMessage::new(
            1,
            200,
            Utc::now(),
            None,
            7,
            flag.clone(),
            TaggedMessage::new(0, vec![]),
        ));
        queue.push(message(10, 8));
        flag.set(true);

        let popped = queue.pop(0, 0, true).await;
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].message_id, 8);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_checked_out_message_deleted_by_id() {
        let queue = ReceiverQueue::new();
        queue.push(message(10, 1));

        let popped = queue.pop(0, 1, false).await;
        assert_eq!(popped.len(), 1);
        assert_eq!(queue.len(), 1);

        queue.delete_by_id(&[1]);
        assert!(queue.is_empty());
        // Deleting again is a no-op.
        queue.delete_by_id(&[1]);
    }

    #[tokio::test]
    async fn test_drain_wakes_blocked_popper() {
        let queue = Arc::new(ReceiverQueue::new());
        queue.push(message(10, 1));
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(0, 1, true).await })
        };
        let _ = popper.await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(0, 1, true).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(queue.drain(), 0);
        assert!(waiter.await.unwrap().is_empty());
    }
}
