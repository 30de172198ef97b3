//! Shared cancel flags and the sender-facing cancellation handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A reference-counted boolean flag shared between a sender's cancellation
/// token and the queued copies of the message it refers to.
///
/// Setting the flag is idempotent; exactly one of delivery, expiry, or
/// cancellation wins for a given message, detected by whichever code path
/// observes the flag first. The flag's storage is freed when the last token
/// copy and the last queue entry referencing it are both gone.
#[derive(Debug, Clone, Default)]
pub struct SharedBool {
    flag: Option<Arc<AtomicBool>>,
}

impl SharedBool {
    pub fn new(initial: bool) -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(initial))),
        }
    }

    /// A handle that references no flag. `get()` always reports false.
    pub fn invalid() -> Self {
        Self { flag: None }
    }

    pub fn is_valid(&self) -> bool {
        self.flag.is_some()
    }

    pub fn get(&self) -> bool {
        self.flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Sets the flag. A no-op when already set or when the handle is invalid.
    pub fn set(&self, value: bool) {
        if let Some(flag) = &self.flag {
            flag.store(value, Ordering::Relaxed);
        }
    }
}

/// Opaque, copyable handle allowing a sender to retract a previously sent
/// message before or at delivery.
///
/// Remains safely copyable and droppable after the referenced message has
/// been delivered, expired, or already cancelled; cancelling at that point is
/// a no-op.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancel_flag: SharedBool,
    message_id: i64,
}

impl CancellationToken {
    pub(crate) fn new(cancel_flag: SharedBool, message_id: i64) -> Self {
        Self {
            cancel_flag,
            message_id,
        }
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    pub(crate) fn cancel_flag(&self) -> &SharedBool {
        &self.cancel_flag
    }

    pub(crate) fn set_cancelled(&self) {
        self.cancel_flag.set(true);
    }
}
