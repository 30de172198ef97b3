#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dispatch Core
//!
//! Distributed work-dispatch and message-bus core for parallel query
//! execution: a typed, priority-ordered, at-most-once, optionally
//! cancellable message bus, and the Foreman/Shiftboss/Worker pipeline that
//! schedules work orders over it.
//!
//! ## Architecture
//!
//! Components never share mutable application state; they communicate
//! exclusively through the bus. A Foreman admits workloads and streams work
//! orders to per-node Shiftbosses, each of which places orders on its local
//! worker tasks through a pluggable selection policy bounded by per-worker
//! capacity. Completions flow back up the same path.
//!
//! The bus comes in two interchangeable flavors behind one trait: an
//! in-process implementation and a TCP client/server pair hosting the same
//! registry and queue logic for multi-process deployments.
//!
//! ## Module Organization
//!
//! - [`bus`] - Typed message bus: client registry, priority queues,
//!   cancellation, in-memory and networked backends
//! - [`dispatch`] - Foreman/Shiftboss/Worker pipeline, worker directory,
//!   selection policies
//! - [`config`] - Process-level configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured tracing setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dispatch_core::bus::{MemoryMessageBus, MessageBus};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(MemoryMessageBus::new());
//! let client = bus.connect().await?;
//! bus.register_client_as_sender(client, 42).await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;

pub use bus::{MemoryMessageBus, MessageBus};
pub use config::{DispatchConfig, SelectionStrategy};
pub use error::{DispatchError, Result};
