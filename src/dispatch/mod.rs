//! # Work Dispatch
//!
//! The Foreman/Shiftboss/Worker pipeline layered on top of the message bus.
//! A Foreman admits workloads and streams work orders to per-node
//! Shiftbosses; each Shiftboss places orders on its local workers through a
//! selection policy, bounded by per-worker capacity; workers execute and
//! report completions back up the same path.

pub mod foreman;
pub mod messages;
pub mod query_context;
pub mod selection;
pub mod shiftboss;
pub mod worker;
pub mod worker_directory;

pub use foreman::Foreman;
pub use query_context::{
    CatalogDatabaseCache, InMemoryStorageManager, QueryContext, StorageManager,
};
pub use selection::{
    LoadBalancingPolicy, RandomPolicy, RoundRobinPolicy, WorkerSelectionPolicy,
};
pub use shiftboss::Shiftboss;
pub use worker::{WorkOrderExecutor, WorkOrderOutcome, Worker};
pub use worker_directory::{WorkerDirectory, WorkerEntry};
