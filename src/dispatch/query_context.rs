//! # Query Execution Collaborator Shims
//!
//! The dispatch layer ferries query state it does not interpret. These types
//! give it just enough surface to do its job: a [`QueryContext`] materialized
//! per query on each node, a [`CatalogDatabaseCache`] that absorbs serialized
//! deltas, and a [`StorageManager`] seam the execution engine sits behind.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Rebuild bookkeeping for one insert destination: blocks that were left
/// partially filled by normal work orders and need a rebuild pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertDestinationState {
    pub relation_id: u64,
    pub partially_filled_blocks: Vec<u64>,
}

/// Per-query execution state owned by the node's Shiftboss, keyed by the
/// insert-destination index carried in rebuild requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryContext {
    /// Assigned by `materialize`; serialized contexts need not carry it.
    #[serde(default)]
    pub query_id: u64,
    #[serde(default)]
    insert_destinations: HashMap<u32, InsertDestinationState>,
}

impl QueryContext {
    /// Materializes a context from the serialized form shipped in a
    /// `QueryInitiate` message.
    pub fn materialize(query_id: u64, serialized: &serde_json::Value) -> Result<Self> {
        let mut context: QueryContext = serde_json::from_value(serialized.clone())?;
        context.query_id = query_id;
        Ok(context)
    }

    pub fn insert_destination(&self, index: u32) -> Option<&InsertDestinationState> {
        self.insert_destinations.get(&index)
    }

    /// Takes the partially filled blocks of a destination, leaving it empty.
    /// Rebuild synthesis consumes each block exactly once.
    pub fn take_partially_filled_blocks(&mut self, index: u32) -> Result<(u64, Vec<u64>)> {
        let state = self.insert_destinations.get_mut(&index).ok_or_else(|| {
            DispatchError::Configuration {
                message: format!("unknown insert destination index {index}"),
            }
        })?;
        Ok((state.relation_id, std::mem::take(&mut state.partially_filled_blocks)))
    }

    pub fn record_partially_filled_block(&mut self, index: u32, relation_id: u64, block_id: u64) {
        let state = self
            .insert_destinations
            .entry(index)
            .or_insert_with(|| InsertDestinationState {
                relation_id,
                partially_filled_blocks: Vec::new(),
            });
        state.partially_filled_blocks.push(block_id);
    }
}

/// Node-local mirror of catalog metadata, updated by deltas shipped with
/// each `QueryInitiate`.
#[derive(Debug, Default)]
pub struct CatalogDatabaseCache {
    relations: HashMap<u64, serde_json::Value>,
}

impl CatalogDatabaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a serialized delta: an object mapping relation id to its
    /// metadata. Later deltas overwrite earlier entries for the same id.
    pub fn update(&mut self, delta: &serde_json::Value) -> Result<()> {
        let entries: HashMap<u64, serde_json::Value> = serde_json::from_value(delta.clone())?;
        self.relations.extend(entries);
        Ok(())
    }

    pub fn relation(&self, relation_id: u64) -> Option<&serde_json::Value> {
        self.relations.get(&relation_id)
    }

    pub fn num_relations(&self) -> usize {
        self.relations.len()
    }
}

/// Storage seam the dispatch layer hands through to execution. The messaging
/// core never touches block contents.
pub trait StorageManager: Send + Sync {
    /// Persists a block, making it visible to later loads.
    fn save_block(&self, block_id: u64, payload: Vec<u8>) -> Result<()>;

    fn load_block(&self, block_id: u64) -> Result<Vec<u8>>;

    /// Forces a cached block to durable storage. Errors on unknown blocks.
    fn persist_block(&self, block_id: u64) -> Result<()>;

    /// Drops a block from this node. Missing blocks are a no-op.
    fn evict_block(&self, block_id: u64);
}

/// Heap-backed [`StorageManager`] used by tests and single-node runs.
#[derive(Debug, Default)]
pub struct InMemoryStorageManager {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
}

impl InMemoryStorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl StorageManager for InMemoryStorageManager {
    fn save_block(&self, block_id: u64, payload: Vec<u8>) -> Result<()> {
        self.blocks.lock().insert(block_id, payload);
        Ok(())
    }

    fn load_block(&self, block_id: u64) -> Result<Vec<u8>> {
        self.blocks
            .lock()
            .get(&block_id)
            .cloned()
            .ok_or(DispatchError::UnknownBlock { block_id })
    }

    fn persist_block(&self, block_id: u64) -> Result<()> {
        if self.blocks.lock().contains_key(&block_id) {
            Ok(())
        } else {
            Err(DispatchError::UnknownBlock { block_id })
        }
    }

    fn evict_block(&self, block_id: u64) {
        self.blocks.lock().remove(&block_id);
    }
}
