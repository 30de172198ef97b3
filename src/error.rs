//! Crate-level error type for the dispatch layer. Bus-internal failures have
//! their own type ([`BusError`]) and convert into this one at the seam.

use thiserror::Error;

use crate::bus::BusError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("unknown query {query_id}")]
    UnknownQuery { query_id: u64 },

    #[error("unknown block {block_id}")]
    UnknownBlock { block_id: u64 },

    #[error("unexpected message type {message_type}")]
    UnexpectedMessageType { message_type: u32 },

    #[error("payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
