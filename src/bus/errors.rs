//! # Bus Error Types
//!
//! Structural failures of bus operations. Protocol-level send outcomes are
//! not errors; they are reported through [`SendStatus`](crate::bus::SendStatus).

use thiserror::Error;

use crate::bus::types::ClientId;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("client {client} is not connected to the bus")]
    NotConnected { client: ClientId },

    #[error("bus connection closed")]
    ConnectionClosed,

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire protocol error: {message}")]
    Protocol { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bus server error: {message}")]
    Server { message: String },
}

impl BusError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }
}

/// Result type alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;
