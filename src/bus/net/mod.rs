//! # Networked Bus
//!
//! Client/server pair giving remote processes the same bus contract as the
//! in-process implementation. The server hosts a [`MemoryMessageBus`] and
//! speaks newline-delimited JSON frames over TCP; the client stub implements
//! [`MessageBus`] by forwarding each call as one frame exchange.
//!
//! [`MemoryMessageBus`]: crate::bus::MemoryMessageBus
//! [`MessageBus`]: crate::bus::MessageBus

pub mod client;
pub mod protocol;
pub mod server;

pub use client::NetMessageBus;
pub use server::BusServer;
