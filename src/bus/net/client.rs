//! # Networked Bus Client
//!
//! A [`MessageBus`] stub that forwards every operation to a remote
//! [`BusServer`](crate::bus::net::BusServer) over one TCP connection.
//! Calls on one stub are serialized: the connection carries one frame
//! exchange at a time, which matches the intended usage of one stub per
//! logical bus client. A blocking receive therefore parks the connection, not
//! the server.

use async_trait::async_trait;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::bus::cancellation::{CancellationToken, SharedBool};
use crate::bus::errors::{BusError, BusResult};
use crate::bus::net::protocol::{read_frame, write_frame, Request, Response};
use crate::bus::types::{
    Address, AnnotatedMessage, ClientId, MessageStyle, MessageTypeId, Priority, SendStatus,
    TaggedMessage,
};
use crate::bus::MessageBus;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Remote bus endpoint with the same contract as the in-process bus.
pub struct NetMessageBus {
    connection: Mutex<Connection>,
}

impl NetMessageBus {
    /// Connects the underlying TCP stream. Bus clients are created
    /// separately through [`MessageBus::connect`].
    pub async fn connect_to(addr: &str) -> BusResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            connection: Mutex::new(Connection {
                reader: BufReader::new(read_half),
                writer,
            }),
        })
    }

    async fn call(&self, request: &Request) -> BusResult<Response> {
        let mut connection = self.connection.lock().await;
        write_frame(&mut connection.writer, request).await?;
        match read_frame(&mut connection.reader).await? {
            Some(Response::Error { message }) => Err(BusError::server(message)),
            Some(response) => Ok(response),
            None => Err(BusError::ConnectionClosed),
        }
    }

    fn unexpected(response: Response) -> BusError {
        BusError::protocol(format!("unexpected response frame: {response:?}"))
    }
}

#[async_trait]
impl MessageBus for NetMessageBus {
    async fn connect(&self) -> BusResult<ClientId> {
        match self.call(&Request::Connect).await? {
            Response::Connected { client } => Ok(client),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn disconnect(&self, client: ClientId) -> BusResult<bool> {
        match self.call(&Request::Disconnect { client }).await? {
            Response::Disconnected { existed } => Ok(existed),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn register_client_as_sender(
        &self,
        client: ClientId,
        message_type: MessageTypeId,
    ) -> BusResult<bool> {
        match self
            .call(&Request::RegisterSender {
                client,
                message_type,
            })
            .await?
        {
            Response::Registered { accepted } => Ok(accepted),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn register_client_as_receiver(
        &self,
        client: ClientId,
        message_type: MessageTypeId,
    ) -> BusResult<bool> {
        match self
            .call(&Request::RegisterReceiver {
                client,
                message_type,
            })
            .await?
        {
            Response::Registered { accepted } => Ok(accepted),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn send(
        &self,
        sender: ClientId,
        address: &Address,
        style: &MessageStyle,
        message: TaggedMessage,
        priority: Priority,
    ) -> BusResult<SendStatus> {
        let request = Request::Send {
            sender,
            address: address.clone(),
            style: style.clone(),
            message_type: message.message_type,
            payload: message.payload,
            priority,
            cancellable: false,
        };
        match self.call(&request).await? {
            Response::Sent { status, .. } => Ok(status),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn send_cancellable(
        &self,
        sender: ClientId,
        address: &Address,
        style: &MessageStyle,
        message: TaggedMessage,
        priority: Priority,
    ) -> BusResult<(SendStatus, Option<CancellationToken>)> {
        let request = Request::Send {
            sender,
            address: address.clone(),
            style: style.clone(),
            message_type: message.message_type,
            payload: message.payload,
            priority,
            cancellable: true,
        };
        match self.call(&request).await? {
            Response::Sent { status, message_id } => {
                // The shared flag here is client-local; the authoritative
                // flag lives server-side and is addressed by message id.
                let token =
                    message_id.map(|id| CancellationToken::new(SharedBool::new(false), id));
                Ok((status, token))
            }
            other => Err(Self::unexpected(other)),
        }
    }

    async fn cancel_message(&self, sender: ClientId, token: &CancellationToken) -> BusResult<()> {
        token.set_cancelled();
        match self
            .call(&Request::CancelMessage {
                sender,
                message_id: token.message_id(),
            })
            .await?
        {
            Response::Cancelled => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn receive_batch(
        &self,
        receiver: ClientId,
        min_priority: Priority,
        max_messages: usize,
        delete_immediately: bool,
    ) -> BusResult<Vec<AnnotatedMessage>> {
        let request = Request::Receive {
            receiver,
            min_priority,
            max_messages,
            delete_immediately,
            block: true,
        };
        match self.call(&request).await? {
            Response::Messages { messages } => {
                Ok(messages.into_iter().map(AnnotatedMessage::from).collect())
            }
            other => Err(Self::unexpected(other)),
        }
    }

    async fn try_receive_batch(
        &self,
        receiver: ClientId,
        min_priority: Priority,
        max_messages: usize,
        delete_immediately: bool,
    ) -> BusResult<Vec<AnnotatedMessage>> {
        let request = Request::Receive {
            receiver,
            min_priority,
            max_messages,
            delete_immediately,
            block: false,
        };
        match self.call(&request).await? {
            Response::Messages { messages } => {
                Ok(messages.into_iter().map(AnnotatedMessage::from).collect())
            }
            other => Err(Self::unexpected(other)),
        }
    }

    async fn delete_messages(&self, receiver: ClientId, message_ids: &[i64]) -> BusResult<()> {
        let request = Request::DeleteMessages {
            receiver,
            message_ids: message_ids.to_vec(),
        };
        match self.call(&request).await? {
            Response::Deleted => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    async fn count_queued_messages(&self, receiver: ClientId) -> BusResult<usize> {
        match self.call(&Request::CountQueued { receiver }).await? {
            Response::QueueLength { count } => Ok(count),
            other => Err(Self::unexpected(other)),
        }
    }
}
