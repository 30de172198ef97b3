//! # Bus Server
//!
//! Hosts a [`MemoryMessageBus`] behind a TCP listener so that clients in
//! other processes get the same bus contract over [`NetMessageBus`]
//! stubs. One connection carries one logical bus client's traffic; when a
//! connection drops, every client id it created is force-disconnected so the
//! registry never accumulates dead endpoints.
//!
//! [`NetMessageBus`]: crate::bus::net::NetMessageBus

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::errors::{BusError, BusResult};
use crate::bus::memory::MemoryMessageBus;
use crate::bus::net::protocol::{read_frame, write_frame, Request, Response, WireMessage};
use crate::bus::types::{ClientId, TaggedMessage};
use crate::bus::MessageBus;

/// TCP front end for a [`MemoryMessageBus`].
pub struct BusServer {
    bus: Arc<MemoryMessageBus>,
    listener: TcpListener,
    /// Client ids owned by each live connection, keyed by peer address.
    sessions: Arc<DashMap<SocketAddr, Vec<ClientId>>>,
}

impl BusServer {
    /// Binds the listener. `addr` may use port 0 to let the OS pick.
    pub async fn bind(addr: &str) -> BusResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "bus server listening");
        Ok(Self {
            bus: Arc::new(MemoryMessageBus::new()),
            listener,
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn local_addr(&self) -> BusResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The hosted bus, for in-process components colocated with the server.
    pub fn bus(&self) -> Arc<MemoryMessageBus> {
        Arc::clone(&self.bus)
    }

    /// Number of live client connections.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs the accept loop until the task is aborted.
    pub fn serve(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer)) => {
                        let bus = Arc::clone(&self.bus);
                        let sessions = Arc::clone(&self.sessions);
                        tokio::spawn(async move {
                            sessions.insert(peer, Vec::new());
                            if let Err(error) = handle_session(&bus, &sessions, stream, peer).await
                            {
                                warn!(peer = %peer, error = %error, "bus session ended with error");
                            }
                            // Reap every client this connection created.
                            if let Some((_, clients)) = sessions.remove(&peer) {
                                for client in clients {
                                    let _ = bus.disconnect(client).await;
                                    crate::logging::log_bus_operation(
                                        "force_disconnect",
                                        Some(client),
                                        None,
                                        "connection_dropped",
                                        Some(&peer.to_string()),
                                    );
                                }
                            }
                            debug!(peer = %peer, "bus session closed");
                        });
                    }
                    Err(error) => {
                        warn!(error = %error, "bus server accept failed");
                        break;
                    }
                }
            }
        })
    }
}

async fn handle_session(
    bus: &MemoryMessageBus,
    sessions: &DashMap<SocketAddr, Vec<ClientId>>,
    stream: TcpStream,
    peer: SocketAddr,
) -> BusResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    while let Some(request) = read_frame::<BufReader<OwnedReadHalf>, Request>(&mut reader).await? {
        let response = handle_request(bus, sessions, peer, request).await;
        write_frame::<OwnedWriteHalf, Response>(&mut write_half, &response).await?;
    }
    Ok(())
}

async fn handle_request(
    bus: &MemoryMessageBus,
    sessions: &DashMap<SocketAddr, Vec<ClientId>>,
    peer: SocketAddr,
    request: Request,
) -> Response {
    match request {
        Request::Connect => match bus.connect().await {
            Ok(client) => {
                if let Some(mut session) = sessions.get_mut(&peer) {
                    session.push(client);
                }
                crate::logging::log_bus_operation(
                    "connect",
                    Some(client),
                    None,
                    "ok",
                    Some(&peer.to_string()),
                );
                Response::Connected { client }
            }
            Err(error) => error_response(error),
        },
        Request::Disconnect { client } => match bus.disconnect(client).await {
            Ok(existed) => {
                if let Some(mut session) = sessions.get_mut(&peer) {
                    session.retain(|&owned| owned != client);
                }
                Response::Disconnected { existed }
            }
            Err(error) => error_response(error),
        },
        Request::RegisterSender {
            client,
            message_type,
        } => match bus.register_client_as_sender(client, message_type).await {
            Ok(accepted) => Response::Registered { accepted },
            Err(error) => error_response(error),
        },
        Request::RegisterReceiver {
            client,
            message_type,
        } => match bus.register_client_as_receiver(client, message_type).await {
            Ok(accepted) => Response::Registered { accepted },
            Err(error) => error_response(error),
        },
        Request::Send {
            sender,
            address,
            style,
            message_type,
            payload,
            priority,
            cancellable,
        } => {
            let message = TaggedMessage::new(message_type, payload);
            if cancellable {
                match bus
                    .send_cancellable(sender, &address, &style, message, priority)
                    .await
                {
                    Ok((status, token)) => Response::Sent {
                        status,
                        message_id: token.map(|t| t.message_id()),
                    },
                    Err(error) => error_response(error),
                }
            } else {
                match bus.send(sender, &address, &style, message, priority).await {
                    Ok(status) => Response::Sent {
                        status,
                        message_id: None,
                    },
                    Err(error) => error_response(error),
                }
            }
        }
        Request::CancelMessage { sender, message_id } => {
            bus.cancel_by_message_id(sender, message_id);
            Response::Cancelled
        }
        Request::Receive {
            receiver,
            min_priority,
            max_messages,
            delete_immediately,
            block,
        } => {
            let result = if block {
                bus.receive_batch(receiver, min_priority, max_messages, delete_immediately)
                    .await
            } else {
                bus.try_receive_batch(receiver, min_priority, max_messages, delete_immediately)
                    .await
            };
            match result {
                Ok(messages) => Response::Messages {
                    messages: messages.into_iter().map(WireMessage::from).collect(),
                },
                Err(error) => error_response(error),
            }
        }
        Request::DeleteMessages {
            receiver,
            message_ids,
        } => match bus.delete_messages(receiver, &message_ids).await {
            Ok(()) => Response::Deleted,
            Err(error) => error_response(error),
        },
        Request::CountQueued { receiver } => match bus.count_queued_messages(receiver).await {
            Ok(count) => Response::QueueLength { count },
            Err(error) => error_response(error),
        },
    }
}

fn error_response(error: BusError) -> Response {
    Response::Error {
        message: error.to_string(),
    }
}
