//! Network Server
//!
//! TCP server for accepting requests from other nodes.

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

use super::{read_message, write_message, InboundRequest};
use super::protocol::{ErrorCode, Message, Reply};
use crate::error::{Error, Result};

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Channel for incoming requests
    incoming_tx: mpsc::Sender<InboundRequest>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(
        bind_address: String,
        incoming_tx: mpsc::Sender<InboundRequest>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            incoming_tx,
            shutdown: shutdown_tx,
        }
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Network server listening on {}", self.bind_address);
        Ok(listener)
    }

    /// Accept connections until stopped
    pub async fn serve(&self, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let incoming_tx = self.incoming_tx.clone();
                            let conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), incoming_tx, conn_shutdown).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection: one request, one reply, repeat
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    incoming_tx: mpsc::Sender<InboundRequest>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = tokio::select! {
            result = read_message(&mut reader) => result,
            _ = shutdown.changed() => break,
        };

        match message {
            Ok(Message::Request(envelope)) => {
                tracing::trace!("Received {} from {} ({})", envelope.event.type_name(), envelope.sender, peer_addr);

                let (reply_tx, reply_rx) = oneshot::channel();
                let reply = if incoming_tx.send(InboundRequest { envelope, reply: reply_tx }).await.is_err() {
                    shutting_down()
                } else {
                    reply_rx.await.unwrap_or_else(|_| shutting_down())
                };

                write_message(&mut writer, &Message::Response(reply)).await?;
            }
            Ok(Message::Response(reply)) => {
                tracing::warn!("Ignoring unsolicited {} from {}", reply.type_name(), peer_addr);
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::trace!("Connection closed by {}", peer_addr);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

fn shutting_down() -> Reply {
    Reply::Error {
        code: ErrorCode::ShuttingDown,
        message: "node is not accepting requests".into(),
    }
}
