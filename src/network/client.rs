//! Network Client
//!
//! TCP client for sending requests to other nodes.

use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{read_message, write_message};
use super::protocol::Message;
use crate::error::{Error, Result};

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Idle connections: address -> stream
    pool: Mutex<HashMap<String, TcpStream>>,
    /// Connection timeout
    connect_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Send a message to a peer and wait for the response.
    ///
    /// A pooled stream is checked out for the duration of the exchange and
    /// only returned after a complete response, so a request abandoned by a
    /// caller-side timeout closes its connection instead of leaving an
    /// unread reply on it.
    pub async fn send(&self, address: &str, message: &Message) -> Result<Message> {
        if let Some(mut stream) = self.checkout(address).await {
            match exchange(&mut stream, message).await {
                Ok(response) => {
                    self.checkin(address, stream).await;
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!("Pooled connection to {} failed ({}), reconnecting", address, e);
                }
            }
        }

        let mut stream = self.connect(address).await?;
        let response = exchange(&mut stream, message).await?;
        self.checkin(address, stream).await;
        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(
            self.connect_timeout,
            TcpStream::connect(address),
        ).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout(address.to_string())),
        }
    }

    async fn checkout(&self, address: &str) -> Option<TcpStream> {
        self.pool.lock().await.remove(address)
    }

    async fn checkin(&self, address: &str, stream: TcpStream) {
        self.pool.lock().await.insert(address.to_string(), stream);
    }

    /// Close all connections
    pub async fn close_all(&self) {
        self.pool.lock().await.clear();
    }

    /// Get idle connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.lock().await.len()
    }
}

async fn exchange(stream: &mut TcpStream, message: &Message) -> Result<Message> {
    let (mut reader, mut writer) = stream.split();
    write_message(&mut writer, message).await?;
    read_message(&mut reader).await
}
