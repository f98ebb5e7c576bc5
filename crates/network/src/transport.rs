//! Socket factories the node runs on top of.

use crate::error::NetworkError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};
use tradenet_types::{Address, TransportType};

/// A bidirectional byte stream to a peer.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedSocket = Box<dyn Socket>;

/// Listening socket bound to one node identity.
#[async_trait]
pub trait ServerSocket: Send + Sync {
    async fn accept(&self) -> Result<BoxedSocket, NetworkError>;
}

pub struct ServerSocketResult {
    pub node_id: String,
    /// Address peers reach this server at.
    pub address: Address,
    pub server_socket: Box<dyn ServerSocket>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    async fn initialize(&self) -> Result<(), NetworkError>;

    /// Open a listening socket. Port 0 picks a free port.
    async fn get_server_socket(
        &self,
        port: u16,
        node_id: &str,
    ) -> Result<ServerSocketResult, NetworkError>;

    async fn get_socket(&self, address: &Address) -> Result<BoxedSocket, NetworkError>;

    async fn shutdown(&self);
}

/// Clear-net transport configuration
#[derive(Debug, Clone)]
pub struct ClearNetTransportConfig {
    /// Interface the server socket binds to; also the advertised host.
    pub host: String,
    pub connect_timeout: Duration,
}

impl Default for ClearNetTransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Plain TCP transport.
#[derive(Debug, Clone, Default)]
pub struct ClearNetTransport {
    config: ClearNetTransportConfig,
}

impl ClearNetTransport {
    pub fn new(config: ClearNetTransportConfig) -> Self {
        Self { config }
    }
}

struct TcpServerSocket {
    listener: TcpListener,
}

#[async_trait]
impl ServerSocket for TcpServerSocket {
    async fn accept(&self) -> Result<BoxedSocket, NetworkError> {
        let (stream, remote) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", remote);
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Transport for ClearNetTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Clear
    }

    async fn initialize(&self) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn get_server_socket(
        &self,
        port: u16,
        node_id: &str,
    ) -> Result<ServerSocketResult, NetworkError> {
        let listener = TcpListener::bind((self.config.host.as_str(), port))
            .await
            .map_err(|e| {
                NetworkError::Transport(format!(
                    "bind {}:{} failed: {}",
                    self.config.host, port, e
                ))
            })?;
        let local: SocketAddr = listener.local_addr()?;
        let address = Address::from_host_port(&local.ip().to_string(), local.port() as u64)
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        info!("Node {} listening on {}", node_id, address);
        Ok(ServerSocketResult {
            node_id: node_id.to_string(),
            address,
            server_socket: Box::new(TcpServerSocket { listener }),
        })
    }

    async fn get_socket(&self, address: &Address) -> Result<BoxedSocket, NetworkError> {
        if !address.is_clear_net_address() {
            return Err(NetworkError::Transport(format!(
                "{} is not reachable over clear-net",
                address
            )));
        }
        let connect = TcpStream::connect((address.host(), address.port()));
        let stream = timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| NetworkError::Transport(format!("connect to {} timed out", address)))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn loopback_connect_and_accept() {
        let transport = ClearNetTransport::default();
        let server = transport.get_server_socket(0, "node-a").await.unwrap();
        assert!(server.address.port() > 0);
        assert_eq!(server.address.host(), "127.0.0.1");

        let address = server.address.clone();
        let dial = tokio::spawn(async move {
            let mut socket = ClearNetTransport::default().get_socket(&address).await.unwrap();
            socket.write_all(b"ping").await.unwrap();
        });

        let mut accepted = server.server_socket.accept().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        dial.await.unwrap();
    }

    #[tokio::test]
    async fn tor_addresses_are_rejected() {
        let onion = Address::from_host_port(
            "m3h2p7j2mfl6w2u6g5hx7o5fek7e6fhb4i2h6h6syh5w4slf6xqrv7ad.onion",
            9999,
        )
        .unwrap();
        assert!(ClearNetTransport::default().get_socket(&onion).await.is_err());
    }
}
