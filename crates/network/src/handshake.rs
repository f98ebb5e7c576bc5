//! Capability exchange run once per socket before it becomes a connection.
//!
//! The dialing side sends a [`HandshakeRequest`] and waits for the
//! [`HandshakeResponse`]; the accepting side does the mirror image. Version
//! negotiation happens only here. Any failure shuts the socket down.

use crate::authorization::AuthorizationService;
use crate::ban_list::BanList;
use crate::codec::{read_envelope, write_envelope};
use crate::error::{ConnectionFailure, NetworkError};
use crate::metrics::ConnectionMetrics;
use crate::protocol::{Envelope, EnvelopePayload, HandshakeRequest, HandshakeResponse};
use crate::transport::BoxedSocket;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Instant};
use tracing::debug;
use tradenet_types::{Address, Capability, Load};

pub const HANDSHAKE_REQUEST: &str = "HandshakeRequest";
pub const HANDSHAKE_RESPONSE: &str = "HandshakeResponse";

/// Outcome of a successful handshake. The socket is handed back so the
/// caller can wrap it in a connection.
pub struct HandshakeResult {
    pub peer_capability: Capability,
    pub peer_load: Load,
    pub metrics: ConnectionMetrics,
    pub socket: BoxedSocket,
}

pub struct ConnectionHandshake {
    my_capability: Capability,
    my_load: Load,
    authorization: Arc<dyn AuthorizationService>,
    ban_list: Arc<BanList>,
    socket_timeout: Duration,
    max_message_size: usize,
}

impl ConnectionHandshake {
    pub fn new(
        my_capability: Capability,
        my_load: Load,
        authorization: Arc<dyn AuthorizationService>,
        ban_list: Arc<BanList>,
        socket_timeout: Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            my_capability,
            my_load,
            authorization,
            ban_list,
            socket_timeout,
            max_message_size,
        }
    }

    /// Client side: send our request and wait for the peer's response.
    pub async fn start(
        self,
        mut socket: BoxedSocket,
        peer_address: &Address,
    ) -> Result<HandshakeResult, NetworkError> {
        match self.run_client(&mut socket, peer_address).await {
            Ok((response, metrics)) => Ok(HandshakeResult {
                peer_capability: response.capability,
                peer_load: response.load,
                metrics,
                socket,
            }),
            Err(e) => {
                debug!("Outbound handshake with {} failed: {}", peer_address, e);
                let _ = socket.shutdown().await;
                Err(e)
            }
        }
    }

    /// Server side: wait for the peer's request and answer it.
    pub async fn on_socket(self, mut socket: BoxedSocket) -> Result<HandshakeResult, NetworkError> {
        match self.run_server(&mut socket).await {
            Ok((request, metrics)) => Ok(HandshakeResult {
                peer_capability: request.capability,
                peer_load: request.load,
                metrics,
                socket,
            }),
            Err(e) => {
                debug!("Inbound handshake failed: {}", e);
                let _ = socket.shutdown().await;
                Err(e)
            }
        }
    }

    async fn run_client(
        &self,
        socket: &mut BoxedSocket,
        peer_address: &Address,
    ) -> Result<(HandshakeResponse, ConnectionMetrics), NetworkError> {
        if self.ban_list.is_banned(peer_address) {
            return Err(banned(peer_address));
        }

        let metrics = ConnectionMetrics::new();
        let started = Instant::now();
        let request = Envelope::new(EnvelopePayload::HandshakeRequest(HandshakeRequest {
            token: self.authorization.create_token(HANDSHAKE_REQUEST),
            capability: self.my_capability.clone(),
            load: self.my_load,
        }));
        let written = self.write(socket, &request).await?;
        metrics.record_message_sent(written);

        let (envelope, read) = self.read(socket).await?;
        envelope.verify_version()?;
        let response = match envelope.payload {
            EnvelopePayload::HandshakeResponse(response) => response,
            other => return Err(unexpected(HANDSHAKE_RESPONSE, other.name())),
        };
        if self.ban_list.is_banned(&response.capability.address) {
            return Err(banned(&response.capability.address));
        }
        if !self
            .authorization
            .is_authorized(HANDSHAKE_RESPONSE, &response.token)
        {
            return Err(NetworkError::connection(
                ConnectionFailure::AuthorizationFailed,
                format!("handshake response from {}", peer_address),
            ));
        }
        metrics.record_message_received(read);
        metrics.record_handshake_rtt(started.elapsed());
        Ok((response, metrics))
    }

    async fn run_server(
        &self,
        socket: &mut BoxedSocket,
    ) -> Result<(HandshakeRequest, ConnectionMetrics), NetworkError> {
        let metrics = ConnectionMetrics::new();
        let started = Instant::now();
        let (envelope, read) = self.read(socket).await?;
        envelope.verify_version()?;
        let request = match envelope.payload {
            EnvelopePayload::HandshakeRequest(request) => request,
            other => return Err(unexpected(HANDSHAKE_REQUEST, other.name())),
        };
        if self.ban_list.is_banned(&request.capability.address) {
            return Err(banned(&request.capability.address));
        }
        if !self
            .authorization
            .is_authorized(HANDSHAKE_REQUEST, &request.token)
        {
            return Err(NetworkError::connection(
                ConnectionFailure::AuthorizationFailed,
                format!("handshake request from {}", request.capability.address),
            ));
        }
        metrics.record_message_received(read);

        let response = Envelope::new(EnvelopePayload::HandshakeResponse(HandshakeResponse {
            token: self.authorization.create_token(HANDSHAKE_RESPONSE),
            capability: self.my_capability.clone(),
            load: self.my_load,
        }));
        let written = self.write(socket, &response).await?;
        metrics.record_message_sent(written);
        metrics.record_handshake_rtt(started.elapsed());
        Ok((request, metrics))
    }

    async fn read(&self, socket: &mut BoxedSocket) -> Result<(Envelope, usize), NetworkError> {
        timeout(self.socket_timeout, read_envelope(socket, self.max_message_size))
            .await
            .map_err(|_| timed_out(self.socket_timeout))?
    }

    async fn write(&self, socket: &mut BoxedSocket, envelope: &Envelope) -> Result<usize, NetworkError> {
        timeout(
            self.socket_timeout,
            write_envelope(socket, envelope, self.max_message_size),
        )
        .await
        .map_err(|_| timed_out(self.socket_timeout))?
    }
}

fn banned(address: &Address) -> NetworkError {
    NetworkError::connection(
        ConnectionFailure::AddressBanned,
        format!("{} is banned", address),
    )
}

fn unexpected(expected: &str, got: &str) -> NetworkError {
    NetworkError::connection(
        ConnectionFailure::UnexpectedMessage,
        format!("expected {}, got {}", expected, got),
    )
}

fn timed_out(after: Duration) -> NetworkError {
    NetworkError::connection(
        ConnectionFailure::HandshakeTimeout,
        format!("no handshake message within {:?}", after),
    )
}
