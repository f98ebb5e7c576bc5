//! Wire protocol for the Tradenet P2P layer
//!
//! Every frame carries an [`Envelope`] stamped with the protocol version.
//! Before the handshake completes only handshake payloads are valid; after
//! it, all traffic is wrapped in an [`AuthorizedMessage`].

use crate::authorization::AuthorizationToken;
use crate::error::{ConnectionFailure, NetworkError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tradenet_storage::AuthenticatedDataRequest;
use tradenet_types::{Capability, Load};

/// Network protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Versioned wrapper around every frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub payload: EnvelopePayload,
}

impl Envelope {
    pub fn new(payload: EnvelopePayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    pub fn verify_version(&self) -> Result<(), NetworkError> {
        if self.version == PROTOCOL_VERSION {
            Ok(())
        } else {
            Err(NetworkError::connection(
                ConnectionFailure::InvalidVersion,
                format!(
                    "expected protocol version {}, got {}",
                    PROTOCOL_VERSION, self.version
                ),
            ))
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, NetworkError> {
        Ok(bincode::deserialize(data)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopePayload {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Authorized(AuthorizedMessage),
}

impl EnvelopePayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HandshakeRequest(_) => "HandshakeRequest",
            Self::HandshakeResponse(_) => "HandshakeResponse",
            Self::Authorized(_) => "AuthorizedMessage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub token: AuthorizationToken,
    pub capability: Capability,
    pub load: Load,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub token: AuthorizationToken,
    pub capability: Capability,
    pub load: Load,
}

/// Post-handshake wire wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedMessage {
    pub message: NetworkMessage,
    pub token: AuthorizationToken,
}

/// Messages exchanged over an established connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    CloseConnection(CloseConnectionMessage),
    DataRequest(AuthenticatedDataRequest),
    Application(ApplicationMessage),
}

impl NetworkMessage {
    /// Type identifier authorization tokens are bound to.
    pub fn message_type(&self) -> &str {
        match self {
            Self::CloseConnection(_) => "CloseConnection",
            Self::DataRequest(_) => "DataRequest",
            Self::Application(message) => &message.kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseConnectionMessage {
    pub reason: CloseReason,
}

/// Opaque higher-layer message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    pub kind: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ApplicationMessage {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    CloseMessageReceived,
    CloseMessageSent,
    Shutdown,
    Exception,
    DuplicateConnection,
    Banned,
    AuthorizationFailed,
    TooManyConnections,
    AgedConnection,
}

impl CloseReason {
    /// Whether the peer already knows the connection is going away.
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            CloseReason::CloseMessageReceived | CloseReason::CloseMessageSent
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::{AuthorizationService, MessageTypeAuthorization};
    use tradenet_types::Address;

    #[test]
    fn envelope_bincode_round_trip() {
        let auth = MessageTypeAuthorization;
        let message = NetworkMessage::Application(ApplicationMessage::new("chat", b"hi".to_vec()));
        let envelope = Envelope::new(EnvelopePayload::Authorized(AuthorizedMessage {
            token: auth.create_token(message.message_type()),
            message,
        }));
        let bytes = envelope.serialize().unwrap();
        assert_eq!(Envelope::deserialize(&bytes).unwrap(), envelope);
    }

    #[test]
    fn handshake_request_carries_capability() {
        let auth = MessageTypeAuthorization;
        let envelope = Envelope::new(EnvelopePayload::HandshakeRequest(HandshakeRequest {
            token: auth.create_token("HandshakeRequest"),
            capability: Capability::for_address(Address::localhost(4000)),
            load: Load::new(2),
        }));
        let decoded = Envelope::deserialize(&envelope.serialize().unwrap()).unwrap();
        match decoded.payload {
            EnvelopePayload::HandshakeRequest(request) => {
                assert_eq!(request.capability.address, Address::localhost(4000));
                assert_eq!(request.load.num_connections, 2);
            }
            other => panic!("unexpected payload {}", other.name()),
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut envelope = Envelope::new(EnvelopePayload::HandshakeResponse(HandshakeResponse {
            token: MessageTypeAuthorization.create_token("HandshakeResponse"),
            capability: Capability::for_address(Address::localhost(4000)),
            load: Load::INITIAL,
        }));
        assert!(envelope.verify_version().is_ok());
        envelope.version = PROTOCOL_VERSION + 1;
        let err = envelope.verify_version().unwrap_err();
        assert_eq!(err.failure_kind(), Some(ConnectionFailure::InvalidVersion));
    }

    #[test]
    fn message_type_of_application_message_is_its_kind() {
        let message = NetworkMessage::Application(ApplicationMessage::new("offer", vec![]));
        assert_eq!(message.message_type(), "offer");
        let close = NetworkMessage::CloseConnection(CloseConnectionMessage {
            reason: CloseReason::Shutdown,
        });
        assert_eq!(close.message_type(), "CloseConnection");
        assert!(CloseReason::CloseMessageSent.is_graceful());
        assert!(!CloseReason::Exception.is_graceful());
    }
}
