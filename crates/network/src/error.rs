use std::fmt;
use std::io;

/// What went wrong while establishing or running a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    UnexpectedEof,
    InvalidVersion,
    UnexpectedMessage,
    AuthorizationFailed,
    AddressBanned,
    AddressMismatch,
    HandshakeTimeout,
    HandshakeCancelled,
    Io,
    Serialization,
    MessageTooLarge,
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Connection failed ({kind}): {details}")]
    Connection {
        kind: ConnectionFailure,
        details: String,
    },
    #[error("Connection {connection_id} is closed")]
    ConnectionClosed { connection_id: String },
    #[error("Node {0} is shut down")]
    NodeShutdown(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl NetworkError {
    pub fn connection(kind: ConnectionFailure, details: impl Into<String>) -> Self {
        Self::Connection {
            kind,
            details: details.into(),
        }
    }

    pub fn failure_kind(&self) -> Option<ConnectionFailure> {
        match self {
            Self::Connection { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// EOF and plain socket errors are what a peer closing on us looks like.
    pub fn is_expected_on_close(&self) -> bool {
        matches!(
            self.failure_kind(),
            Some(ConnectionFailure::UnexpectedEof) | Some(ConnectionFailure::Io)
        ) || matches!(self, Self::ConnectionClosed { .. })
    }
}

impl From<io::Error> for NetworkError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::UnexpectedEof => ConnectionFailure::UnexpectedEof,
            io::ErrorKind::TimedOut => ConnectionFailure::HandshakeTimeout,
            _ => ConnectionFailure::Io,
        };
        Self::connection(kind, e.to_string())
    }
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        Self::connection(ConnectionFailure::Serialization, e.to_string())
    }
}
