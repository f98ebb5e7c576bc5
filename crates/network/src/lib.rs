//! Tradenet Network Core
//!
//! Peer-to-peer plumbing for a Tradenet node: sockets from a [`Transport`],
//! a capability handshake, framed message connections and the [`Node`] that
//! owns them.
//!
//! ## Modules
//! - `transport`: socket factories and the clear-net TCP transport
//! - `protocol`: envelopes, handshake and post-handshake messages
//! - `codec`: length-prefixed framing
//! - `handshake`: client and server side of the capability exchange
//! - `connection`: one running duplex channel per socket
//! - `server`: accept loop
//! - `node`: connection maps, dialing, dispatch and shutdown
//! - `nodes_by_id`: several nodes under logical identities
//! - `authorization`, `ban_list`, `metrics`: collaborators used by the above

pub mod authorization;
pub mod ban_list;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod metrics;
pub mod node;
pub mod nodes_by_id;
pub mod protocol;
pub mod server;
pub mod transport;

// ------------------------------------------------------------
// Re-exports for workspace-wide use
// ------------------------------------------------------------

pub use authorization::{AuthorizationService, AuthorizationToken, MessageTypeAuthorization};
pub use ban_list::BanList;
pub use connection::{Connection, ConnectionHandler, ConnectionListener, Direction};
pub use error::{ConnectionFailure, NetworkError};
pub use handshake::{ConnectionHandshake, HandshakeResult};
pub use metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
pub use node::{Node, NodeConfig, NodeContext, NodeListener, NodeState};
pub use nodes_by_id::{NodesById, NodesByIdListener};
pub use protocol::{
    ApplicationMessage, AuthorizedMessage, CloseConnectionMessage, CloseReason, Envelope,
    NetworkMessage, PROTOCOL_VERSION,
};
pub use server::Server;
pub use transport::{BoxedSocket, ClearNetTransport, ClearNetTransportConfig, Transport};
