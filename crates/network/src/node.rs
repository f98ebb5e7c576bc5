//! Node: one server plus the live connections of one network identity.
//!
//! Connections are kept in two maps keyed by peer address, one per
//! direction. When two connections to the same peer race, the one registered
//! first wins and the other is closed; callers dialing out still get the
//! winner back.

use crate::authorization::AuthorizationService;
use crate::ban_list::BanList;
use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;
use crate::connection::{Connection, ConnectionConfig, ConnectionHandler, Direction};
use crate::error::{ConnectionFailure, NetworkError};
use crate::handshake::{ConnectionHandshake, HandshakeResult};
use crate::protocol::{
    ApplicationMessage, AuthorizedMessage, CloseConnectionMessage, CloseReason, NetworkMessage,
};
use crate::server::Server;
use crate::transport::{BoxedSocket, Transport};
use futures::future::{abortable, join_all, AbortHandle};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use tradenet_storage::{AuthenticatedDataRequest, AuthenticatedDataStorageService, DataStorageResult};
use tradenet_types::{Address, Capability, Load, TransportType};

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub supported_transport_types: BTreeSet<TransportType>,
    /// Read timeout during the handshake and write timeout afterwards.
    pub socket_timeout: Duration,
    pub max_message_size: usize,
    pub graceful_close_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_concurrent_handshakes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            supported_transport_types: BTreeSet::from([TransportType::Clear]),
            socket_timeout: Duration::from_secs(120),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            graceful_close_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            max_concurrent_handshakes: 64,
        }
    }
}

/// Lifecycle of a node. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    Created,
    InitializeServer,
    ServerInitialized,
    ShutdownStarted,
    ShutdownComplete,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Node events. Every method has an empty default.
pub trait NodeListener: Send + Sync {
    fn on_message(&self, _message: &ApplicationMessage, _connection: &Arc<Connection>) {}

    fn on_data_request_result(
        &self,
        _request: &AuthenticatedDataRequest,
        _result: &DataStorageResult,
        _connection: &Arc<Connection>,
    ) {
    }

    fn on_connection(&self, _connection: &Arc<Connection>) {}

    fn on_disconnect(&self, _connection: &Arc<Connection>, _reason: CloseReason) {}

    fn on_state_change(&self, _state: NodeState) {}
}

/// Collaborators shared by every node of a process.
#[derive(Clone)]
pub struct NodeContext {
    pub transport: Arc<dyn Transport>,
    pub authorization: Arc<dyn AuthorizationService>,
    pub ban_list: Arc<BanList>,
    /// Data requests are dropped when no store is attached.
    pub storage: Option<Arc<AuthenticatedDataStorageService>>,
}

pub struct Node {
    node_id: String,
    config: NodeConfig,
    context: NodeContext,
    state: RwLock<NodeState>,
    my_capability: RwLock<Option<Capability>>,
    server: Mutex<Option<Server>>,
    initialize_lock: tokio::sync::Mutex<()>,
    outbound: Mutex<HashMap<Address, Arc<Connection>>>,
    inbound: Mutex<HashMap<Address, Arc<Connection>>>,
    dial_locks: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
    handshakes: Mutex<HashMap<u64, AbortHandle>>,
    next_handshake_id: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn NodeListener>>>,
    self_ref: Weak<Node>,
}

impl Node {
    pub fn new(node_id: impl Into<String>, config: NodeConfig, context: NodeContext) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            node_id: node_id.into(),
            config,
            context,
            state: RwLock::new(NodeState::Created),
            my_capability: RwLock::new(None),
            server: Mutex::new(None),
            initialize_lock: tokio::sync::Mutex::new(()),
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            dial_locks: Mutex::new(HashMap::new()),
            handshakes: Mutex::new(HashMap::new()),
            next_handshake_id: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn get_state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_shutdown(&self) -> bool {
        self.get_state() >= NodeState::ShutdownStarted
    }

    /// Capability announced to peers, once the server is up.
    pub fn my_capability(&self) -> Option<Capability> {
        self.my_capability.read().clone()
    }

    pub fn find_my_address(&self) -> Option<Address> {
        self.my_capability.read().as_ref().map(|c| c.address.clone())
    }

    pub fn add_listener(&self, listener: Arc<dyn NodeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn NodeListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Start the transport and listen on `port` (0 picks a free one).
    ///
    /// A second call returns the existing capability. Fails once shutdown
    /// has started.
    pub async fn initialize_server(&self, port: u16) -> Result<Capability, NetworkError> {
        let _guard = self.initialize_lock.lock().await;
        if self.is_shutdown() {
            return Err(NetworkError::NodeShutdown(self.node_id.clone()));
        }
        if let Some(capability) = self.my_capability() {
            return Ok(capability);
        }

        self.set_state(NodeState::InitializeServer);
        self.context.transport.initialize().await?;
        let server_socket = self
            .context
            .transport
            .get_server_socket(port, &self.node_id)
            .await?;
        if self.is_shutdown() {
            return Err(NetworkError::NodeShutdown(self.node_id.clone()));
        }

        let capability = Capability::new(
            server_socket.address.clone(),
            self.config.supported_transport_types.clone(),
        );
        let node = self.self_ref.clone();
        let server = Server::start(
            server_socket,
            self.config.max_concurrent_handshakes,
            move |socket| {
                let node = node.clone();
                async move {
                    if let Some(node) = node.upgrade() {
                        node.on_client_socket(socket).await;
                    }
                }
            },
        );
        *self.server.lock() = Some(server);
        *self.my_capability.write() = Some(capability.clone());
        self.set_state(NodeState::ServerInitialized);
        Ok(capability)
    }

    /// Existing outbound connection, else a usable inbound one, else a new
    /// outbound dial. Unverified inbound connections count only when
    /// `allow_unverified_address` is set.
    pub async fn get_connection(
        &self,
        address: &Address,
        allow_unverified_address: bool,
    ) -> Result<Arc<Connection>, NetworkError> {
        if self.is_shutdown() {
            return Err(NetworkError::NodeShutdown(self.node_id.clone()));
        }
        if let Some(connection) = self.find_connection(address, allow_unverified_address) {
            return Ok(connection);
        }
        self.create_outbound_connection(address, allow_unverified_address)
            .await
    }

    pub fn find_connection(
        &self,
        address: &Address,
        allow_unverified_address: bool,
    ) -> Option<Arc<Connection>> {
        if let Some(connection) = self.outbound.lock().get(address) {
            if connection.is_running() {
                return Some(connection.clone());
            }
        }
        self.inbound
            .lock()
            .get(address)
            .filter(|c| {
                c.is_running() && (allow_unverified_address || c.is_peer_address_verified())
            })
            .cloned()
    }

    /// Send over any connection to `address`, dialing if needed.
    pub async fn send(
        &self,
        message: NetworkMessage,
        address: &Address,
    ) -> Result<Arc<Connection>, NetworkError> {
        let connection = self.get_connection(address, true).await?;
        self.send_to_connection(message, &connection).await?;
        Ok(connection)
    }

    pub async fn send_to_connection(
        &self,
        message: NetworkMessage,
        connection: &Arc<Connection>,
    ) -> Result<(), NetworkError> {
        if self.is_shutdown() {
            return Err(NetworkError::NodeShutdown(self.node_id.clone()));
        }
        self.send_authorized(message, connection).await
    }

    pub fn close_connection(&self, connection: &Arc<Connection>, reason: CloseReason) {
        connection.shutdown(reason);
    }

    /// Tell the peer we are leaving, then close whether or not that worked.
    pub async fn close_connection_gracefully(
        &self,
        connection: &Arc<Connection>,
        reason: CloseReason,
    ) {
        self.close_gracefully(connection, reason, CloseReason::CloseMessageSent)
            .await;
    }

    pub fn get_all_connections(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<Arc<Connection>> = self.outbound.lock().values().cloned().collect();
        connections.extend(self.inbound.lock().values().cloned());
        connections
    }

    pub fn get_outbound_connections(&self) -> Vec<Arc<Connection>> {
        self.outbound.lock().values().cloned().collect()
    }

    pub fn get_inbound_connections(&self) -> Vec<Arc<Connection>> {
        self.inbound.lock().values().cloned().collect()
    }

    pub fn num_connections(&self) -> usize {
        self.outbound.lock().len() + self.inbound.lock().len()
    }

    /// Close every connection, cancel pending handshakes and stop the
    /// server and transport. Bounded by `shutdown_timeout`; whatever is
    /// still open afterwards is force-closed.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state >= NodeState::ShutdownStarted {
                return;
            }
            *state = NodeState::ShutdownStarted;
        }
        self.notify_state(NodeState::ShutdownStarted);
        info!("Shutting down node {}", self.node_id);

        let pending: Vec<AbortHandle> = self.handshakes.lock().drain().map(|(_, h)| h).collect();
        for handshake in pending {
            handshake.abort();
        }
        if let Some(server) = self.server.lock().take() {
            server.shutdown();
        }

        let connections = self.get_all_connections();
        let closing = join_all(connections.iter().map(|connection| {
            self.close_gracefully(connection, CloseReason::Shutdown, CloseReason::Shutdown)
        }));
        if timeout(self.config.shutdown_timeout, closing).await.is_err() {
            warn!(
                "Node {} did not close all connections within {:?}",
                self.node_id, self.config.shutdown_timeout
            );
        }
        for connection in self.get_all_connections() {
            connection.shutdown(CloseReason::Shutdown);
        }
        self.outbound.lock().clear();
        self.inbound.lock().clear();
        self.dial_locks.lock().clear();

        self.context.transport.shutdown().await;
        self.set_state(NodeState::ShutdownComplete);
        info!("Node {} shut down", self.node_id);
    }

    fn set_state(&self, new_state: NodeState) {
        {
            let mut state = self.state.write();
            if new_state <= *state {
                return;
            }
            *state = new_state;
        }
        debug!("Node {} state changed to {}", self.node_id, new_state);
        self.notify_state(new_state);
    }

    fn notify_state(&self, state: NodeState) {
        self.notify(|listener| listener.on_state_change(state));
    }

    fn notify(&self, f: impl Fn(&dyn NodeListener)) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            f(listener.as_ref());
        }
    }

    fn handler(&self) -> Weak<dyn ConnectionHandler> {
        let node: Weak<Node> = self.self_ref.clone();
        node
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_message_size: self.config.max_message_size,
            write_timeout: self.config.socket_timeout,
        }
    }

    fn handshake(&self, my_capability: Capability) -> ConnectionHandshake {
        ConnectionHandshake::new(
            my_capability,
            Load::new(self.num_connections() as u32),
            self.context.authorization.clone(),
            self.context.ban_list.clone(),
            self.config.socket_timeout,
            self.config.max_message_size,
        )
    }

    /// Run a handshake so that `shutdown` can cancel it.
    async fn track_handshake<F>(&self, handshake: F) -> Result<HandshakeResult, NetworkError>
    where
        F: Future<Output = Result<HandshakeResult, NetworkError>>,
    {
        let (handshake, abort_handle) = abortable(handshake);
        let id = self.next_handshake_id.fetch_add(1, Ordering::Relaxed);
        self.handshakes.lock().insert(id, abort_handle);
        let result = handshake.await;
        self.handshakes.lock().remove(&id);
        result.map_err(|_| {
            NetworkError::connection(ConnectionFailure::HandshakeCancelled, "node shut down")
        })?
    }

    fn dial_lock(&self, address: &Address) -> Arc<tokio::sync::Mutex<()>> {
        self.dial_locks
            .lock()
            .entry(address.clone())
            .or_default()
            .clone()
    }

    async fn on_client_socket(&self, socket: BoxedSocket) {
        let Some(my_capability) = self.my_capability() else {
            return;
        };
        if self.is_shutdown() {
            return;
        }
        let result = match self.track_handshake(self.handshake(my_capability).on_socket(socket)).await {
            Ok(result) => result,
            Err(e) => {
                self.log_inbound_handshake_failure(&e);
                return;
            }
        };

        let peer_address = result.peer_capability.address.clone();
        let connection = Connection::new(
            Direction::Inbound,
            peer_address.clone(),
            result,
            self.handler(),
            self.connection_config(),
        );
        let registered = {
            let mut inbound = self.inbound.lock();
            match inbound.get(&peer_address) {
                Some(existing) if existing.is_running() => false,
                _ => {
                    inbound.insert(peer_address.clone(), connection.clone());
                    true
                }
            }
        };
        if !registered {
            info!(
                "Node {} already has an inbound connection from {}; closing the new one",
                self.node_id, peer_address
            );
            connection.shutdown(CloseReason::DuplicateConnection);
            return;
        }
        if self.is_shutdown() {
            connection.shutdown(CloseReason::Shutdown);
            return;
        }

        debug!(
            "Node {} accepted inbound connection {} from {}",
            self.node_id,
            connection.id(),
            peer_address
        );
        connection.start_listen();
        self.notify(|listener| listener.on_connection(&connection));
    }

    async fn create_outbound_connection(
        &self,
        address: &Address,
        allow_unverified_address: bool,
    ) -> Result<Arc<Connection>, NetworkError> {
        let my_capability = match self.my_capability() {
            Some(capability) => capability,
            None => {
                warn!(
                    "Node {} dials {} before its server is initialized; initializing on a free port",
                    self.node_id, address
                );
                self.initialize_server(0).await?
            }
        };
        if self.context.ban_list.is_banned(address) {
            return Err(NetworkError::connection(
                ConnectionFailure::AddressBanned,
                format!("{} is banned", address),
            ));
        }

        // One dial per peer at a time; latecomers reuse the winner.
        let dial_lock = self.dial_lock(address);
        let _dialing = dial_lock.lock().await;
        if let Some(connection) = self.find_connection(address, allow_unverified_address) {
            return Ok(connection);
        }
        if self.is_shutdown() {
            return Err(NetworkError::NodeShutdown(self.node_id.clone()));
        }

        debug!("Node {} dialing {}", self.node_id, address);
        let socket = self.context.transport.get_socket(address).await?;
        let result = self
            .track_handshake(self.handshake(my_capability).start(socket, address))
            .await?;

        if !address.is_clear_net_address() && result.peer_capability.address != *address {
            let reported = result.peer_capability.address.clone();
            let mut socket = result.socket;
            let _ = socket.shutdown().await;
            return Err(NetworkError::connection(
                ConnectionFailure::AddressMismatch,
                format!("dialed {} but peer reports {}", address, reported),
            ));
        }

        let connection = Connection::new(
            Direction::Outbound,
            address.clone(),
            result,
            self.handler(),
            self.connection_config(),
        );
        let winner = {
            let mut outbound = self.outbound.lock();
            match outbound.get(address) {
                Some(existing) if existing.is_running() => Some(existing.clone()),
                _ => {
                    outbound.insert(address.clone(), connection.clone());
                    None
                }
            }
        };
        if let Some(existing) = winner {
            debug!(
                "Node {} lost the race to {}; keeping {}",
                self.node_id,
                address,
                existing.id()
            );
            connection.shutdown(CloseReason::DuplicateConnection);
            return Ok(existing);
        }
        if self.is_shutdown() {
            connection.shutdown(CloseReason::Shutdown);
            return Err(NetworkError::NodeShutdown(self.node_id.clone()));
        }

        info!(
            "Node {} connected to {} ({})",
            self.node_id,
            address,
            connection.id()
        );
        connection.start_listen();
        self.notify(|listener| listener.on_connection(&connection));
        Ok(connection)
    }

    async fn send_authorized(
        &self,
        message: NetworkMessage,
        connection: &Arc<Connection>,
    ) -> Result<(), NetworkError> {
        let token = self
            .context
            .authorization
            .create_token(message.message_type());
        match connection.send(AuthorizedMessage { message, token }).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if connection.is_running() {
                    warn!(
                        "Sending on connection {} to {} failed: {}",
                        connection.id(),
                        connection.peer_address(),
                        e
                    );
                    connection.shutdown(CloseReason::Exception);
                }
                Err(e)
            }
        }
    }

    async fn close_gracefully(
        &self,
        connection: &Arc<Connection>,
        announced: CloseReason,
        local: CloseReason,
    ) {
        let message = NetworkMessage::CloseConnection(CloseConnectionMessage { reason: announced });
        match timeout(
            self.config.graceful_close_timeout,
            self.send_authorized(message, connection),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(
                "Close message to {} not delivered: {}",
                connection.peer_address(),
                e
            ),
            Err(_) => debug!(
                "Close message to {} timed out",
                connection.peer_address()
            ),
        }
        connection
            .shutdown_and_wait(local, self.config.graceful_close_timeout)
            .await;
    }

    fn log_inbound_handshake_failure(&self, error: &NetworkError) {
        if self.is_shutdown() {
            return;
        }
        match error.failure_kind() {
            Some(ConnectionFailure::AddressBanned) | Some(ConnectionFailure::AuthorizationFailed) => {
                info!("Node {} rejected inbound handshake: {}", self.node_id, error)
            }
            _ => debug!("Inbound handshake at node {} failed: {}", self.node_id, error),
        }
    }
}

impl ConnectionHandler for Node {
    fn is_message_authorized(&self, message: &AuthorizedMessage) -> bool {
        self.context
            .authorization
            .is_authorized(message.message.message_type(), &message.token)
    }

    fn handle_network_message(&self, message: &NetworkMessage, connection: &Arc<Connection>) {
        if self.is_shutdown() {
            return;
        }
        match message {
            NetworkMessage::CloseConnection(close) => {
                info!(
                    "Peer {} closed connection {} ({})",
                    connection.peer_address(),
                    connection.id(),
                    close.reason
                );
                connection.shutdown(CloseReason::CloseMessageReceived);
            }
            NetworkMessage::DataRequest(request) => match &self.context.storage {
                Some(storage) => {
                    let result = storage.process(request.clone());
                    self.notify(|listener| {
                        listener.on_data_request_result(request, &result, connection)
                    });
                }
                None => debug!(
                    "Node {} has no data store; dropping {} request",
                    self.node_id,
                    request.kind()
                ),
            },
            NetworkMessage::Application(application) => {
                self.notify(|listener| listener.on_message(application, connection));
            }
        }
    }

    fn handle_connection_closed(&self, connection: &Arc<Connection>, reason: CloseReason) {
        let map = match connection.direction() {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        };
        let removed = {
            let mut map = map.lock();
            match map.get(connection.peer_address()) {
                Some(registered) if Arc::ptr_eq(registered, connection) => {
                    map.remove(connection.peer_address());
                    true
                }
                _ => false,
            }
        };
        if removed {
            debug!(
                "Node {} removed {} connection {} to {} ({})",
                self.node_id,
                connection.direction(),
                connection.id(),
                connection.peer_address(),
                reason
            );
            self.notify(|listener| listener.on_disconnect(connection, reason));
        }
    }

    fn handle_exception(&self, connection: &Arc<Connection>, error: &NetworkError) {
        if self.is_shutdown() {
            return;
        }
        let peer = connection.peer_address();
        match error {
            e if e.is_expected_on_close() => {
                debug!("Connection {} to {} ended: {}", connection.id(), peer, e)
            }
            NetworkError::Transport(_) => {
                warn!("Connection {} to {}: {}", connection.id(), peer, error)
            }
            e if e.failure_kind() == Some(ConnectionFailure::HandshakeTimeout) => {
                warn!("Connection {} to {} timed out: {}", connection.id(), peer, e)
            }
            e => error!("Connection {} to {} failed: {}", connection.id(), peer, e),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id)
            .field("state", &self.get_state())
            .field("connections", &self.num_connections())
            .finish()
    }
}
