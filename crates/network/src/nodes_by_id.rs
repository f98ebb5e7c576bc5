use crate::connection::Connection;
use crate::error::NetworkError;
use crate::node::{Node, NodeConfig, NodeContext, NodeListener, NodeState};
use crate::protocol::{ApplicationMessage, CloseReason, NetworkMessage};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use tradenet_storage::{AuthenticatedDataRequest, DataStorageResult};
use tradenet_types::{Address, Capability};

/// Node events tagged with the identity of the node they happened on.
pub trait NodesByIdListener: Send + Sync {
    fn on_message(&self, _node_id: &str, _message: &ApplicationMessage, _connection: &Arc<Connection>) {}

    fn on_data_request_result(
        &self,
        _node_id: &str,
        _request: &AuthenticatedDataRequest,
        _result: &DataStorageResult,
        _connection: &Arc<Connection>,
    ) {
    }

    fn on_connection(&self, _node_id: &str, _connection: &Arc<Connection>) {}

    fn on_disconnect(&self, _node_id: &str, _connection: &Arc<Connection>, _reason: CloseReason) {}

    fn on_state_change(&self, _node_id: &str, _state: NodeState) {}
}

type SharedListeners = Arc<RwLock<Vec<Arc<dyn NodesByIdListener>>>>;

/// Relays one node's events to the registry's listeners.
struct Forwarder {
    node_id: String,
    listeners: SharedListeners,
}

impl Forwarder {
    fn each(&self, f: impl Fn(&dyn NodesByIdListener)) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            f(listener.as_ref());
        }
    }
}

impl NodeListener for Forwarder {
    fn on_message(&self, message: &ApplicationMessage, connection: &Arc<Connection>) {
        self.each(|l| l.on_message(&self.node_id, message, connection));
    }

    fn on_data_request_result(
        &self,
        request: &AuthenticatedDataRequest,
        result: &DataStorageResult,
        connection: &Arc<Connection>,
    ) {
        self.each(|l| l.on_data_request_result(&self.node_id, request, result, connection));
    }

    fn on_connection(&self, connection: &Arc<Connection>) {
        self.each(|l| l.on_connection(&self.node_id, connection));
    }

    fn on_disconnect(&self, connection: &Arc<Connection>, reason: CloseReason) {
        self.each(|l| l.on_disconnect(&self.node_id, connection, reason));
    }

    fn on_state_change(&self, state: NodeState) {
        self.each(|l| l.on_state_change(&self.node_id, state));
    }
}

/// Several nodes, one per logical identity, sharing one process.
///
/// Nodes are created on first use and share the transport, authorization,
/// ban list and data store.
pub struct NodesById {
    config: NodeConfig,
    context: NodeContext,
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    listeners: SharedListeners,
}

impl NodesById {
    pub fn new(config: NodeConfig, context: NodeContext) -> Self {
        Self {
            config,
            context,
            nodes: Mutex::new(HashMap::new()),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn get_or_create_node(&self, node_id: &str) -> Arc<Node> {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get(node_id) {
            return node.clone();
        }
        let node = Node::new(node_id, self.config.clone(), self.context.clone());
        node.add_listener(Arc::new(Forwarder {
            node_id: node_id.to_string(),
            listeners: self.listeners.clone(),
        }));
        nodes.insert(node_id.to_string(), node.clone());
        node
    }

    pub fn find_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.nodes.lock().get(node_id).cloned()
    }

    pub async fn initialize_server(&self, node_id: &str, port: u16) -> Result<Capability, NetworkError> {
        self.get_or_create_node(node_id).initialize_server(port).await
    }

    pub async fn get_connection(
        &self,
        node_id: &str,
        address: &Address,
        allow_unverified_address: bool,
    ) -> Result<Arc<Connection>, NetworkError> {
        self.get_or_create_node(node_id)
            .get_connection(address, allow_unverified_address)
            .await
    }

    pub async fn send(
        &self,
        node_id: &str,
        message: NetworkMessage,
        address: &Address,
    ) -> Result<Arc<Connection>, NetworkError> {
        self.get_or_create_node(node_id).send(message, address).await
    }

    pub async fn close_connection_gracefully(
        &self,
        node_id: &str,
        connection: &Arc<Connection>,
        reason: CloseReason,
    ) {
        if let Some(node) = self.find_node(node_id) {
            node.close_connection_gracefully(connection, reason).await;
        }
    }

    pub fn find_my_address(&self, node_id: &str) -> Option<Address> {
        self.find_node(node_id).and_then(|node| node.find_my_address())
    }

    pub fn get_all_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn add_listener(&self, listener: Arc<dyn NodesByIdListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn NodesByIdListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Shut every node down concurrently, waiting at most one node shutdown
    /// timeout plus a grace second overall.
    pub async fn shutdown(&self) {
        let nodes: Vec<Arc<Node>> = self.nodes.lock().values().cloned().collect();
        info!("Shutting down {} node(s)", nodes.len());
        let wait = self.config.shutdown_timeout + Duration::from_secs(1);
        let all = join_all(nodes.iter().map(|node| node.shutdown()));
        if timeout(wait, all).await.is_err() {
            warn!("Not all nodes shut down within {:?}", wait);
        }
    }
}
