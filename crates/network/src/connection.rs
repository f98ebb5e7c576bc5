//! A running duplex message channel over one handshaked socket.
//!
//! Each connection owns one read task (started by [`Connection::start_listen`])
//! and one write task fed through a channel, so sends on one connection are
//! serialized while different connections proceed in parallel.

use crate::codec::{read_envelope, write_envelope};
use crate::error::{ConnectionFailure, NetworkError};
use crate::handshake::HandshakeResult;
use crate::metrics::ConnectionMetrics;
use crate::protocol::{AuthorizedMessage, CloseReason, Envelope, EnvelopePayload, NetworkMessage};
use crate::transport::BoxedSocket;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use tradenet_types::{Address, Capability, Load};

const WRITE_QUEUE_SIZE: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Owner-side callbacks, invoked from the connection's read task.
pub trait ConnectionHandler: Send + Sync {
    fn is_message_authorized(&self, message: &AuthorizedMessage) -> bool;

    fn handle_network_message(&self, message: &NetworkMessage, connection: &Arc<Connection>);

    /// Called exactly once per connection.
    fn handle_connection_closed(&self, connection: &Arc<Connection>, reason: CloseReason);

    fn handle_exception(&self, connection: &Arc<Connection>, error: &NetworkError);
}

/// Observers of a single connection.
pub trait ConnectionListener: Send + Sync {
    fn on_network_message(&self, _message: &NetworkMessage, _connection: &Connection) {}

    fn on_connection_closed(&self, _connection: &Connection, _reason: CloseReason) {}
}

/// Connection tuning
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub max_message_size: usize,
    /// Upper bound for a single frame write.
    pub write_timeout: Duration,
}

struct WriteCommand {
    envelope: Envelope,
    reply: oneshot::Sender<Result<usize, NetworkError>>,
}

pub struct Connection {
    id: String,
    direction: Direction,
    peer_address: Address,
    peer_capability: Capability,
    peer_load: Load,
    metrics: ConnectionMetrics,
    peer_address_verified: AtomicBool,
    stopped: AtomicBool,
    max_message_size: usize,
    handler: Weak<dyn ConnectionHandler>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    writer: Mutex<Option<mpsc::Sender<WriteCommand>>>,
    reader: Mutex<Option<ReadHalf<BoxedSocket>>>,
    shutdown_signal: watch::Sender<bool>,
    write_task: Mutex<Option<JoinHandle<()>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Connection>,
}

impl Connection {
    /// Wrap a handshaked socket. Must be called inside a tokio runtime; the
    /// write task starts immediately, reading starts with `start_listen`.
    pub fn new(
        direction: Direction,
        peer_address: Address,
        handshake: HandshakeResult,
        handler: Weak<dyn ConnectionHandler>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let HandshakeResult {
            peer_capability,
            peer_load,
            metrics,
            socket,
        } = handshake;
        let (read_half, write_half) = tokio::io::split(socket);
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let (shutdown_signal, _) = watch::channel(false);
        let write_task = tokio::spawn(run_writer(
            write_half,
            rx,
            config.max_message_size,
            config.write_timeout,
        ));
        let id = format!(
            "{}-{}",
            direction,
            NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
        );
        debug!("Created {} connection {} to {}", direction, id, peer_address);

        Arc::new_cyclic(|self_ref| Self {
            id,
            direction,
            peer_address,
            peer_capability,
            peer_load,
            metrics,
            peer_address_verified: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            max_message_size: config.max_message_size,
            handler,
            listeners: RwLock::new(Vec::new()),
            writer: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(read_half)),
            shutdown_signal,
            write_task: Mutex::new(Some(write_task)),
            read_task: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The dialed address for outbound connections, the announced one for
    /// inbound connections.
    pub fn peer_address(&self) -> &Address {
        &self.peer_address
    }

    pub fn peer_capability(&self) -> &Capability {
        &self.peer_capability
    }

    pub fn peer_load(&self) -> Load {
        self.peer_load
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        !self.is_stopped()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Outbound peers are verified by construction: we picked the address.
    pub fn is_peer_address_verified(&self) -> bool {
        match self.direction {
            Direction::Outbound => true,
            Direction::Inbound => self.peer_address_verified.load(Ordering::SeqCst),
        }
    }

    pub fn set_peer_address_verified(&self, verified: bool) {
        self.peer_address_verified.store(verified, Ordering::SeqCst);
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Start the read task. Calling it twice, or after shutdown, does nothing.
    pub fn start_listen(&self) {
        let Some(reader) = self.reader.lock().take() else {
            return;
        };
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let shutdown = self.shutdown_signal.subscribe();
        let handle = tokio::spawn(this.read_loop(reader, shutdown));
        *self.read_task.lock() = Some(handle);
    }

    /// Queue a message and wait until it has been flushed.
    pub async fn send(&self, message: AuthorizedMessage) -> Result<(), NetworkError> {
        if self.is_stopped() {
            return Err(self.closed_error());
        }
        let sender = self
            .writer
            .lock()
            .clone()
            .ok_or_else(|| self.closed_error())?;
        let (reply, result) = oneshot::channel();
        let command = WriteCommand {
            envelope: Envelope::new(EnvelopePayload::Authorized(message)),
            reply,
        };
        sender
            .send(command)
            .await
            .map_err(|_| self.closed_error())?;
        let written = result.await.map_err(|_| self.closed_error())??;
        self.metrics.record_message_sent(written);
        Ok(())
    }

    /// Stop the connection. Only the first call has an effect; it returns
    /// true. The handler and listeners are told once, then the tasks wind
    /// down in the background.
    pub fn shutdown(&self, reason: CloseReason) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        let stats = self.metrics.snapshot();
        debug!(
            "Shutting down connection {} ({}) after {} messages, {} bytes, {} ms",
            self.id,
            reason,
            stats.total_messages(),
            stats.total_bytes(),
            stats.age_ms
        );

        let _ = self.shutdown_signal.send(true);
        // Dropping the sender lets the writer drain and close the write half.
        self.writer.lock().take();
        self.reader.lock().take();

        if let (Some(this), Some(handler)) = (self.self_ref.upgrade(), self.handler.upgrade()) {
            handler.handle_connection_closed(&this, reason);
        }
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_connection_closed(self, reason);
        }
        true
    }

    /// Shut down and wait up to `wait` for both tasks to finish. Tasks still
    /// running afterwards are aborted.
    pub async fn shutdown_and_wait(&self, reason: CloseReason, wait: Duration) {
        self.shutdown(reason);
        let tasks: Vec<JoinHandle<()>> = [self.write_task.lock().take(), self.read_task.lock().take()]
            .into_iter()
            .flatten()
            .collect();
        for mut task in tasks {
            if timeout(wait, &mut task).await.is_err() {
                warn!("Connection {} task did not stop within {:?}", self.id, wait);
                task.abort();
            }
        }
    }

    fn closed_error(&self) -> NetworkError {
        NetworkError::ConnectionClosed {
            connection_id: self.id.clone(),
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: ReadHalf<BoxedSocket>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let stopped = *shutdown.borrow();
        if stopped {
            return;
        }
        loop {
            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = read_envelope(&mut reader, self.max_message_size) => result,
            };
            let outcome = match result {
                Ok((envelope, bytes)) => self.on_envelope(envelope, bytes),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                self.on_read_error(e);
                break;
            }
        }
    }

    fn on_envelope(self: &Arc<Self>, envelope: Envelope, bytes: usize) -> Result<(), NetworkError> {
        envelope.verify_version()?;
        let message = match envelope.payload {
            EnvelopePayload::Authorized(message) => message,
            other => {
                return Err(NetworkError::connection(
                    ConnectionFailure::UnexpectedMessage,
                    format!("{} after handshake", other.name()),
                ))
            }
        };
        let Some(handler) = self.handler.upgrade() else {
            return Ok(());
        };
        if !handler.is_message_authorized(&message) {
            warn!(
                "Message authorization failed on connection {}. Dropping {}",
                self.id,
                message.message.message_type()
            );
            return Ok(());
        }
        self.metrics.record_message_received(bytes);
        handler.handle_network_message(&message.message, self);
        // A close message is consumed by the handler; it has no payload for listeners.
        if matches!(message.message, NetworkMessage::CloseConnection(_)) {
            return Ok(());
        }
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_network_message(&message.message, self);
        }
        Ok(())
    }

    fn on_read_error(self: &Arc<Self>, error: NetworkError) {
        if self.is_stopped() {
            debug!("Connection {} read ended after shutdown: {}", self.id, error);
            return;
        }
        if let Some(handler) = self.handler.upgrade() {
            handler.handle_exception(self, &error);
        }
        self.shutdown(CloseReason::Exception);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("peer_address", &self.peer_address)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

async fn run_writer(
    mut writer: WriteHalf<BoxedSocket>,
    mut commands: mpsc::Receiver<WriteCommand>,
    max_message_size: usize,
    write_timeout: Duration,
) {
    while let Some(command) = commands.recv().await {
        let result = match timeout(
            write_timeout,
            write_envelope(&mut writer, &command.envelope, max_message_size),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(NetworkError::connection(
                ConnectionFailure::Io,
                format!("write did not complete within {:?}", write_timeout),
            )),
        };
        let failed = result.is_err();
        let _ = command.reply.send(result);
        if failed {
            // The stream may hold a partial frame; nothing after it can be framed.
            break;
        }
    }
    // Queued commands are dropped, so their senders see the connection closed.
    drop(commands);
    let _ = writer.shutdown().await;
}
