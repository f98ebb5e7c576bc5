use crate::transport::{BoxedSocket, ServerSocketResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tradenet_types::Address;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop for one listening socket.
///
/// Every accepted socket is handed to the callback on its own task, so a slow
/// handshake never holds up the next accept. At most
/// `max_concurrent_handshakes` callbacks run at once.
pub struct Server {
    node_id: String,
    address: Address,
    stopped: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn start<F, Fut>(
        server_socket: ServerSocketResult,
        max_concurrent_handshakes: usize,
        on_socket: F,
    ) -> Self
    where
        F: Fn(BoxedSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ServerSocketResult {
            node_id,
            address,
            server_socket,
        } = server_socket;
        let permits = Arc::new(Semaphore::new(max_concurrent_handshakes.max(1)));
        let on_socket = Arc::new(on_socket);
        let log_address = address.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                match server_socket.accept().await {
                    Ok(socket) => {
                        let permits = permits.clone();
                        let on_socket = on_socket.clone();
                        tokio::spawn(async move {
                            let Ok(_permit) = permits.acquire_owned().await else {
                                return;
                            };
                            on_socket(socket).await;
                        });
                    }
                    Err(e) => {
                        warn!("Accepting on {} failed: {}", log_address, e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        });
        info!("Server for node {} started at {}", node_id, address);

        Self {
            node_id,
            address,
            stopped: AtomicBool::new(false),
            accept_task: Mutex::new(Some(accept_task)),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Stop accepting and close the listening socket. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        debug!("Server for node {} at {} stopped", self.node_id, self.address);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ClearNetTransport, Transport};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn accepted_sockets_reach_the_callback() {
        let transport = ClearNetTransport::default();
        let socket = transport.get_server_socket(0, "server-test").await.unwrap();
        let address = socket.address.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = Server::start(socket, 4, move |_socket| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
            }
        });

        let _first = transport.get_socket(&address).await.unwrap();
        let _second = transport.get_socket(&address).await.unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        server.shutdown();
        server.shutdown();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn slow_handler_does_not_block_accepts() {
        let transport = ClearNetTransport::default();
        let socket = transport.get_server_socket(0, "server-test").await.unwrap();
        let address = socket.address.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = seen.clone();
        let _server = Server::start(socket, 4, move |_socket| {
            let counter = counter.clone();
            let tx = tx.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    // First caller parks forever.
                    std::future::pending::<()>().await;
                }
                let _ = tx.send(());
            }
        });

        let _stuck = transport.get_socket(&address).await.unwrap();
        let _next = transport.get_socket(&address).await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_the_listener() {
        let transport = ClearNetTransport::default();
        let socket = transport.get_server_socket(0, "server-test").await.unwrap();
        let address = socket.address.clone();
        let server = Server::start(socket, 1, |_socket| async {});
        server.shutdown();
        // Give the aborted task a moment to drop its listener.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.get_socket(&address).await.is_err());
    }
}
