use crate::data_store::DataStore;
use crate::payload::{AuthenticatedPayload, AuthenticatedSequentialData, DataHash};
use crate::persistence::Persistence;
use crate::requests::{
    AddAuthenticatedDataRequest, AuthenticatedDataRequest, RefreshAuthenticatedDataRequest,
    RemoveAuthenticatedDataRequest,
};
use crate::result::{DataStorageReason, DataStorageResult};
use crate::retention::{PruneReport, RetentionPolicy};
use crate::StorageError;
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tradenet_types::{Clock, SystemClock};

/// Storage service configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub store_name: String,
    pub retention: RetentionPolicy,
    /// Minimum spacing between two persistence writes.
    pub max_write_rate: Duration,
    /// Period of the expiry pruning task.
    pub prune_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_name: "authenticated_data_store".to_string(),
            retention: RetentionPolicy::default(),
            max_write_rate: Duration::from_millis(1000),
            prune_interval: Duration::from_secs(60),
        }
    }
}

/// Observer of accepted store mutations. Called after the store lock is released.
pub trait DataStorageListener: Send + Sync {
    fn on_added(&self, payload: &AuthenticatedPayload);

    fn on_removed(&self, payload: &AuthenticatedPayload);

    fn on_refreshed(&self, _payload: &AuthenticatedPayload) {}
}

/// Coalesces persistence requests so that at most one write happens per
/// `max_write_rate`.
struct PersistenceWriter {
    persistence: Arc<dyn Persistence>,
    store: Arc<Mutex<DataStore>>,
    max_write_rate: Duration,
    last_write: Mutex<Option<Instant>>,
    pending: AtomicBool,
    /// Held for snapshot plus write, so a later write always carries later state.
    write_lock: Mutex<()>,
}

impl PersistenceWriter {
    fn request_write(self: &Arc<Self>) {
        let wait = self
            .last_write
            .lock()
            .map(|last| self.max_write_rate.saturating_sub(last.elapsed()))
            .unwrap_or(Duration::ZERO);

        if wait.is_zero() {
            self.schedule_write();
            return;
        }
        if self.pending.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let writer = Arc::clone(self);
                handle.spawn(async move {
                    tokio::time::sleep(wait).await;
                    if writer.pending.load(Ordering::SeqCst) {
                        writer.schedule_write();
                    }
                });
            }
            Err(_) => debug!("No runtime available, deferring store write until flush"),
        }
    }

    /// Serializing and syncing the store blocks, so inside a runtime the
    /// write moves to the blocking pool instead of the caller's worker.
    fn schedule_write(self: &Arc<Self>) {
        self.pending.store(false, Ordering::SeqCst);
        *self.last_write.lock() = Some(Instant::now());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let writer = Arc::clone(self);
                handle.spawn_blocking(move || writer.write_snapshot());
            }
            Err(_) => self.write_snapshot(),
        }
    }

    fn write_snapshot(&self) {
        let _guard = self.write_lock.lock();
        let snapshot = self.store.lock().clone();
        if let Err(e) = self.persistence.persist(&snapshot) {
            error!("Failed to persist data store: {}", e);
        }
    }

    fn flush(&self) {
        if self.pending.swap(false, Ordering::SeqCst) {
            *self.last_write.lock() = Some(Instant::now());
            self.write_snapshot();
        }
    }
}

/// Replicated map of signed records ordered by per-hash sequence numbers.
///
/// Every mutation validates and writes under one lock. Listener
/// notification and persistence happen after the lock is released.
pub struct AuthenticatedDataStorageService {
    config: StorageConfig,
    store: Arc<Mutex<DataStore>>,
    writer: Arc<PersistenceWriter>,
    listeners: RwLock<Vec<Arc<dyn DataStorageListener>>>,
    clock: Arc<dyn Clock>,
    pruning_task: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl AuthenticatedDataStorageService {
    pub fn new(config: StorageConfig, persistence: Arc<dyn Persistence>) -> Self {
        Self::with_clock(config, persistence, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: StorageConfig,
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(Mutex::new(DataStore::new()));
        let writer = Arc::new(PersistenceWriter {
            persistence,
            store: Arc::clone(&store),
            max_write_rate: config.max_write_rate,
            last_write: Mutex::new(None),
            pending: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        });
        Self {
            config,
            store,
            writer,
            listeners: RwLock::new(Vec::new()),
            clock,
            pruning_task: Mutex::new(None),
            is_shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Load the persisted snapshot and prune it before it becomes visible.
    pub fn load(&self) -> Result<PruneReport, StorageError> {
        let Some(persisted) = self.writer.persistence.load()? else {
            debug!("No persisted state for store {}", self.config.store_name);
            return Ok(PruneReport::default());
        };
        let now = self.clock.now_millis();
        let (pruned, report) = self.config.retention.prune(persisted, now);
        *self.store.lock() = pruned;
        info!(
            "Loaded store {}: {} entries retained, {} pruned",
            self.config.store_name,
            report.retained_entries,
            report.pruned_entries()
        );
        Ok(report)
    }

    /// Apply any wire request to the store.
    pub fn process(&self, request: AuthenticatedDataRequest) -> DataStorageResult {
        match request {
            AuthenticatedDataRequest::Add(request) => self.add(request),
            AuthenticatedDataRequest::Remove(request) => self.remove(request),
            AuthenticatedDataRequest::Refresh(request) => self.refresh(request),
        }
    }

    pub fn add(&self, request: AddAuthenticatedDataRequest) -> DataStorageResult {
        let hash = request.hash();
        let now = self.clock.now_millis();
        let payload = request.payload().clone();
        {
            let mut store = self.store.lock();
            if store.len() >= self.config.retention.max_map_size && !store.contains(&hash) {
                warn!("Max map size reached at add. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::MaxMapSizeReached);
            }

            let request_from_map = store.get(&hash);
            if let Some(AuthenticatedDataRequest::Add(stored)) = request_from_map {
                if *stored == request {
                    return DataStorageResult::rejected(DataStorageReason::RequestAlreadyReceived);
                }
            }

            if let Some(stored) = request_from_map {
                if request
                    .sequential_data
                    .is_sequence_nr_invalid(stored.sequence_number())
                {
                    return DataStorageResult::rejected(DataStorageReason::SequenceNrInvalid);
                }
            }

            if request.sequential_data.is_expired(now) {
                warn!("Data is expired at add. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::Expired);
            }

            if request.payload().is_data_invalid() {
                warn!("Data is invalid at add. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::DataInvalid);
            }

            if request.is_public_key_invalid() {
                warn!("PublicKey is invalid at add. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::PublicKeyHashInvalid);
            }

            if request.is_signature_invalid() {
                warn!("Signature is invalid at add. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::SignatureInvalid);
            }

            store.put(hash, AuthenticatedDataRequest::Add(request));
        }

        self.writer.request_write();
        self.notify("on_added", |listener| listener.on_added(&payload));
        DataStorageResult::success()
    }

    pub fn remove(&self, request: RemoveAuthenticatedDataRequest) -> DataStorageResult {
        let hash = request.hash;
        let removed_payload;
        {
            let mut store = self.store.lock();
            let data_from_map: &AuthenticatedSequentialData = match store.get(&hash) {
                None => {
                    debug!("No entry at remove. hash={}", hash);
                    // Keep the sequence number so a late add with a lower one is rejected.
                    if store.len() < self.config.retention.max_map_size {
                        store.put(hash, AuthenticatedDataRequest::Remove(request));
                        drop(store);
                        self.writer.request_write();
                    }
                    return DataStorageResult::rejected(DataStorageReason::NoEntry);
                }
                Some(AuthenticatedDataRequest::Remove(stored)) => {
                    debug!("Already removed. hash={}", hash);
                    if !request.is_sequence_nr_invalid(stored.sequence_number) {
                        store.put(hash, AuthenticatedDataRequest::Remove(request));
                        drop(store);
                        self.writer.request_write();
                    }
                    return DataStorageResult::rejected(DataStorageReason::AlreadyRemoved);
                }
                Some(AuthenticatedDataRequest::Refresh(_)) => {
                    error!("Refresh request found in store. hash={}", hash);
                    return DataStorageResult::rejected(DataStorageReason::NoEntry);
                }
                Some(AuthenticatedDataRequest::Add(stored)) => &stored.sequential_data,
            };

            if request.is_sequence_nr_invalid(data_from_map.sequence_number) {
                warn!("SequenceNr has not increased at remove. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::SequenceNrInvalid);
            }

            if request.is_public_key_hash_invalid(data_from_map) {
                warn!("PublicKey hash is invalid at remove. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::PublicKeyHashInvalid);
            }

            if request.is_signature_invalid() {
                warn!("Signature is invalid at remove. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::SignatureInvalid);
            }

            removed_payload = data_from_map.payload.clone();
            store.put(hash, AuthenticatedDataRequest::Remove(request));
        }

        self.writer.request_write();
        self.notify("on_removed", |listener| listener.on_removed(&removed_payload));
        DataStorageResult::removed(removed_payload)
    }

    pub fn refresh(&self, request: RefreshAuthenticatedDataRequest) -> DataStorageResult {
        let hash = request.hash;
        let refreshed_payload;
        {
            let mut store = self.store.lock();
            let add_from_map = match store.get(&hash) {
                None | Some(AuthenticatedDataRequest::Refresh(_)) => {
                    return DataStorageResult::rejected(DataStorageReason::NoEntry);
                }
                Some(AuthenticatedDataRequest::Remove(_)) => {
                    return DataStorageResult::rejected(DataStorageReason::AlreadyRemoved);
                }
                Some(AuthenticatedDataRequest::Add(stored)) => stored,
            };
            let data_from_map = &add_from_map.sequential_data;

            if request.is_sequence_nr_invalid(data_from_map.sequence_number) {
                warn!("SequenceNr is invalid at refresh. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::SequenceNrInvalid);
            }

            if request.is_public_key_hash_invalid(data_from_map) {
                warn!("PublicKey is invalid at refresh. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::PublicKeyHashInvalid);
            }

            if request.is_signature_invalid() {
                warn!("Signature is invalid at refresh. hash={}", hash);
                return DataStorageResult::rejected(DataStorageReason::SignatureInvalid);
            }

            let updated = AddAuthenticatedDataRequest {
                sequential_data: AuthenticatedSequentialData::from(
                    data_from_map,
                    request.sequence_number,
                ),
                signature: add_from_map.signature.clone(),
                owner_public_key: add_from_map.owner_public_key.clone(),
            };
            refreshed_payload = updated.payload().clone();
            store.put(hash, AuthenticatedDataRequest::Add(updated));
        }

        self.writer.request_write();
        self.notify("on_refreshed", |listener| {
            listener.on_refreshed(&refreshed_payload)
        });
        DataStorageResult::success()
    }

    /// Stored sequence number for `hash`, 0 when unknown.
    pub fn get_sequence_number(&self, hash: &DataHash) -> u32 {
        self.store
            .lock()
            .get(hash)
            .map(AuthenticatedDataRequest::sequence_number)
            .unwrap_or(0)
    }

    pub fn get(&self, hash: &DataHash) -> Option<AuthenticatedDataRequest> {
        self.store.lock().get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Payloads of all live (not removed) entries.
    pub fn payloads(&self) -> Vec<AuthenticatedPayload> {
        self.store
            .lock()
            .iter()
            .filter_map(|(_, request)| match request {
                AuthenticatedDataRequest::Add(add) => Some(add.payload().clone()),
                _ => None,
            })
            .collect()
    }

    /// Drop expired adds and aged entries. Expired adds are reported to
    /// listeners as removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let retention = self.config.retention;
        let mut removed_payloads = Vec::new();
        let mut pruned = 0;
        {
            let mut store = self.store.lock();
            store.retain(|_, request| {
                if !retention.should_prune(request, now) {
                    return true;
                }
                if let AuthenticatedDataRequest::Add(add) = request {
                    removed_payloads.push(add.payload().clone());
                }
                pruned += 1;
                false
            });
        }

        if pruned > 0 {
            debug!(
                "Pruned {} entries from store {}",
                pruned, self.config.store_name
            );
            self.writer.request_write();
        }
        for payload in &removed_payloads {
            self.notify("on_removed", |listener| listener.on_removed(payload));
        }
        pruned
    }

    /// Run [`Self::prune_expired`] every `prune_interval` until shutdown.
    pub fn start_expiry_pruning(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.prune_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                if service.is_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                service.prune_expired();
            }
        });
        if let Some(previous) = self.pruning_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the pruning task and write any pending state.
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.pruning_task.lock().take() {
            task.abort();
        }
        self.writer.flush();
        info!("Store {} shut down", self.config.store_name);
    }

    pub fn add_listener(&self, listener: Arc<dyn DataStorageListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DataStorageListener>) {
        self.listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    fn notify<F>(&self, event: &str, f: F)
    where
        F: Fn(&dyn DataStorageListener),
    {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                error!("Calling {} at storage listener failed", event);
            }
        }
    }
}

impl Drop for AuthenticatedDataStorageService {
    fn drop(&mut self) {
        if let Some(task) = self.pruning_task.lock().take() {
            task.abort();
        }
    }
}
