use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tradenet_crypto::KeyPair;
use tradenet_storage::{
    AddAuthenticatedDataRequest, AuthenticatedDataStorageService, AuthenticatedPayload,
    DataStorageListener, DataStorageReason, DataStore, JsonFilePersistence, MemoryPersistence,
    MetaData, Persistence, RefreshAuthenticatedDataRequest, RemoveAuthenticatedDataRequest,
    RetentionPolicy, StorageConfig,
};
use tradenet_types::ManualClock;

const NOW: u64 = 1_700_000_000_000;
const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Default)]
struct RecordingListener {
    added: Mutex<Vec<AuthenticatedPayload>>,
    removed: Mutex<Vec<AuthenticatedPayload>>,
    refreshed: Mutex<Vec<AuthenticatedPayload>>,
}

impl DataStorageListener for RecordingListener {
    fn on_added(&self, payload: &AuthenticatedPayload) {
        self.added.lock().push(payload.clone());
    }

    fn on_removed(&self, payload: &AuthenticatedPayload) {
        self.removed.lock().push(payload.clone());
    }

    fn on_refreshed(&self, payload: &AuthenticatedPayload) {
        self.refreshed.lock().push(payload.clone());
    }
}

struct PanickingListener {
    calls: AtomicUsize,
}

impl DataStorageListener for PanickingListener {
    fn on_added(&self, _payload: &AuthenticatedPayload) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("listener failure");
    }

    fn on_removed(&self, _payload: &AuthenticatedPayload) {}
}

struct Fixture {
    service: Arc<AuthenticatedDataStorageService>,
    listener: Arc<RecordingListener>,
    persistence: Arc<MemoryPersistence>,
    clock: ManualClock,
}

fn fixture_with(config: StorageConfig) -> Fixture {
    let clock = ManualClock::new(NOW);
    let persistence = Arc::new(MemoryPersistence::new());
    let service = Arc::new(AuthenticatedDataStorageService::with_clock(
        config,
        persistence.clone(),
        Arc::new(clock.clone()),
    ));
    let listener = Arc::new(RecordingListener::default());
    service.add_listener(listener.clone());
    Fixture {
        service,
        listener,
        persistence,
        clock,
    }
}

fn fixture() -> Fixture {
    fixture_with(StorageConfig::default())
}

fn offer(data: &str) -> AuthenticatedPayload {
    AuthenticatedPayload::new(MetaData::new(DAY_MS, 1024, "Offer"), data.as_bytes().to_vec())
}

#[test]
fn identical_add_is_reported_as_already_received() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    let request = AddAuthenticatedDataRequest::from(offer("btc/eur"), 1, &key_pair, NOW);

    assert!(f.service.add(request.clone()).is_success());
    let second = f.service.add(request);
    assert!(!second.success);
    assert!(second.is_rejected_with(DataStorageReason::RequestAlreadyReceived));
    assert_eq!(f.listener.added.lock().len(), 1);
}

#[test]
fn add_refresh_remove_lifecycle() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    let payload = offer("btc/usd");
    let hash = payload.hash();

    let add = AddAuthenticatedDataRequest::from(payload.clone(), 1, &key_pair, NOW);
    assert!(f.service.add(add).is_success());
    assert_eq!(f.service.get_sequence_number(&hash), 1);

    let refresh = RefreshAuthenticatedDataRequest::from(&payload, 2, &key_pair, NOW + 10);
    assert!(f.service.refresh(refresh).is_success());
    assert_eq!(f.service.get_sequence_number(&hash), 2);
    assert_eq!(f.service.payloads(), vec![payload.clone()]);
    assert_eq!(*f.listener.refreshed.lock(), vec![payload.clone()]);

    let remove = RemoveAuthenticatedDataRequest::from(&payload, 3, &key_pair, NOW + 20);
    let result = f.service.remove(remove);
    assert!(result.is_success());
    assert_eq!(result.removed_payload, Some(payload.clone()));
    assert_eq!(*f.listener.removed.lock(), vec![payload]);
    assert_eq!(f.service.get_sequence_number(&hash), 3);
    assert!(f.service.payloads().is_empty());
}

#[test]
fn refreshed_entry_keeps_original_signature_and_payload() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    let payload = offer("xmr/btc");
    let add = AddAuthenticatedDataRequest::from(payload.clone(), 1, &key_pair, NOW);
    let signature = add.signature.clone();
    f.service.add(add);

    let refresh = RefreshAuthenticatedDataRequest::from(&payload, 5, &key_pair, NOW);
    assert!(f.service.refresh(refresh).is_success());

    match f.service.get(&payload.hash()) {
        Some(tradenet_storage::AuthenticatedDataRequest::Add(stored)) => {
            assert_eq!(stored.signature, signature);
            assert_eq!(stored.sequential_data.sequence_number, 5);
            assert_eq!(stored.sequential_data.payload, payload);
        }
        other => panic!("unexpected entry {other:?}"),
    }
}

#[test]
fn foreign_key_is_rejected_for_every_mutation() {
    let f = fixture();
    let owner = KeyPair::generate();
    let intruder = KeyPair::generate();
    let payload = offer("eur/btc");
    let hash = payload.hash();

    f.service
        .add(AddAuthenticatedDataRequest::from(payload.clone(), 1, &owner, NOW));

    let mut forged = AddAuthenticatedDataRequest::from(payload.clone(), 2, &intruder, NOW);
    forged.sequential_data.pub_key_hash = owner.public_key_hash();
    assert!(f
        .service
        .add(forged)
        .is_rejected_with(DataStorageReason::PublicKeyHashInvalid));

    let refresh = RefreshAuthenticatedDataRequest::from(&payload, 2, &intruder, NOW);
    assert!(f
        .service
        .refresh(refresh)
        .is_rejected_with(DataStorageReason::PublicKeyHashInvalid));

    let remove = RemoveAuthenticatedDataRequest::from(&payload, 2, &intruder, NOW);
    assert!(f
        .service
        .remove(remove)
        .is_rejected_with(DataStorageReason::PublicKeyHashInvalid));

    assert_eq!(f.service.get_sequence_number(&hash), 1);
    assert_eq!(f.service.payloads(), vec![payload]);
    assert!(f.listener.removed.lock().is_empty());
}

#[test]
fn bad_signature_is_rejected() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    let mut add = AddAuthenticatedDataRequest::from(offer("a"), 1, &key_pair, NOW);
    add.signature[3] ^= 0x01;
    assert!(f
        .service
        .add(add)
        .is_rejected_with(DataStorageReason::SignatureInvalid));

    let payload = offer("b");
    f.service
        .add(AddAuthenticatedDataRequest::from(payload.clone(), 1, &key_pair, NOW));
    let mut remove = RemoveAuthenticatedDataRequest::from(&payload, 2, &key_pair, NOW);
    remove.signature[0] ^= 0x01;
    assert!(f
        .service
        .remove(remove)
        .is_rejected_with(DataStorageReason::SignatureInvalid));
    assert_eq!(f.service.len(), 1);
}

#[test]
fn refresh_with_bad_signature_keeps_the_stored_sequence() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    let payload = offer("c");
    let hash = payload.hash();
    f.service
        .add(AddAuthenticatedDataRequest::from(payload.clone(), 1, &key_pair, NOW));

    let mut refresh = RefreshAuthenticatedDataRequest::from(&payload, 2, &key_pair, NOW);
    refresh.signature[10] ^= 0x01;
    assert!(f
        .service
        .refresh(refresh)
        .is_rejected_with(DataStorageReason::SignatureInvalid));
    assert_eq!(f.service.get_sequence_number(&hash), 1);
    assert!(f.listener.refreshed.lock().is_empty());

    assert!(f
        .service
        .refresh(RefreshAuthenticatedDataRequest::from(&payload, 2, &key_pair, NOW))
        .is_success());
    assert_eq!(f.service.get_sequence_number(&hash), 2);
}

#[test]
fn expired_and_invalid_data_is_rejected() {
    let f = fixture();
    let key_pair = KeyPair::generate();

    let stale = AddAuthenticatedDataRequest::from(offer("old"), 1, &key_pair, NOW - 2 * DAY_MS);
    assert!(f
        .service
        .add(stale)
        .is_rejected_with(DataStorageReason::Expired));

    let oversized = AuthenticatedPayload::new(MetaData::new(DAY_MS, 4, "Offer"), vec![0u8; 5]);
    let add = AddAuthenticatedDataRequest::from(oversized, 1, &key_pair, NOW);
    assert!(f
        .service
        .add(add)
        .is_rejected_with(DataStorageReason::DataInvalid));
    assert!(f.service.is_empty());
}

#[test]
fn sequence_numbers_only_move_forward_regardless_of_arrival_order() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    let payload = offer("ltc/btc");
    let hash = payload.hash();

    let seq_3 = AddAuthenticatedDataRequest::from(payload.clone(), 3, &key_pair, NOW);
    let seq_1 = AddAuthenticatedDataRequest::from(payload.clone(), 1, &key_pair, NOW);
    let seq_2 = RefreshAuthenticatedDataRequest::from(&payload, 2, &key_pair, NOW);
    let seq_3_remove = RemoveAuthenticatedDataRequest::from(&payload, 3, &key_pair, NOW);
    let seq_4_remove = RemoveAuthenticatedDataRequest::from(&payload, 4, &key_pair, NOW);

    assert!(f.service.add(seq_3).is_success());
    assert!(f
        .service
        .add(seq_1)
        .is_rejected_with(DataStorageReason::SequenceNrInvalid));
    assert!(f
        .service
        .refresh(seq_2)
        .is_rejected_with(DataStorageReason::SequenceNrInvalid));
    assert!(f
        .service
        .remove(seq_3_remove)
        .is_rejected_with(DataStorageReason::SequenceNrInvalid));
    assert_eq!(f.service.get_sequence_number(&hash), 3);

    assert!(f.service.remove(seq_4_remove).is_success());
    assert_eq!(f.service.get_sequence_number(&hash), 4);
}

#[test]
fn remove_before_add_leaves_tombstone_that_blocks_older_adds() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    let payload = offer("late");
    let hash = payload.hash();

    let remove = RemoveAuthenticatedDataRequest::from(&payload, 5, &key_pair, NOW);
    assert!(f
        .service
        .remove(remove)
        .is_rejected_with(DataStorageReason::NoEntry));
    assert_eq!(f.service.get_sequence_number(&hash), 5);
    assert!(f.listener.removed.lock().is_empty());

    let older_add = AddAuthenticatedDataRequest::from(payload.clone(), 4, &key_pair, NOW);
    assert!(f
        .service
        .add(older_add)
        .is_rejected_with(DataStorageReason::SequenceNrInvalid));
}

#[test]
fn repeated_remove_refreshes_tombstone_only_with_higher_sequence() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    let payload = offer("gone");
    let hash = payload.hash();
    f.service
        .add(AddAuthenticatedDataRequest::from(payload.clone(), 1, &key_pair, NOW));
    assert!(f
        .service
        .remove(RemoveAuthenticatedDataRequest::from(&payload, 2, &key_pair, NOW))
        .is_success());

    let lower = RemoveAuthenticatedDataRequest::from(&payload, 2, &key_pair, NOW);
    assert!(f
        .service
        .remove(lower)
        .is_rejected_with(DataStorageReason::AlreadyRemoved));
    assert_eq!(f.service.get_sequence_number(&hash), 2);

    let higher = RemoveAuthenticatedDataRequest::from(&payload, 7, &key_pair, NOW);
    assert!(f
        .service
        .remove(higher)
        .is_rejected_with(DataStorageReason::AlreadyRemoved));
    assert_eq!(f.service.get_sequence_number(&hash), 7);
    assert_eq!(f.listener.removed.lock().len(), 1);
}

#[test]
fn add_with_higher_sequence_republishes_over_tombstone() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    let payload = offer("back again");
    f.service
        .add(AddAuthenticatedDataRequest::from(payload.clone(), 1, &key_pair, NOW));
    f.service
        .remove(RemoveAuthenticatedDataRequest::from(&payload, 2, &key_pair, NOW));

    let republish = AddAuthenticatedDataRequest::from(payload.clone(), 3, &key_pair, NOW);
    assert!(f.service.add(republish).is_success());
    assert_eq!(f.service.payloads(), vec![payload]);
    assert_eq!(f.listener.added.lock().len(), 2);
}

#[test]
fn map_size_is_bounded() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    for i in 0..10_000 {
        let add = AddAuthenticatedDataRequest::from(offer(&format!("offer-{i}")), 1, &key_pair, NOW);
        assert!(f.service.add(add).is_success());
    }
    assert_eq!(f.service.len(), 10_000);

    let overflow = AddAuthenticatedDataRequest::from(offer("offer-10000"), 1, &key_pair, NOW);
    assert!(f
        .service
        .add(overflow)
        .is_rejected_with(DataStorageReason::MaxMapSizeReached));
    assert_eq!(f.service.len(), 10_000);

    // existing hashes can still be updated at capacity
    let update = AddAuthenticatedDataRequest::from(offer("offer-0"), 2, &key_pair, NOW);
    assert!(f.service.add(update).is_success());
    assert_eq!(f.service.len(), 10_000);
}

#[test]
fn load_prunes_persisted_state() {
    let key_pair = KeyPair::generate();
    let mut persisted = DataStore::new();
    let requests = [
        AddAuthenticatedDataRequest::from(offer("fresh"), 1, &key_pair, NOW - 1_000),
        AddAuthenticatedDataRequest::from(offer("expired"), 1, &key_pair, NOW - 2 * DAY_MS),
        AddAuthenticatedDataRequest::from(
            AuthenticatedPayload::new(MetaData::new(30 * DAY_MS, 1024, "Offer"), b"aged".to_vec()),
            1,
            &key_pair,
            NOW - 11 * DAY_MS,
        ),
    ];
    for request in requests {
        persisted.put(request.hash(), request.into());
    }

    let clock = ManualClock::new(NOW);
    let service = AuthenticatedDataStorageService::with_clock(
        StorageConfig::default(),
        Arc::new(MemoryPersistence::with_snapshot(persisted)),
        Arc::new(clock),
    );
    let report = service.load().expect("load store");

    assert_eq!(report.pruned_expired, 1);
    assert_eq!(report.pruned_aged, 1);
    assert_eq!(service.payloads(), vec![offer("fresh")]);
}

#[test]
fn load_caps_to_newest_entries() {
    let key_pair = KeyPair::generate();
    let mut persisted = DataStore::new();
    for i in 0..10u64 {
        let request = AddAuthenticatedDataRequest::from(offer(&format!("o{i}")), 1, &key_pair, NOW - i);
        persisted.put(request.hash(), request.into());
    }
    let config = StorageConfig {
        retention: RetentionPolicy {
            max_map_size: 4,
            ..RetentionPolicy::default()
        },
        ..StorageConfig::default()
    };
    let service = AuthenticatedDataStorageService::with_clock(
        config,
        Arc::new(MemoryPersistence::with_snapshot(persisted)),
        Arc::new(ManualClock::new(NOW)),
    );
    service.load().expect("load store");

    assert_eq!(service.len(), 4);
    let mut kept: Vec<_> = service
        .payloads()
        .into_iter()
        .map(|p| String::from_utf8(p.data).expect("utf8"))
        .collect();
    kept.sort();
    assert_eq!(kept, vec!["o0", "o1", "o2", "o3"]);
}

#[test]
fn state_survives_restart_through_json_file() {
    let temp_dir = TempDir::new().expect("tempdir");
    let persistence = Arc::new(JsonFilePersistence::in_dir(temp_dir.path(), "offers"));
    let key_pair = KeyPair::generate();
    let payload = offer("persisted");

    let service =
        AuthenticatedDataStorageService::new(StorageConfig::default(), persistence.clone());
    service.load().expect("initial load");
    let created = tradenet_types::now_millis();
    assert!(service
        .add(AddAuthenticatedDataRequest::from(payload.clone(), 1, &key_pair, created))
        .is_success());
    service.shutdown();

    let restarted = AuthenticatedDataStorageService::new(StorageConfig::default(), persistence);
    restarted.load().expect("reload");
    assert_eq!(restarted.payloads(), vec![payload.clone()]);
    assert_eq!(restarted.get_sequence_number(&payload.hash()), 1);
}

#[test]
fn panicking_listener_does_not_block_others() {
    let f = fixture();
    let panicking = Arc::new(PanickingListener {
        calls: AtomicUsize::new(0),
    });
    let second = Arc::new(RecordingListener::default());
    f.service.add_listener(panicking.clone());
    f.service.add_listener(second.clone());

    let key_pair = KeyPair::generate();
    let result = f
        .service
        .add(AddAuthenticatedDataRequest::from(offer("x"), 1, &key_pair, NOW));

    assert!(result.is_success());
    assert_eq!(panicking.calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.listener.added.lock().len(), 1);
    assert_eq!(second.added.lock().len(), 1);
}

#[test]
fn removed_listener_is_not_notified() {
    let f = fixture();
    let listener: Arc<dyn DataStorageListener> = f.listener.clone();
    f.service.remove_listener(&listener);

    let key_pair = KeyPair::generate();
    f.service
        .add(AddAuthenticatedDataRequest::from(offer("quiet"), 1, &key_pair, NOW));
    assert!(f.listener.added.lock().is_empty());
}

#[test]
fn prune_expired_reports_removed_payloads() {
    let f = fixture();
    let key_pair = KeyPair::generate();
    let short_lived = AuthenticatedPayload::new(MetaData::new(1_000, 64, "Chat"), b"hi".to_vec());
    f.service
        .add(AddAuthenticatedDataRequest::from(short_lived.clone(), 1, &key_pair, NOW));
    f.service
        .add(AddAuthenticatedDataRequest::from(offer("long"), 1, &key_pair, NOW));

    assert_eq!(f.service.prune_expired(), 0);
    f.clock.advance(1_001);
    assert_eq!(f.service.prune_expired(), 1);
    assert_eq!(*f.listener.removed.lock(), vec![short_lived]);
    assert_eq!(f.service.payloads(), vec![offer("long")]);
}

/// Writes made inside a runtime finish on the blocking pool.
async fn wait_for_writes(persistence: &MemoryPersistence, count: usize) {
    for _ in 0..500 {
        if persistence.write_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn periodic_pruning_and_deferred_persistence() {
    let f = fixture();
    f.service.start_expiry_pruning();
    let key_pair = KeyPair::generate();
    let short_lived = AuthenticatedPayload::new(MetaData::new(1_000, 64, "Chat"), b"bye".to_vec());

    f.service
        .add(AddAuthenticatedDataRequest::from(short_lived, 1, &key_pair, NOW));
    f.service
        .add(AddAuthenticatedDataRequest::from(offer("stays"), 1, &key_pair, NOW));
    wait_for_writes(&f.persistence, 1).await;
    assert_eq!(f.persistence.write_count(), 1);

    // The deferred write lands once the rate limit window has passed.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    wait_for_writes(&f.persistence, 2).await;
    assert_eq!(f.persistence.write_count(), 2);
    assert_eq!(f.persistence.snapshot().map(|s| s.len()), Some(2));

    f.clock.advance(2_000);
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(f.listener.removed.lock().len(), 1);
    assert_eq!(f.service.len(), 1);

    f.service.shutdown();
}

#[test]
fn memory_persistence_is_usable_as_trait_object() {
    let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
    assert!(persistence.load().expect("load").is_none());
    persistence.persist(&DataStore::new()).expect("persist");
    assert_eq!(persistence.load().expect("load"), Some(DataStore::new()));
}
