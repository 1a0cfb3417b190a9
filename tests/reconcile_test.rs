// ABOUTME: Full-sync tests over in-memory stores with a paused clock
// ABOUTME: Verifies pacing, idempotence, direction filtering and failure accounting

use std::sync::Arc;
use std::time::Duration;

use dual_replicator::store::{Fault, MemoryStore};
use dual_replicator::{
    Codec, Direction, EngineConfig, Flow, QueueStore, ReconcileConfig, Reconciler,
    ReplicationEngine, StoreSide, SyncConfig, SyncRegistry,
};
use serde_json::json;

struct Fixture {
    a: Arc<MemoryStore>,
    b: Arc<MemoryStore>,
    reconciler: Reconciler,
}

fn fixture(configs: Vec<SyncConfig>) -> Fixture {
    let a = Arc::new(MemoryStore::new(StoreSide::A));
    let b = Arc::new(MemoryStore::new(StoreSide::B));
    let engine = Arc::new(ReplicationEngine::new(
        Arc::new(SyncRegistry::new(configs).unwrap()),
        Codec::without_key(),
        Arc::new(QueueStore::open_in_memory().unwrap()),
        a.clone(),
        b.clone(),
        EngineConfig::default(),
    ));
    Fixture {
        a,
        b,
        reconciler: Reconciler::new(engine, ReconcileConfig::default()),
    }
}

fn seed(store: &MemoryStore, collection: &str, count: usize) {
    for idx in 0..count {
        let id = format!("item-{idx:04}");
        store.write_direct(collection, &id, json!({"id": id, "n": idx}));
    }
}

#[tokio::test(start_paused = true)]
async fn full_sync_processes_every_item_with_pacing() {
    let f = fixture(vec![SyncConfig::new("motos", "motos", "motos")]);
    seed(&f.a, "motos", 250);

    let started = tokio::time::Instant::now();
    let report = f.reconciler.full_sync(Flow::AtoB).await;
    let elapsed = started.elapsed();

    assert_eq!(report.items_processed(), 250);
    assert_eq!(report.success, 250);
    assert_eq!(report.failed, 0);
    assert!(report.is_clean());
    assert_eq!(report.entities[0].written, 250);
    assert!(elapsed >= Duration::from_secs(25), "elapsed {:?}", elapsed);

    assert_eq!(f.b.len("motos"), 250);
    let copy = f.b.raw("motos", "item-0042").unwrap();
    assert_eq!(copy.payload, json!({"id": "item-0042", "n": 42}));
    assert!(copy.is_replica_from(StoreSide::A));
}

#[tokio::test(start_paused = true)]
async fn second_pass_writes_nothing() {
    let f = fixture(vec![SyncConfig::new("motos", "motos", "motos")]);
    seed(&f.b, "motos", 30);

    f.reconciler.full_sync(Flow::BtoA).await;
    let writes = f.a.write_count();
    let report = f.reconciler.full_sync(Flow::BtoA).await;

    assert_eq!(report.success, 30);
    assert_eq!(report.entities[0].written, 0);
    assert_eq!(f.a.write_count(), writes);
}

#[tokio::test(start_paused = true)]
async fn differing_destination_rows_are_overwritten() {
    let f = fixture(vec![SyncConfig::new("motos", "motos", "motos")]);
    seed(&f.a, "motos", 3);
    f.b.write_direct("motos", "item-0001", json!({"id": "item-0001", "n": 99}));

    let report = f.reconciler.full_sync(Flow::AtoB).await;
    assert_eq!(report.success, 3);
    assert_eq!(f.b.raw("motos", "item-0001").unwrap().payload["n"], json!(1));
}

#[tokio::test(start_paused = true)]
async fn only_compatible_entity_types_are_synced() {
    let f = fixture(vec![
        SyncConfig::new("motos", "motos", "motos").with_direction(Direction::AtoB),
        SyncConfig::new("vendors", "vendors", "vendor_profiles").with_direction(Direction::BtoA),
        SyncConfig::new("parts", "parts", "parts"),
    ]);
    seed(&f.a, "motos", 2);
    seed(&f.a, "vendors", 2);
    seed(&f.a, "parts", 2);

    let report = f.reconciler.full_sync(Flow::AtoB).await;
    let mut synced: Vec<&str> = report
        .entities
        .iter()
        .map(|e| e.entity_type.as_str())
        .collect();
    synced.sort();
    assert_eq!(synced, vec!["motos", "parts"]);
    assert_eq!(report.success, 4);
    assert!(f.b.is_empty("vendor_profiles"));
}

#[tokio::test(start_paused = true)]
async fn item_failures_are_counted_and_the_pass_continues() {
    let f = fixture(vec![SyncConfig::new("motos", "motos", "motos")]);
    seed(&f.a, "motos", 5);
    f.b.set_fault(Some(Fault::AccessDenied));

    let report = f.reconciler.full_sync(Flow::AtoB).await;
    assert_eq!(report.success, 0);
    assert_eq!(report.failed, 5);
    assert!(!report.is_clean());
}

#[tokio::test(start_paused = true)]
async fn unreadable_source_stops_the_entity() {
    let f = fixture(vec![SyncConfig::new("motos", "motos", "motos")]);
    seed(&f.a, "motos", 5);
    f.a.set_fault(Some(Fault::Unreachable));

    let report = f.reconciler.full_sync(Flow::AtoB).await;
    assert_eq!(report.items_processed(), 0);
    assert_eq!(report.errors().count(), 1);
    assert!(f.b.is_empty("motos"));
}
