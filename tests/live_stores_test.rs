// ABOUTME: Integration tests against real MongoDB and PostgreSQL servers
// ABOUTME: Run with TEST_MONGO_URL and TEST_POSTGRES_URL set and --ignored

use std::env;
use std::sync::Arc;
use std::time::Duration;

use dual_replicator::store::{ChangeKind, DocumentStore, RelationalStore, RemoteStore, StoreTarget};
use dual_replicator::{
    Codec, Envelope, EngineConfig, QueueStore, ReplicationEngine, StoreSide, SyncConfig,
    SyncRegistry,
};
use serde_json::json;

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let mongo = env::var("TEST_MONGO_URL").ok()?;
    let postgres = env::var("TEST_POSTGRES_URL").ok()?;
    Some((mongo, postgres))
}

/// Unique name so parallel runs do not collide
fn test_name(suffix: &str) -> String {
    format!(
        "dr_test_{}_{}",
        suffix,
        uuid::Uuid::new_v4().simple().to_string().get(..8).unwrap_or("x")
    )
}

async fn next_change(
    feed: &mut dual_replicator::store::ChangeFeed,
) -> dual_replicator::store::StoreChange {
    tokio::time::timeout(Duration::from_secs(10), feed.next())
        .await
        .expect("no change within 10s")
        .expect("feed closed")
}

#[tokio::test]
#[ignore]
async fn relational_store_crud_and_notifications() {
    let Some((_, postgres_url)) = get_test_urls() else {
        println!("Skipping: TEST_MONGO_URL and TEST_POSTGRES_URL not set");
        return;
    };
    let store = RelationalStore::connect(&postgres_url, false).await.unwrap();
    let table = test_name("pg");
    let target = StoreTarget {
        name: &table,
        key_field: "id",
    };
    store.ensure_table(target).await.unwrap();
    let mut feed = store.subscribe(target).await.unwrap();

    let envelope = Envelope::tagged(json!({"id": "m1", "plate": "X"}), StoreSide::A);
    store.upsert(target, "m1", &envelope).await.unwrap();
    let stored = store.get(target, "m1").await.unwrap().unwrap();
    assert_eq!(stored, envelope);

    let change = next_change(&mut feed).await;
    assert_eq!(change.kind, ChangeKind::Insert);
    assert_eq!(change.id, "m1");
    assert!(change.envelope.unwrap().is_replica_from(StoreSide::A));

    store.upsert(target, "m2", &Envelope::untagged(json!({"id": "m2"}))).await.unwrap();
    let page = store.fetch_page(target, Some("m1"), 10).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].0, "m2");

    assert!(store.delete(target, "m1").await.unwrap());
    assert!(!store.delete(target, "m1").await.unwrap());
}

#[tokio::test]
#[ignore]
async fn document_store_crud_and_change_stream() {
    // Change streams need a replica set.
    let Some((mongo_url, _)) = get_test_urls() else {
        println!("Skipping: TEST_MONGO_URL and TEST_POSTGRES_URL not set");
        return;
    };
    let store = DocumentStore::connect(&mongo_url, "dual_replicator_test")
        .await
        .unwrap();
    let collection = test_name("mongo");
    let target = StoreTarget {
        name: &collection,
        key_field: "id",
    };
    store.ensure_collection(target).await.unwrap();
    let mut feed = store.subscribe(target).await.unwrap();

    let envelope = Envelope::untagged(json!({"id": "m1", "plate": "X", "km": 1200}));
    store.upsert(target, "m1", &envelope).await.unwrap();
    let stored = store.get(target, "m1").await.unwrap().unwrap();
    assert_eq!(stored.payload, envelope.payload);

    let change = next_change(&mut feed).await;
    assert_eq!(change.id, "m1");
    assert_eq!(change.envelope.unwrap().payload["plate"], json!("X"));

    assert!(store.delete(target, "m1").await.unwrap());
    let change = next_change(&mut feed).await;
    assert_eq!(change.kind, ChangeKind::Delete);
    assert_eq!(change.id, "m1");
}

#[tokio::test]
#[ignore]
async fn postgres_write_reaches_mongo_once() {
    let Some((mongo_url, postgres_url)) = get_test_urls() else {
        println!("Skipping: TEST_MONGO_URL and TEST_POSTGRES_URL not set");
        return;
    };
    let name = test_name("e2e");
    let config = SyncConfig::new("motos", name.clone(), name.clone());

    let store_a = Arc::new(
        DocumentStore::connect(&mongo_url, "dual_replicator_test")
            .await
            .unwrap(),
    );
    let store_b = Arc::new(RelationalStore::connect(&postgres_url, false).await.unwrap());
    store_a.ensure_collection(config.target(StoreSide::A)).await.unwrap();
    store_b.ensure_table(config.target(StoreSide::B)).await.unwrap();

    let engine = Arc::new(ReplicationEngine::new(
        Arc::new(SyncRegistry::new(vec![config.clone()]).unwrap()),
        Codec::without_key(),
        Arc::new(QueueStore::open_in_memory().unwrap()),
        store_a.clone(),
        store_b.clone(),
        EngineConfig::default(),
    ));
    let sub_a = engine.subscribe_to_store_a_changes("motos", |_| {}).await.unwrap();
    let sub_b = engine.subscribe_to_store_b_changes("motos", |_| {}).await.unwrap();

    let record = Envelope::untagged(json!({"id": "m1", "plate": "PG-1"}));
    store_b
        .upsert(config.target(StoreSide::B), "m1", &record)
        .await
        .unwrap();

    let mut replica = None;
    for _ in 0..100 {
        replica = store_a.get(config.target(StoreSide::A), "m1").await.unwrap();
        if replica.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let replica = replica.expect("record never reached store A");
    assert!(replica.is_replica_from(StoreSide::B));

    // The echo from store A must not rewrite store B's row.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let original = store_b
        .get(config.target(StoreSide::B), "m1")
        .await
        .unwrap()
        .unwrap();
    assert!(!original.provenance.is_tagged());

    sub_a.cancel().await;
    sub_b.cancel().await;
}
