use chrono::{Duration, Utc};
use sync_queue::{NewRecord, QueueStore, RecordKey, RecordStatus, StoreSide, Transition};
use tempfile::tempdir;

fn new_record(entity: &str, id: &str) -> NewRecord {
    NewRecord {
        entity_type: entity.to_string(),
        id: id.to_string(),
        payload: format!(r#"{{"id":"{id}"}}"#).into_bytes(),
        encrypted: false,
        max_retries: 3,
        origin: None,
    }
}

#[test]
fn queue_persists_records_across_reopen() {
    let dir = tempdir().unwrap();
    let queue_path = dir.path().join("offline").join("queue.db");
    let store = QueueStore::open(&queue_path).unwrap();

    for idx in 0..3 {
        store
            .put(&new_record("motos", &format!("m{idx}")))
            .unwrap();
    }
    let first = store.list_pending(None, None).unwrap();
    store.mark_synced(&first[0].key(), first[0].revision).unwrap();
    drop(store);

    // Reopen to ensure durability.
    let store = QueueStore::open(&queue_path).unwrap();
    let pending = store.list_pending(None, None).unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, "m1");
    let synced = store.get(&RecordKey::new("motos", "m0")).unwrap().unwrap();
    assert_eq!(synced.status, RecordStatus::Synced);
}

#[test]
fn reenqueue_overwrites_single_record() {
    let dir = tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();

    let first = store.put(&new_record("motos", "m1")).unwrap();
    store
        .increment_retry(&first.key(), first.revision, "timeout")
        .unwrap();
    let second = store
        .put(&NewRecord {
            payload: br#"{"id":"m1","plate":"XYZ"}"#.to_vec(),
            ..new_record("motos", "m1")
        })
        .unwrap();

    assert_eq!(second.retry_count, 0);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(second.payload, br#"{"id":"m1","plate":"XYZ"}"#.to_vec());
    assert_eq!(store.stats(None).unwrap().total, 1);
}

#[test]
fn reenqueue_moves_record_to_tail() {
    let dir = tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();
    store.put(&new_record("motos", "a")).unwrap();
    store.put(&new_record("motos", "b")).unwrap();
    store.put(&new_record("motos", "a")).unwrap();

    let order: Vec<String> = store
        .list_pending(None, None)
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(order, vec!["b".to_string(), "a".to_string()]);
}

#[test]
fn retries_are_bounded_by_max_retries() {
    let dir = tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();
    let rec = store.put(&new_record("motos", "m1")).unwrap();

    let mut statuses = vec![rec.status];
    for _ in 0..3 {
        match store
            .increment_retry(&rec.key(), rec.revision, "network unreachable")
            .unwrap()
        {
            Transition::Applied { status, .. } => statuses.push(status),
            Transition::Stale => panic!("transition unexpectedly stale"),
        }
    }
    assert_eq!(
        statuses,
        vec![
            RecordStatus::Pending,
            RecordStatus::Pending,
            RecordStatus::Pending,
            RecordStatus::Failed
        ]
    );

    // A failed record no longer accepts retries.
    assert_eq!(
        store
            .increment_retry(&rec.key(), rec.revision, "again")
            .unwrap(),
        Transition::Stale
    );
    let stored = store.get(&rec.key()).unwrap().unwrap();
    assert_eq!(stored.retry_count, 3);
    assert_eq!(stored.last_error.as_deref(), Some("network unreachable"));
}

#[test]
fn purge_only_removes_old_synced_records() {
    let dir = tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();
    let synced = store.put(&new_record("motos", "s")).unwrap();
    let failed = store.put(&new_record("motos", "f")).unwrap();
    store.put(&new_record("motos", "p")).unwrap();
    store.mark_synced(&synced.key(), synced.revision).unwrap();
    store
        .mark_failed(&failed.key(), failed.revision, "denied")
        .unwrap();

    // Nothing is old enough yet.
    let purged = store
        .purge_synced_before(Utc::now() - Duration::days(7))
        .unwrap();
    assert_eq!(purged, 0);

    let purged = store
        .purge_synced_before(Utc::now() + Duration::seconds(1))
        .unwrap();
    assert_eq!(purged, 1);

    let stats = store.stats(None).unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.synced, 0);
}

#[test]
fn manual_retry_resets_failed_record() {
    let dir = tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();
    let rec = store.put(&new_record("motos", "m1")).unwrap();
    store.mark_failed(&rec.key(), rec.revision, "denied").unwrap();

    let reset = store.reset_for_retry(&rec.key()).unwrap().unwrap();
    assert_eq!(reset.status, RecordStatus::Pending);
    assert_eq!(reset.retry_count, 0);
    assert!(reset.last_error.is_none());
    assert!(reset.revision > rec.revision);

    // Only failed records can be reset.
    assert!(store.reset_for_retry(&rec.key()).unwrap().is_none());
}

#[test]
fn stats_and_pending_filter_by_entity_type() {
    let dir = tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();
    store.put(&new_record("motos", "m1")).unwrap();
    store.put(&new_record("vendors", "v1")).unwrap();
    store.put(&new_record("vendors", "v2")).unwrap();

    assert_eq!(store.list_pending(Some("vendors"), None).unwrap().len(), 2);
    assert_eq!(store.list_pending(None, Some(1)).unwrap().len(), 1);
    assert_eq!(store.stats(Some("motos")).unwrap().pending, 1);
    assert_eq!(store.stats(None).unwrap().total, 3);

    let history = store.history(10).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].id, "v2");
}

#[test]
fn entity_types_with_underscores_keep_separate_records() {
    let dir = tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();
    store
        .put(&NewRecord {
            payload: br#"{"who":"first"}"#.to_vec(),
            ..new_record("user_profile", "x")
        })
        .unwrap();
    let second = store
        .put(&NewRecord {
            payload: br#"{"who":"second"}"#.to_vec(),
            ..new_record("user", "profile_x")
        })
        .unwrap();

    assert_eq!(second.entity_type, "user");
    assert_eq!(second.id, "profile_x");
    assert_eq!(second.revision, 1);
    assert_eq!(store.stats(None).unwrap().total, 2);
    let first = store
        .get(&RecordKey::new("user_profile", "x"))
        .unwrap()
        .unwrap();
    assert_eq!(first.payload, br#"{"who":"first"}"#.to_vec());
}

#[test]
fn replica_deferral_keeps_pending_local_write() {
    let dir = tempdir().unwrap();
    let store = QueueStore::open(dir.path().join("queue.db")).unwrap();
    let local = store
        .put(&NewRecord {
            payload: br#"{"id":"m1","owner":"local"}"#.to_vec(),
            ..new_record("motos", "m1")
        })
        .unwrap();
    let replica = NewRecord {
        payload: br#"{"id":"m1","owner":"remote"}"#.to_vec(),
        origin: Some(StoreSide::B),
        ..new_record("motos", "m1")
    };

    assert!(store.put_unless_local_pending(&replica).unwrap().is_none());
    let kept = store.get(&local.key()).unwrap().unwrap();
    assert_eq!(kept.origin, None);
    assert_eq!(kept.revision, local.revision);
    assert_eq!(kept.payload, br#"{"id":"m1","owner":"local"}"#.to_vec());

    // Once the local write is delivered the slot is free again.
    store.mark_synced(&local.key(), local.revision).unwrap();
    let deferred = store.put_unless_local_pending(&replica).unwrap().unwrap();
    assert_eq!(deferred.origin, Some(StoreSide::B));
    assert_eq!(deferred.status, RecordStatus::Pending);

    // A pending deferral is itself replaceable by a newer one.
    let newer = store
        .put_unless_local_pending(&NewRecord {
            origin: Some(StoreSide::A),
            ..replica.clone()
        })
        .unwrap()
        .unwrap();
    assert_eq!(newer.origin, Some(StoreSide::A));
    assert_eq!(newer.revision, deferred.revision + 1);
}
