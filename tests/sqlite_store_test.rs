//! SQLite store behavior: persistence semantics the in-memory store also
//! guarantees, exercised against real SQL.

mod common;

use common::*;
use chrono::Duration;
use uuid::Uuid;

use pdv_sync::domain::{ChangeRecord, DeviceId, EntityKind, Origin, SyncCursor};
use pdv_sync::error::SyncError;
use pdv_sync::store::{
    ChangeLedger, CommittedChange, SnapshotStore, SqliteStore, SyncStore,
};

async fn memory_store() -> SqliteStore {
    SqliteStore::connect("sqlite::memory:").await.unwrap()
}

fn committed_create(entity_id: Uuid, name: &str) -> CommittedChange {
    let mut pdv = test_pdv(entity_id);
    pdv.name = name.to_string();
    let mut record = ChangeRecord::create(
        EntityKind::Pdv,
        entity_id,
        serde_json::to_value(&pdv).unwrap(),
        Origin::server(),
        t0(),
    );
    record.version = Some(1);
    record.recorded_at = Some(t0());
    CommittedChange {
        record,
        expected_version: None,
    }
}

fn committed_update(
    entity_id: Uuid,
    name: &str,
    base: u64,
    recorded_at: chrono::DateTime<chrono::Utc>,
) -> CommittedChange {
    let mut pdv = test_pdv(entity_id);
    pdv.name = name.to_string();
    let mut record = ChangeRecord::update(
        EntityKind::Pdv,
        entity_id,
        serde_json::to_value(&pdv).unwrap(),
        base,
        Origin::server(),
        recorded_at,
    );
    record.version = Some(base + 1);
    record.recorded_at = Some(recorded_at);
    CommittedChange {
        record,
        expected_version: Some(base),
    }
}

#[tokio::test]
async fn commit_assigns_monotonic_sequences_and_updates_snapshots() {
    let store = memory_store().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let applied = store
        .commit(vec![committed_create(a, "A"), committed_create(b, "B")])
        .await
        .unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0].sequence, 1);
    assert_eq!(applied[1].sequence, 2);
    assert_eq!(store.head_sequence().await.unwrap(), 2);

    let snapshot = store
        .get_snapshot(EntityKind::Pdv, a)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.version, 1);
    assert!(!snapshot.deleted);
    assert_eq!(store.list_snapshots(EntityKind::Pdv).await.unwrap().len(), 2);
}

#[tokio::test]
async fn cas_mismatch_rolls_back_the_whole_batch() {
    let store = memory_store().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    store.commit(vec![committed_create(a, "A")]).await.unwrap();

    // Second write in the batch expects version 3 but the entity is at 1.
    let err = store
        .commit(vec![
            committed_create(b, "B"),
            committed_update(a, "A2", 3, t0()),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::StorageCommit(_)), "got {err:?}");

    // Neither write survived.
    assert!(store.get_snapshot(EntityKind::Pdv, b).await.unwrap().is_none());
    assert_eq!(store.head_sequence().await.unwrap(), 1);
    let a_snapshot = store
        .get_snapshot(EntityKind::Pdv, a)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a_snapshot.version, 1);
}

#[tokio::test]
async fn changes_since_filters_by_cursor_and_kind() {
    let store = memory_store().await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    store
        .commit(vec![committed_create(a, "A"), committed_create(b, "B")])
        .await
        .unwrap();
    store
        .commit(vec![committed_update(a, "A2", 1, t0())])
        .await
        .unwrap();

    let all = store
        .changes_since(0, &EntityKind::ALL, 100)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let tail = store
        .changes_since(2, &[EntityKind::Pdv], 100)
        .await
        .unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].entity_id, a);
    assert_eq!(tail[0].version, Some(2));

    let visits_only = store
        .changes_since(0, &[EntityKind::Visit], 100)
        .await
        .unwrap();
    assert!(visits_only.is_empty());

    let counts = store.pending_counts_since(0).await.unwrap();
    assert_eq!(counts[&EntityKind::Pdv], 3);
}

#[tokio::test]
async fn duplicate_change_id_is_detected() {
    let store = memory_store().await;
    let a = Uuid::new_v4();
    let write = committed_create(a, "A");
    let change_id = write.record.change_id;

    store.commit(vec![write]).await.unwrap();
    assert!(store.change_exists(change_id).await.unwrap());
    assert!(!store.change_exists(Uuid::new_v4()).await.unwrap());
}

#[tokio::test]
async fn tombstone_marks_snapshot_deleted_but_stays_listed_in_ledger() {
    let store = memory_store().await;
    let a = Uuid::new_v4();
    store.commit(vec![committed_create(a, "A")]).await.unwrap();

    let mut record = ChangeRecord::delete(EntityKind::Pdv, a, 1, Origin::server(), t0());
    record.version = Some(2);
    record.recorded_at = Some(t0());
    store
        .commit(vec![CommittedChange {
            record,
            expected_version: Some(1),
        }])
        .await
        .unwrap();

    let snapshot = store
        .get_snapshot(EntityKind::Pdv, a)
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.deleted);
    assert_eq!(snapshot.version, 2);

    // Live listings exclude it; the ledger still carries the tombstone.
    assert!(store.list_snapshots(EntityKind::Pdv).await.unwrap().is_empty());
    let changes = store.changes_since(1, &EntityKind::ALL, 10).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert!(changes[0].is_tombstone());
}

#[tokio::test]
async fn pruning_advances_the_retained_floor() {
    let store = memory_store().await;
    let a = Uuid::new_v4();
    store.commit(vec![committed_create(a, "A")]).await.unwrap();
    store
        .commit(vec![committed_update(a, "A2", 1, t0() + Duration::days(40))])
        .await
        .unwrap();

    assert_eq!(store.retained_floor().await.unwrap(), 1);
    let pruned = store
        .prune_recorded_before(t0() + Duration::days(10))
        .await
        .unwrap();
    assert_eq!(pruned, 1);
    assert_eq!(store.retained_floor().await.unwrap(), 2);

    // The surviving entry is still served.
    let changes = store.changes_since(1, &EntityKind::ALL, 10).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].sequence, Some(2));
}

#[tokio::test]
async fn sqlite_outbox_queues_pushes_and_tracks_the_cursor() {
    use pdv_sync::store::{DeviceQueue, SqliteOutbox};

    let outbox = SqliteOutbox::connect("sqlite::memory:").await.unwrap();
    let device = DeviceId::new("device-sqlite");

    let visit_id = Uuid::new_v4();
    let visit = test_visit(visit_id, test_pdv_id(), pdv_location(), true);
    let record = create_record(EntityKind::Visit, visit_id, &visit, &device);
    let other_id = Uuid::new_v4();
    let other = create_record(
        EntityKind::Visit,
        other_id,
        &test_visit(other_id, test_pdv_id(), pdv_location(), true),
        &device,
    );
    outbox.enqueue_batch(&[record.clone(), other.clone()]).await.unwrap();

    let pending = outbox.pending().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].change_id, record.change_id, "oldest first");
    assert_eq!(pending[0].payload, record.payload);

    outbox.mark_pushed(&[record.change_id]).await.unwrap();
    let pending = outbox.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].change_id, other.change_id);

    // A rejected change is parked: out of pending, listed as failed.
    outbox.mark_failed(&[other.change_id]).await.unwrap();
    assert!(outbox.pending().await.unwrap().is_empty());
    let failed = outbox.failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].change_id, other.change_id);

    assert_eq!(outbox.cursor().await.unwrap(), 0);
    outbox.store_cursor(42).await.unwrap();
    assert_eq!(outbox.cursor().await.unwrap(), 42);
}

#[tokio::test]
async fn cursors_round_trip_per_device() {
    let store = memory_store().await;
    let device = DeviceId::new("device-sqlite");

    assert!(store.get_cursor(&device).await.unwrap().is_none());

    store
        .set_cursor(&SyncCursor {
            device_id: device.clone(),
            last_sequence: 7,
            acked_at: t0(),
        })
        .await
        .unwrap();
    let cursor = store.get_cursor(&device).await.unwrap().unwrap();
    assert_eq!(cursor.last_sequence, 7);

    // Re-acking overwrites in place.
    store
        .set_cursor(&SyncCursor {
            device_id: device.clone(),
            last_sequence: 9,
            acked_at: t0() + Duration::minutes(5),
        })
        .await
        .unwrap();
    let cursor = store.get_cursor(&device).await.unwrap().unwrap();
    assert_eq!(cursor.last_sequence, 9);

    assert!(store
        .get_cursor(&DeviceId::new("device-other"))
        .await
        .unwrap()
        .is_none());
}
