//! End-to-end sync sessions: client driver, cursors, retention, and
//! session lifecycle.

mod common;

use common::*;
use uuid::Uuid;

use pdv_sync::clock::Clock;
use pdv_sync::domain::{DeviceId, EntityKind};
use pdv_sync::error::SyncError;
use pdv_sync::reconcile::ConflictPolicy;
use pdv_sync::session::{InProcessTransport, SessionPhase, SyncClient, SyncTransport};
use pdv_sync::store::{ChangeLedger, DeviceQueue, MemoryOutbox, SnapshotStore};

#[tokio::test]
async fn full_session_downloads_uploads_and_acks() {
    let (service, store, _clock) = test_service(ConflictPolicy::ServerWins);
    seed_reference_data(&service).await;

    let device = test_device();
    let client = SyncClient::new(
        device.clone(),
        MemoryOutbox::new(),
        InProcessTransport::new(service.clone()),
    );

    // One locally authored visit waits in the outbox.
    let visit_id = Uuid::new_v4();
    let visit = test_visit(visit_id, test_pdv_id(), pdv_location(), true);
    client
        .queue()
        .enqueue(&create_record(EntityKind::Visit, visit_id, &visit, &device))
        .await
        .unwrap();

    let report = client.sync().await.unwrap();

    // Downloaded the seeded PDV and agent, pushed the visit, acked.
    assert_eq!(report.downloaded, 2);
    let receipt = report.receipt.unwrap();
    assert_eq!(receipt.accepted.len(), 1);
    assert!(receipt.conflicts.is_empty());

    // The outbox is drained and the session is closed.
    assert!(client.queue().pending().await.unwrap().is_empty());
    assert_eq!(service.session_phase(&device).await, None);

    // Server state reflects the visit at version 1.
    let snapshot = store
        .get_snapshot(EntityKind::Visit, visit_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.version, 1);

    // The local projection holds the downloaded PDV.
    assert!(client
        .queue()
        .remote_record(EntityKind::Pdv, test_pdv_id())
        .await
        .is_some());
}

#[tokio::test]
async fn second_session_picks_up_other_devices_changes() {
    let (service, _store, _clock) = test_service(ConflictPolicy::ServerWins);
    seed_reference_data(&service).await;

    let device_a = DeviceId::new("device-a");
    let client_a = SyncClient::new(
        device_a.clone(),
        MemoryOutbox::new(),
        InProcessTransport::new(service.clone()),
    );
    client_a.sync().await.unwrap();

    // Device B uploads a visit.
    let device_b = DeviceId::new("device-b");
    let client_b = SyncClient::new(
        device_b.clone(),
        MemoryOutbox::new(),
        InProcessTransport::new(service.clone()),
    );
    let visit_id = Uuid::new_v4();
    let visit = test_visit(visit_id, test_pdv_id(), pdv_location(), true);
    client_b
        .queue()
        .enqueue(&create_record(EntityKind::Visit, visit_id, &visit, &device_b))
        .await
        .unwrap();
    client_b.sync().await.unwrap();

    // A's next session sees exactly B's visit, nothing re-downloaded.
    let report = client_a.sync().await.unwrap();
    assert_eq!(report.downloaded, 1);
    assert!(client_a
        .queue()
        .remote_record(EntityKind::Visit, visit_id)
        .await
        .is_some());

    // And a third session has nothing new at all.
    let report = client_a.sync().await.unwrap();
    assert_eq!(report.downloaded, 0);
    assert!(report.receipt.is_none());
}

#[tokio::test]
async fn check_recommends_sync_above_threshold() {
    let (service, _store, _clock) = test_service(ConflictPolicy::ServerWins);
    seed_reference_data(&service).await;
    let device = test_device();

    let report = service.check(&device, 0).await.unwrap();
    assert_eq!(report.pending_total(), 2, "seed pdv + agent");
    assert!(!report.recommended, "2 changes stay under the threshold");

    // Push the pending total past the threshold with more PDVs.
    for i in 0..11 {
        let mut pdv = test_pdv(Uuid::new_v4());
        pdv.name = format!("Boutique {i}");
        let record = pdv_sync::domain::ChangeRecord::create(
            EntityKind::Pdv,
            pdv.id,
            serde_json::to_value(&pdv).unwrap(),
            pdv_sync::domain::Origin::server(),
            t0(),
        );
        service.apply_server_change(record).await.unwrap();
    }

    let report = service.check(&device, 0).await.unwrap();
    assert_eq!(report.pending_total(), 13);
    assert!(report.recommended);
    assert_eq!(report.pending[&EntityKind::Pdv], 12);
    assert_eq!(report.pending[&EntityKind::Agent], 1);
}

#[tokio::test]
async fn cursor_older_than_retention_requires_full_resync() {
    let (service, store, clock) = test_service(ConflictPolicy::ServerWins);
    seed_reference_data(&service).await;
    let device = test_device();

    // The device syncs up to the head, then goes dark.
    let report = service.check(&device, 0).await.unwrap();
    let batch = service
        .download(&device, 0, &EntityKind::ALL)
        .await
        .unwrap();
    service.ack(&device, batch.new_cursor).await.unwrap();
    let dark_cursor = batch.new_cursor;
    assert_eq!(dark_cursor, report.head_sequence);

    // More changes land while the device is still reachable...
    for i in 0..3 {
        let mut pdv = test_pdv(Uuid::new_v4());
        pdv.name = format!("Tablier {i}");
        let record = pdv_sync::domain::ChangeRecord::create(
            EntityKind::Pdv,
            pdv.id,
            serde_json::to_value(&pdv).unwrap(),
            pdv_sync::domain::Origin::server(),
            clock.now(),
        );
        service.apply_server_change(record).await.unwrap();
    }

    // ...then months pass, newer writes arrive, and retention prunes
    // everything the dark device never saw from its watermark onward.
    clock.advance(chrono::Duration::days(45));
    for i in 0..5 {
        let mut pdv = test_pdv(Uuid::new_v4());
        pdv.name = format!("Kiosque {i}");
        let record = pdv_sync::domain::ChangeRecord::create(
            EntityKind::Pdv,
            pdv.id,
            serde_json::to_value(&pdv).unwrap(),
            pdv_sync::domain::Origin::server(),
            clock.now(),
        );
        service.apply_server_change(record).await.unwrap();
    }
    let pruned = service.prune_ledger().await.unwrap();
    assert_eq!(pruned, 5, "seed and pre-gap records fell out of the window");
    assert!(store.retained_floor().await.unwrap() > dark_cursor + 1);

    // The dark device comes back with its old cursor.
    service.check(&device, dark_cursor).await.unwrap();
    let err = service
        .download(&device, dark_cursor, &EntityKind::ALL)
        .await
        .unwrap_err();
    assert!(
        matches!(err, SyncError::StaleCursor { cursor, .. } if cursor == dark_cursor),
        "expected StaleCursor, got {err:?}"
    );

    // Full resync from cursor 0 bootstraps from snapshots: every live
    // entity arrives once, including those whose ledger entries are gone.
    service.check(&device, 0).await.unwrap();
    let batch = service.download(&device, 0, &EntityKind::ALL).await.unwrap();
    assert_eq!(batch.changes.len(), 10, "9 pdvs + 1 agent");
    assert!(!batch.has_more);
    assert_eq!(batch.new_cursor, store.head_sequence().await.unwrap());
    service.ack(&device, batch.new_cursor).await.unwrap();
}

#[tokio::test]
async fn out_of_order_phases_are_rejected() {
    let (service, _store, _clock) = test_service(ConflictPolicy::ServerWins);
    seed_reference_data(&service).await;
    let device = test_device();

    // ACK without any session.
    let err = service.ack(&device, 0).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidSessionPhase { .. }));

    // ACK straight after CHECK (skipping download and upload).
    service.check(&device, 0).await.unwrap();
    let err = service.ack(&device, 0).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidSessionPhase { .. }));

    // A restart at CHECK is always allowed.
    service.check(&device, 0).await.unwrap();
    assert_eq!(
        service.session_phase(&device).await,
        Some(SessionPhase::Check)
    );
}

#[tokio::test]
async fn abandoned_session_expires_and_device_restarts() {
    let (service, _store, clock) = test_service(ConflictPolicy::ServerWins);
    seed_reference_data(&service).await;
    let device = test_device();

    service.check(&device, 0).await.unwrap();
    service.download(&device, 0, &EntityKind::ALL).await.unwrap();
    assert_eq!(
        service.session_phase(&device).await,
        Some(SessionPhase::Download)
    );

    clock.advance(chrono::Duration::minutes(20));
    assert_eq!(service.expire_stale_sessions().await, 1);
    assert_eq!(service.session_phase(&device).await, None);

    // The cursor never moved, so a fresh session replays the download.
    assert_eq!(service.acked_cursor(&device).await.unwrap(), 0);
    service.check(&device, 0).await.unwrap();
    let batch = service.download(&device, 0, &EntityKind::ALL).await.unwrap();
    assert_eq!(batch.changes.len(), 2);
}

#[tokio::test]
async fn interrupted_upload_is_safe_to_retry_end_to_end() {
    let (service, store, _clock) = test_service(ConflictPolicy::ServerWins);
    seed_reference_data(&service).await;
    let device = test_device();

    let outbox = MemoryOutbox::new();
    let visit_id = Uuid::new_v4();
    let visit = test_visit(visit_id, test_pdv_id(), pdv_location(), true);
    outbox
        .enqueue(&create_record(EntityKind::Visit, visit_id, &visit, &device))
        .await
        .unwrap();

    // First attempt: the upload commits server-side but the receipt is
    // lost before the client can mark anything pushed or ack.
    let transport = InProcessTransport::new(service.clone());
    service.check(&device, 0).await.unwrap();
    service.download(&device, 0, &EntityKind::ALL).await.unwrap();
    let lost_receipt = transport
        .upload(&device, outbox.pending().await.unwrap())
        .await
        .unwrap();
    assert_eq!(lost_receipt.accepted.len(), 1);
    drop(lost_receipt);

    // The retry runs a whole fresh session over the same outbox.
    let client = SyncClient::new(device.clone(), outbox, transport);
    let report = client.sync().await.unwrap();
    let receipt = report.receipt.unwrap();
    assert!(receipt.accepted.is_empty());
    assert_eq!(receipt.already_applied.len(), 1, "server deduplicated the replay");
    assert!(client.queue().pending().await.unwrap().is_empty());

    let snapshot = store
        .get_snapshot(EntityKind::Visit, visit_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.version, 1, "exactly one committed copy");
}

#[tokio::test]
async fn rejected_change_is_parked_instead_of_retried_forever() {
    let (service, store, _clock) = test_service(ConflictPolicy::ServerWins);
    seed_reference_data(&service).await;
    let device = test_device();

    let client = SyncClient::new(
        device.clone(),
        MemoryOutbox::new(),
        InProcessTransport::new(service.clone()),
    );

    // A visit no amount of retrying can fix.
    let visit_id = Uuid::new_v4();
    let mut visit = test_visit(visit_id, test_pdv_id(), pdv_location(), true);
    visit.gps_precision_m = -3.0;
    client
        .queue()
        .enqueue(&create_record(EntityKind::Visit, visit_id, &visit, &device))
        .await
        .unwrap();

    let report = client.sync().await.unwrap();
    assert_eq!(report.receipt.unwrap().rejected.len(), 1);

    // The record left the pending queue and is parked for review.
    assert!(client.queue().pending().await.unwrap().is_empty());
    let failed = client.queue().failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].entity_id, visit_id);

    // The next session uploads nothing and the server never saw the record.
    let report = client.sync().await.unwrap();
    assert!(report.receipt.is_none());
    assert!(store
        .get_snapshot(EntityKind::Visit, visit_id)
        .await
        .unwrap()
        .is_none());
}
