//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use pdv_sync::clock::ManualClock;
use pdv_sync::domain::{
    Agent, CategoryCompliance, ChangeRecord, ComplianceState, DeviceId, EntityKind, Origin,
    PointOfSale, PdvSubCategory, ProductCategory, ProductLine, SyncStatus, Visit,
};
use pdv_sync::geo::GeoPoint;
use pdv_sync::reconcile::ConflictPolicy;
use pdv_sync::session::{SyncConfig, SyncService};
use pdv_sync::store::MemoryStore;

/// Test PDV ID
pub fn test_pdv_id() -> Uuid {
    Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap()
}

/// Test agent ID
pub fn test_agent_id() -> Uuid {
    Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap()
}

/// PDV reference location used across scenarios (Abidjan area).
pub fn pdv_location() -> GeoPoint {
    GeoPoint::new(5.2950, -3.9967)
}

/// A point roughly `meters` north of `from` (1 degree latitude ~ 111,195 m).
pub fn point_north_of(from: GeoPoint, meters: f64) -> GeoPoint {
    GeoPoint::new(from.latitude + meters / 111_195.0, from.longitude)
}

pub fn test_device() -> DeviceId {
    DeviceId::new("device-test-1")
}

/// A fixed, deterministic wall-clock start for manual-clock tests.
pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn test_pdv(id: Uuid) -> PointOfSale {
    PointOfSale {
        id,
        name: "Superette Koumassi 12".to_string(),
        channel: "retail".to_string(),
        sub_category: PdvSubCategory::Superette,
        region: "Sud".to_string(),
        territory: "Abidjan".to_string(),
        zone: "Koumassi".to_string(),
        sector: "K-04".to_string(),
        location: Some(pdv_location()),
        geofence_radius_m: Some(300.0),
        active: true,
        version: 0,
        updated_at: t0(),
    }
}

pub fn test_agent(id: Uuid) -> Agent {
    Agent {
        id,
        name: "Adama K.".to_string(),
        sectors: vec!["K-04".to_string()],
        active: true,
        version: 0,
        updated_at: t0(),
    }
}

pub fn test_visit(id: Uuid, pdv_id: Uuid, location: GeoPoint, geofence_valid: bool) -> Visit {
    Visit {
        id,
        pdv_id,
        agent_id: test_agent_id(),
        visited_at: t0(),
        location,
        gps_precision_m: 8.0,
        geofence_valid,
        distance_to_pdv_m: None,
        compliance: vec![CategoryCompliance {
            category: ProductCategory::Evap,
            present: true,
            prices_respected: true,
            lines: vec![ProductLine {
                sku: "evap-160g".to_string(),
                state: ComplianceState::AvailablePriceRespected,
            }],
        }],
        sync_status: SyncStatus::Pending,
        version: 0,
    }
}

/// Change record creating an entity, authored by a device.
pub fn create_record<T: serde::Serialize>(
    kind: EntityKind,
    entity_id: Uuid,
    entity: &T,
    device: &DeviceId,
) -> ChangeRecord {
    ChangeRecord::create(
        kind,
        entity_id,
        serde_json::to_value(entity).unwrap(),
        Origin::device(device),
        t0(),
    )
}

/// Change record updating an entity at a base version.
pub fn update_record<T: serde::Serialize>(
    kind: EntityKind,
    entity_id: Uuid,
    entity: &T,
    base_version: u64,
    device: &DeviceId,
) -> ChangeRecord {
    ChangeRecord::update(
        kind,
        entity_id,
        serde_json::to_value(entity).unwrap(),
        base_version,
        Origin::device(device),
        t0(),
    )
}

/// Service over an in-memory store with a manual clock at [`t0`].
pub fn test_service(
    policy: ConflictPolicy,
) -> (Arc<SyncService<MemoryStore>>, Arc<MemoryStore>, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let config = SyncConfig {
        policy,
        ..SyncConfig::default()
    };
    let service = Arc::new(SyncService::new(store.clone(), clock.clone(), config));
    (service, store, clock)
}

/// Seed the server with the test PDV and agent via the server-change path.
pub async fn seed_reference_data(service: &SyncService<MemoryStore>) {
    let pdv = test_pdv(test_pdv_id());
    let record = ChangeRecord::create(
        EntityKind::Pdv,
        pdv.id,
        serde_json::to_value(&pdv).unwrap(),
        Origin::server(),
        t0(),
    );
    let receipt = service.apply_server_change(record).await.unwrap();
    assert_eq!(receipt.accepted.len(), 1, "pdv seed must apply");

    let agent = test_agent(test_agent_id());
    let record = ChangeRecord::create(
        EntityKind::Agent,
        agent.id,
        serde_json::to_value(&agent).unwrap(),
        Origin::server(),
        t0(),
    );
    let receipt = service.apply_server_change(record).await.unwrap();
    assert_eq!(receipt.accepted.len(), 1, "agent seed must apply");
}

/// Arbitrary visit payload as raw JSON (for hash-tampering tests).
pub fn raw_visit_payload(id: Uuid, pdv_id: Uuid) -> serde_json::Value {
    json!({
        "id": id,
        "pdv_id": pdv_id,
        "agent_id": test_agent_id(),
        "visited_at": t0(),
        "location": { "latitude": 5.2950, "longitude": -3.9967 },
        "gps_precision_m": 8.0,
        "geofence_valid": true,
        "compliance": [],
        "sync_status": "pending",
        "version": 0
    })
}
