//! Shared request and response types for REST API handlers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    AppliedChange, ChangeRecord, ConflictRecord, DeviceId, EntityKind, RejectedChange,
    UploadReceipt,
};
use crate::geo::GeofenceCheck;
use crate::query::NearbyPdv;
use crate::session::{CheckReport, DownloadBatch};

// ============================================================================
// Geofence types
// ============================================================================

/// Request body for geofence validation.
#[derive(Debug, Deserialize)]
pub struct ValidateGeofenceRequest {
    pub pdv_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
}

/// Response for geofence validation.
#[derive(Debug, Serialize)]
pub struct ValidateGeofenceResponse {
    pub valid: bool,
    pub distance_m: f64,
    pub radius_m: f64,
}

impl From<GeofenceCheck> for ValidateGeofenceResponse {
    fn from(check: GeofenceCheck) -> Self {
        Self {
            valid: check.valid,
            distance_m: check.distance_m,
            radius_m: check.radius_m,
        }
    }
}

/// Response for nearby-PDV lookup.
#[derive(Debug, Serialize)]
pub struct NearbyPdvsResponse {
    pub nearby: Vec<NearbyPdv>,
}

// ============================================================================
// Sync session types
// ============================================================================

/// Query parameters for sync check.
#[derive(Debug, Deserialize)]
pub struct CheckSyncQuery {
    pub device_id: String,
    #[serde(default)]
    pub cursor: u64,
}

/// Response for sync check.
#[derive(Debug, Serialize)]
pub struct CheckSyncResponse {
    pub pending: BTreeMap<EntityKind, u64>,
    pub pending_total: u64,
    pub head_sequence: u64,
    pub server_time: DateTime<Utc>,
    pub recommended: bool,
}

impl From<CheckReport> for CheckSyncResponse {
    fn from(report: CheckReport) -> Self {
        let pending_total = report.pending_total();
        Self {
            pending: report.pending,
            pending_total,
            head_sequence: report.head_sequence,
            server_time: report.server_time,
            recommended: report.recommended,
        }
    }
}

/// Request body for downloading changes.
#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub device_id: String,
    #[serde(default)]
    pub cursor: u64,
    /// Entity kinds to subscribe to; all kinds when empty.
    #[serde(default)]
    pub entity_kinds: Vec<EntityKind>,
}

/// Response for downloading changes.
#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub changes: Vec<ChangeRecord>,
    pub new_cursor: u64,
    pub has_more: bool,
}

impl From<DownloadBatch> for DownloadResponse {
    fn from(batch: DownloadBatch) -> Self {
        Self {
            changes: batch.changes,
            new_cursor: batch.new_cursor,
            has_more: batch.has_more,
        }
    }
}

/// Request body for uploading changes.
#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub device_id: String,
    pub changes: Vec<ChangeRecord>,
}

/// Response receipt for an upload.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub accepted: Vec<AppliedChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub already_applied: Vec<Uuid>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictRecord>,
    pub head_sequence: u64,
    pub server_time: DateTime<Utc>,
}

impl From<UploadReceipt> for UploadResponse {
    fn from(receipt: UploadReceipt) -> Self {
        Self {
            accepted: receipt.accepted,
            already_applied: receipt.already_applied,
            rejected: receipt.rejected,
            conflicts: receipt.conflicts,
            head_sequence: receipt.head_sequence,
            server_time: receipt.server_time,
        }
    }
}

/// Request body for acknowledging a sync session.
#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub device_id: String,
    pub cursor: u64,
}

/// Response for acknowledging a sync session.
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub device_id: String,
    pub cursor: u64,
}

impl AckRequest {
    pub fn device(&self) -> DeviceId {
        DeviceId::new(self.device_id.clone())
    }
}

// ============================================================================
// Query types
// ============================================================================

/// Query parameters for nearby-PDV lookup.
#[derive(Debug, Deserialize)]
pub struct NearbyPdvsQuery {
    pub latitude: f64,
    pub longitude: f64,
}
