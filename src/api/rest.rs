//! REST API endpoints for the PDV sync service.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::error::ApiError;
use crate::api::types::*;
use crate::domain::{DeviceId, EntityKind};
use crate::geo::GeoPoint;
use crate::query;
use crate::server::AppState;

/// Build the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/geofence/validate", post(validate_geofence))
        .route("/v1/pdvs/nearby", get(nearby_pdvs))
        .route("/v1/kpis/visits", get(visit_kpis))
        .route("/v1/sync/check", get(check_sync))
        .route("/v1/sync/download", post(download_changes))
        .route("/v1/sync/upload", post(upload_changes))
        .route("/v1/sync/ack", post(ack_sync))
}

/// POST /v1/geofence/validate
///
/// Validate a reported location against the current PDV snapshot.
async fn validate_geofence(
    State(state): State<AppState>,
    Json(req): Json<ValidateGeofenceRequest>,
) -> Result<Json<ValidateGeofenceResponse>, ApiError> {
    let check = state
        .service
        .validate_geofence(GeoPoint::new(req.latitude, req.longitude), req.pdv_id)
        .await?;
    Ok(Json(check.into()))
}

/// GET /v1/pdvs/nearby?latitude=..&longitude=..
async fn nearby_pdvs(
    State(state): State<AppState>,
    Query(q): Query<NearbyPdvsQuery>,
) -> Result<Json<NearbyPdvsResponse>, ApiError> {
    let nearby =
        query::nearby_pdvs(state.service.store().as_ref(), GeoPoint::new(q.latitude, q.longitude))
            .await?;
    Ok(Json(NearbyPdvsResponse { nearby }))
}

/// GET /v1/kpis/visits
async fn visit_kpis(
    State(state): State<AppState>,
) -> Result<Json<query::VisitKpis>, ApiError> {
    let visits = query::visit_snapshots(state.service.store().as_ref()).await?;
    Ok(Json(query::visit_kpis(&visits)))
}

/// GET /v1/sync/check?device_id=..&cursor=..
async fn check_sync(
    State(state): State<AppState>,
    Query(q): Query<CheckSyncQuery>,
) -> Result<Json<CheckSyncResponse>, ApiError> {
    let device = DeviceId::new(q.device_id);
    let report = state.service.check(&device, q.cursor).await?;
    Ok(Json(report.into()))
}

/// POST /v1/sync/download
async fn download_changes(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let device = DeviceId::new(req.device_id);
    let kinds = if req.entity_kinds.is_empty() {
        EntityKind::ALL.to_vec()
    } else {
        req.entity_kinds
    };
    let batch = state.service.download(&device, req.cursor, &kinds).await?;
    Ok(Json(batch.into()))
}

/// POST /v1/sync/upload
async fn upload_changes(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    let device = DeviceId::new(req.device_id);
    let receipt = state.service.upload(&device, req.changes).await?;
    Ok(Json(receipt.into()))
}

/// POST /v1/sync/ack
async fn ack_sync(
    State(state): State<AppState>,
    Json(req): Json<AckRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let device = req.device();
    state.service.ack(&device, req.cursor).await?;
    Ok(Json(AckResponse {
        device_id: device.to_string(),
        cursor: req.cursor,
    }))
}
