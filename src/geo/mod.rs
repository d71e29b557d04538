//! Great-circle distance and geofence policy.
//!
//! Pure functions: the caller persists results. Input range validation is
//! the caller's responsibility; visit payload validation happens in
//! [`crate::domain`] before anything reaches this module.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Geofence radius applied when a PDV has no usable radius configured.
pub const DEFAULT_GEOFENCE_RADIUS_M: f64 = 300.0;

/// A point in degrees latitude/longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Haversine great-circle distance in meters.
///
/// Total and symmetric; coincident points yield 0 within 1e-6 m.
pub fn haversine_distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h =
        (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Result of a geofence check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeofenceCheck {
    pub valid: bool,
    pub distance_m: f64,
    /// Radius actually used for the comparison (after defaulting).
    pub radius_m: f64,
}

/// Validate a visit location against a PDV geofence.
///
/// Valid iff `distance <= radius`. A non-positive or absent radius is
/// replaced with [`DEFAULT_GEOFENCE_RADIUS_M`] before the comparison.
pub fn validate_geofence(
    visit_location: GeoPoint,
    pdv_location: GeoPoint,
    radius_m: Option<f64>,
) -> GeofenceCheck {
    let radius_m = match radius_m {
        Some(r) if r > 0.0 => r,
        _ => DEFAULT_GEOFENCE_RADIUS_M,
    };
    let distance_m = haversine_distance_m(visit_location, pdv_location);
    GeofenceCheck {
        valid: distance_m <= radius_m,
        distance_m,
        radius_m,
    }
}

/// Geofence check against a PDV that may lack registered coordinates.
///
/// Missing coordinates fail closed with an explicit error, distinct from an
/// out-of-range result.
pub fn validate_geofence_against(
    visit_location: GeoPoint,
    pdv_id: Uuid,
    pdv_location: Option<GeoPoint>,
    radius_m: Option<f64>,
) -> Result<GeofenceCheck, SyncError> {
    let pdv_location = pdv_location.ok_or(SyncError::MissingReferenceLocation(pdv_id))?;
    Ok(validate_geofence(visit_location, pdv_location, radius_m))
}
