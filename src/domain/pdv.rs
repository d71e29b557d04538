//! Point-of-sale reference data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FieldError;
use crate::geo::GeoPoint;

/// Retail outlet sub-category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdvSubCategory {
    Tabliers,
    Pushcart,
    Superette,
    Boutique,
    Kiosque,
    Cafeteria,
}

/// A retail point of sale visited by field agents.
///
/// `location` is optional: a PDV registered without coordinates causes
/// geofence checks against it to fail closed rather than comparing against
/// a bogus origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointOfSale {
    pub id: Uuid,
    pub name: String,

    /// Sales channel, e.g. "General trade".
    pub channel: String,
    pub sub_category: PdvSubCategory,

    // Territory hierarchy, coarsest to finest.
    pub region: String,
    pub territory: String,
    pub zone: String,
    pub sector: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,

    /// Geofence radius in meters; non-positive or absent values fall back
    /// to the 300 m default at validation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geofence_radius_m: Option<f64>,

    pub active: bool,

    /// Strictly increasing, scoped to this entity.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl PointOfSale {
    /// Field-level checks applied before a PDV payload reaches the ledger.
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if self.id.is_nil() {
            errors.push(FieldError::new("id", "must not be nil"));
        }
        if self.name.trim().is_empty() {
            errors.push(FieldError::new("name", "must not be empty"));
        }
        if self.sector.trim().is_empty() {
            errors.push(FieldError::new("sector", "must not be empty"));
        }
        if let Some(loc) = &self.location {
            if !(-90.0..=90.0).contains(&loc.latitude) {
                errors.push(FieldError::new("location.latitude", "out of range [-90, 90]"));
            }
            if !(-180.0..=180.0).contains(&loc.longitude) {
                errors.push(FieldError::new(
                    "location.longitude",
                    "out of range [-180, 180]",
                ));
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pdv() -> PointOfSale {
        PointOfSale {
            id: Uuid::new_v4(),
            name: "Boutique Adjame".to_string(),
            channel: "General trade".to_string(),
            sub_category: PdvSubCategory::Boutique,
            region: "Abidjan".to_string(),
            territory: "Abidjan Nord".to_string(),
            zone: "Adjame".to_string(),
            sector: "Adjame Marche".to_string(),
            location: Some(GeoPoint::new(5.2950, -3.9967)),
            geofence_radius_m: Some(300.0),
            active: true,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn valid_pdv_passes() {
        assert!(sample_pdv().validate().is_empty());
    }

    #[test]
    fn out_of_range_coordinates_flagged() {
        let mut pdv = sample_pdv();
        pdv.location = Some(GeoPoint::new(91.0, -200.0));
        let errors = pdv.validate();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "location.latitude");
        assert_eq!(errors[1].field, "location.longitude");
    }
}
