//! Visit records and the product-compliance payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FieldError;
use crate::geo::GeoPoint;

/// Per-product compliance, a closed four-state enumeration.
///
/// Survey sheets capture one of four states per product line
/// ("Disponible, Prix respecté" / "Disponible, Prix non respecté" /
/// "Présent, Prix respecté" / "En rupture"); keeping the enumeration
/// closed makes validation and merge total functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceState {
    /// Available on shelf at the respected price.
    AvailablePriceRespected,
    /// Available on shelf but mispriced.
    AvailablePriceNotRespected,
    /// Brand present but the surveyed variant is stocked out.
    PresentVariantStockout,
    /// Out of stock.
    OutOfStock,
}

/// Product categories surveyed during a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    Evap,
    Imp,
    Scm,
    Uht,
    Yoghurt,
}

impl ProductCategory {
    pub const ALL: [ProductCategory; 5] = [
        ProductCategory::Evap,
        ProductCategory::Imp,
        ProductCategory::Scm,
        ProductCategory::Uht,
        ProductCategory::Yoghurt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductCategory::Evap => "evap",
            ProductCategory::Imp => "imp",
            ProductCategory::Scm => "scm",
            ProductCategory::Uht => "uht",
            ProductCategory::Yoghurt => "yoghurt",
        }
    }
}

/// One surveyed product line within a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductLine {
    /// Product reference, e.g. "br_400g".
    pub sku: String,
    pub state: ComplianceState,
}

/// Compliance report for one product category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCompliance {
    pub category: ProductCategory,
    pub present: bool,
    pub prices_respected: bool,
    /// Per-SKU states; empty when the category is absent from the PDV.
    #[serde(default)]
    pub lines: Vec<ProductLine>,
}

/// Synchronization state of a locally captured record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    /// Permitted transitions: pending→synced, pending→failed, failed→pending
    /// (retry). A synced record never goes back to pending without a new
    /// edit, which creates a fresh pending record.
    ///
    /// This is device-local bookkeeping for the outbox lifecycle; the
    /// server stores the field as part of the payload but does not police
    /// transitions across uploads.
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        matches!(
            (self, next),
            (SyncStatus::Pending, SyncStatus::Synced)
                | (SyncStatus::Pending, SyncStatus::Failed)
                | (SyncStatus::Failed, SyncStatus::Pending)
        )
    }
}

/// A field visit to a PDV, carrying the compliance survey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visit {
    pub id: Uuid,
    pub pdv_id: Uuid,
    pub agent_id: Uuid,
    pub visited_at: DateTime<Utc>,

    pub location: GeoPoint,
    /// Reported GPS accuracy in meters.
    pub gps_precision_m: f64,

    /// Server-authoritative: recomputed on upload and only ever downgraded.
    pub geofence_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_to_pdv_m: Option<f64>,

    pub compliance: Vec<CategoryCompliance>,

    pub sync_status: SyncStatus,
    pub version: u64,
}

impl Visit {
    /// Field-level checks applied before a visit payload reaches the ledger.
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if self.id.is_nil() {
            errors.push(FieldError::new("id", "must not be nil"));
        }
        if self.pdv_id.is_nil() {
            errors.push(FieldError::new("pdv_id", "must not be nil"));
        }
        if self.agent_id.is_nil() {
            errors.push(FieldError::new("agent_id", "must not be nil"));
        }
        if !(-90.0..=90.0).contains(&self.location.latitude) {
            errors.push(FieldError::new("location.latitude", "out of range [-90, 90]"));
        }
        if !(-180.0..=180.0).contains(&self.location.longitude) {
            errors.push(FieldError::new(
                "location.longitude",
                "out of range [-180, 180]",
            ));
        }
        if !self.gps_precision_m.is_finite() || self.gps_precision_m < 0.0 {
            errors.push(FieldError::new("gps_precision_m", "must be >= 0"));
        }
        if let Some(d) = self.distance_to_pdv_m {
            if !d.is_finite() || d < 0.0 {
                errors.push(FieldError::new("distance_to_pdv_m", "must be >= 0"));
            }
        }

        let mut seen = Vec::with_capacity(self.compliance.len());
        for report in &self.compliance {
            if seen.contains(&report.category) {
                errors.push(FieldError::new(
                    format!("compliance.{}", report.category.as_str()),
                    "duplicate category report",
                ));
            }
            seen.push(report.category);

            let mut skus: Vec<&str> = Vec::with_capacity(report.lines.len());
            for line in &report.lines {
                if line.sku.trim().is_empty() {
                    errors.push(FieldError::new(
                        format!("compliance.{}.sku", report.category.as_str()),
                        "must not be empty",
                    ));
                }
                if skus.contains(&line.sku.as_str()) {
                    errors.push(FieldError::new(
                        format!("compliance.{}.{}", report.category.as_str(), line.sku),
                        "duplicate product line",
                    ));
                }
                skus.push(&line.sku);
            }
        }

        errors
    }
}
