//! Read-side queries over the snapshot projection: visit KPIs and
//! nearby-PDV lookups. Pure aggregation; nothing here writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{EntityKind, PointOfSale, ProductCategory, Visit};
use crate::error::Result;
use crate::geo::{self, GeoPoint};
use crate::store::SnapshotStore;

/// Radius within which a PDV counts as "nearby" a reported location.
pub const NEARBY_RADIUS_M: f64 = 500.0;

/// Aggregated field KPIs over a set of visits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitKpis {
    pub total_visits: u64,
    pub geofence_valid_visits: u64,
    /// Share of visits inside their PDV geofence, 0 when there are none.
    pub geofence_valid_rate: f64,
    /// Share of category reports marked present, per category.
    pub category_presence_rate: BTreeMap<ProductCategory, f64>,
    /// Share of present category reports with prices respected.
    pub price_respect_rate: f64,
}

/// Compute KPIs over visit payloads. Cheap enough to run per request; the
/// original system recomputed these on every dashboard load.
pub fn visit_kpis(visits: &[Visit]) -> VisitKpis {
    let total_visits = visits.len() as u64;
    let geofence_valid_visits = visits.iter().filter(|v| v.geofence_valid).count() as u64;

    let mut per_category: BTreeMap<ProductCategory, (u64, u64)> = BTreeMap::new();
    let mut present_reports = 0u64;
    let mut prices_respected = 0u64;
    for visit in visits {
        for report in &visit.compliance {
            let (reports, present) = per_category.entry(report.category).or_insert((0, 0));
            *reports += 1;
            if report.present {
                *present += 1;
                present_reports += 1;
                if report.prices_respected {
                    prices_respected += 1;
                }
            }
        }
    }

    let category_presence_rate = per_category
        .into_iter()
        .map(|(category, (reports, present))| (category, ratio(present, reports)))
        .collect();

    VisitKpis {
        total_visits,
        geofence_valid_visits,
        geofence_valid_rate: ratio(geofence_valid_visits, total_visits),
        category_presence_rate,
        price_respect_rate: ratio(prices_respected, present_reports),
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// A PDV within [`NEARBY_RADIUS_M`] of a reported location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearbyPdv {
    pub pdv: PointOfSale,
    pub distance_m: f64,
    /// Inside this PDV's own geofence radius.
    pub in_zone: bool,
}

/// Live PDVs near a location, closest first. PDVs without registered
/// coordinates never match; this is a discovery aid, not a geofence
/// decision, so there is nothing to fail closed over.
pub async fn nearby_pdvs<S: SnapshotStore>(
    store: &S,
    location: GeoPoint,
) -> Result<Vec<NearbyPdv>> {
    let snapshots = store.list_snapshots(EntityKind::Pdv).await?;
    let mut nearby = Vec::new();
    for snapshot in snapshots {
        let Some(payload) = snapshot.payload else {
            continue;
        };
        let Ok(pdv) = serde_json::from_value::<PointOfSale>(payload) else {
            debug!(entity_id = %snapshot.entity_id, "skipping undecodable pdv snapshot");
            continue;
        };
        if !pdv.active {
            continue;
        }
        let Some(pdv_location) = pdv.location else {
            continue;
        };
        let distance_m = geo::haversine_distance_m(location, pdv_location);
        if distance_m <= NEARBY_RADIUS_M {
            let check = geo::validate_geofence(location, pdv_location, pdv.geofence_radius_m);
            nearby.push(NearbyPdv {
                pdv,
                distance_m,
                in_zone: check.valid,
            });
        }
    }
    nearby.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    Ok(nearby)
}

/// Decode all live visit snapshots for KPI aggregation.
pub async fn visit_snapshots<S: SnapshotStore>(store: &S) -> Result<Vec<Visit>> {
    let snapshots = store.list_snapshots(EntityKind::Visit).await?;
    let mut visits = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let Some(payload) = snapshot.payload else {
            continue;
        };
        match serde_json::from_value::<Visit>(payload) {
            Ok(visit) => visits.push(visit),
            Err(_) => {
                debug!(entity_id = %snapshot.entity_id, "skipping undecodable visit snapshot");
            }
        }
    }
    Ok(visits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CategoryCompliance, SyncStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn visit(geofence_valid: bool, compliance: Vec<CategoryCompliance>) -> Visit {
        Visit {
            id: Uuid::new_v4(),
            pdv_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            visited_at: Utc::now(),
            location: GeoPoint::new(5.2950, -3.9967),
            gps_precision_m: 10.0,
            geofence_valid,
            distance_to_pdv_m: Some(50.0),
            compliance,
            sync_status: SyncStatus::Synced,
            version: 1,
        }
    }

    fn report(category: ProductCategory, present: bool, prices_respected: bool) -> CategoryCompliance {
        CategoryCompliance {
            category,
            present,
            prices_respected,
            lines: Vec::new(),
        }
    }

    #[test]
    fn kpis_over_empty_input_are_all_zero() {
        let kpis = visit_kpis(&[]);
        assert_eq!(kpis.total_visits, 0);
        assert_eq!(kpis.geofence_valid_rate, 0.0);
        assert_eq!(kpis.price_respect_rate, 0.0);
        assert!(kpis.category_presence_rate.is_empty());
    }

    #[test]
    fn kpis_aggregate_presence_and_price_respect() {
        let visits = vec![
            visit(
                true,
                vec![
                    report(ProductCategory::Evap, true, true),
                    report(ProductCategory::Uht, true, false),
                ],
            ),
            visit(
                false,
                vec![
                    report(ProductCategory::Evap, false, false),
                    report(ProductCategory::Uht, true, true),
                ],
            ),
        ];
        let kpis = visit_kpis(&visits);

        assert_eq!(kpis.total_visits, 2);
        assert_eq!(kpis.geofence_valid_visits, 1);
        assert!((kpis.geofence_valid_rate - 0.5).abs() < f64::EPSILON);
        assert!(
            (kpis.category_presence_rate[&ProductCategory::Evap] - 0.5).abs() < f64::EPSILON
        );
        assert!(
            (kpis.category_presence_rate[&ProductCategory::Uht] - 1.0).abs() < f64::EPSILON
        );
        // 2 of 3 present reports had prices respected.
        assert!((kpis.price_respect_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
