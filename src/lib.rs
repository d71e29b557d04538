//! PDV Sync Library
//!
//! Geofence validation and offline synchronization for a field-merchandising
//! platform: agents visit retail points of sale (PDVs), record
//! product-compliance data, and sync offline-created records against a
//! central server of record.
//!
//! ## Modules
//!
//! - [`geo`] - Haversine distance and geofence validation
//! - [`domain`] - Core domain types (PDVs, visits, agents, change records)
//! - [`store`] - Change ledger, snapshot projection, device outbox
//! - [`reconcile`] - Conflict detection and resolution policies
//! - [`session`] - Sync session orchestration and the device-side driver
//! - [`query`] - Read-side aggregation (KPIs, nearby PDVs)
//! - [`api`] - REST API routes
//! - [`server`] - HTTP server bootstrap

pub mod api;
pub mod clock;
pub mod domain;
pub mod error;
pub mod geo;
pub mod hash;
pub mod migrations;
pub mod query;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use domain::{
    Agent, ChangeOp, ChangeRecord, ConflictRecord, ConflictResolution, DeviceId, EntityKind,
    Origin, PointOfSale, SyncCursor, UploadReceipt, Visit,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SyncError};
pub use geo::{haversine_distance_m, validate_geofence, GeoPoint, GeofenceCheck};
pub use reconcile::{ConflictPolicy, Reconciler};
pub use session::{SyncClient, SyncConfig, SyncService};
pub use store::{MemoryStore, SqliteStore, SyncStore};
