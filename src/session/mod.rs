//! Sync session orchestration.
//!
//! A device syncs through a fixed phase sequence:
//! `CHECK -> DOWNLOAD -> UPLOAD -> RECONCILE -> ACK`. The cursor advances
//! only at ACK, so an aborted session leaves no durable state beyond the
//! immutable ledger appends of any committed upload, and the device simply
//! restarts at CHECK.

mod client;

pub use client::{InProcessTransport, SyncClient, SyncTransport};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{
    Agent, ChangeRecord, DeviceId, EntityKind, PointOfSale, SyncCursor, UploadReceipt, Visit,
};
use crate::error::{FieldError, Result, SyncError};
use crate::geo::{self, GeoPoint, GeofenceCheck};
use crate::hash::canonical_json_hash;
use crate::reconcile::{ConflictPolicy, Reconciler};
use crate::store::SyncStore;

/// Tunables for the sync service.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long ledger entries are retained before pruning.
    pub retention: Duration,
    /// A session with no activity for this long is dropped.
    pub session_timeout: Duration,
    /// Maximum records returned per download page.
    pub download_limit: usize,
    /// Pending-change total above which a sync is recommended at CHECK.
    pub check_threshold: u64,
    pub policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retention: Duration::days(30),
            session_timeout: Duration::minutes(15),
            download_limit: 500,
            check_threshold: 10,
            policy: ConflictPolicy::default(),
        }
    }
}

/// Phase of an in-flight sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Check,
    Download,
    Upload,
    Reconcile,
    Ack,
}

impl SessionPhase {
    /// A device may always abandon a session and restart at CHECK. DOWNLOAD
    /// repeats while paging, UPLOAD is reachable straight from CHECK
    /// (nothing to download), and ACK straight from DOWNLOAD (nothing to
    /// upload).
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (_, Check)
                | (Check, Download)
                | (Check, Upload)
                | (Download, Download)
                | (Download, Upload)
                | (Download, Ack)
                | (Upload, Reconcile)
                | (Reconcile, Ack)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Check => "check",
            SessionPhase::Download => "download",
            SessionPhase::Upload => "upload",
            SessionPhase::Reconcile => "reconcile",
            SessionPhase::Ack => "ack",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
struct SessionState {
    phase: SessionPhase,
    last_activity: DateTime<Utc>,
}

/// What CHECK reports back to a device.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckReport {
    pub pending: BTreeMap<EntityKind, u64>,
    pub head_sequence: u64,
    pub server_time: DateTime<Utc>,
    /// True when the pending total exceeds the configured threshold.
    pub recommended: bool,
}

impl CheckReport {
    pub fn pending_total(&self) -> u64 {
        self.pending.values().sum()
    }
}

/// One page of downloaded changes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DownloadBatch {
    pub changes: Vec<ChangeRecord>,
    /// Watermark to ACK once the page is applied locally.
    pub new_cursor: u64,
    /// More pages remain past `new_cursor`.
    pub has_more: bool,
}

/// Server-side sync orchestrator: phase enforcement, validation, geofence
/// recompute, and delegation to the [`Reconciler`].
pub struct SyncService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    reconciler: Reconciler<S>,
    sessions: RwLock<HashMap<DeviceId, SessionState>>,
}

impl<S: SyncStore> SyncService<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        let reconciler = Reconciler::new(store.clone(), clock.clone(), config.policy);
        Self {
            store,
            clock,
            config,
            reconciler,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// CHECK: pending counts per kind since the device's cursor. Counts
    /// only; no payloads cross the wire here.
    pub async fn check(&self, device_id: &DeviceId, cursor: u64) -> Result<CheckReport> {
        self.enter_phase(device_id, SessionPhase::Check).await?;

        let pending = self.store.pending_counts_since(cursor).await?;
        let head_sequence = self.store.head_sequence().await?;
        let total: u64 = pending.values().sum();
        let recommended = total > self.config.check_threshold;

        debug!(device = %device_id, cursor, total, recommended, "sync check");
        Ok(CheckReport {
            pending,
            head_sequence,
            server_time: self.clock.now(),
            recommended,
        })
    }

    /// DOWNLOAD: one page of changes past the device's cursor for the
    /// subscribed kinds. A cursor older than the retention floor fails with
    /// `StaleCursor`; the device must resync from scratch.
    pub async fn download(
        &self,
        device_id: &DeviceId,
        cursor: u64,
        kinds: &[EntityKind],
    ) -> Result<DownloadBatch> {
        self.enter_phase(device_id, SessionPhase::Download).await?;

        // A fresh device (cursor 0) cannot replay a pruned ledger tail, so
        // it bootstraps from the snapshot projection instead.
        if cursor == 0 && self.store.retained_floor().await? > 1 {
            return self.bootstrap_download(device_id, kinds).await;
        }
        self.ensure_cursor_live(cursor).await?;

        let changes = self
            .store
            .changes_since(cursor, kinds, self.config.download_limit)
            .await?;
        let new_cursor = changes
            .iter()
            .filter_map(|c| c.sequence)
            .max()
            .unwrap_or(cursor);
        let has_more = new_cursor < self.store.head_sequence().await?
            && changes.len() == self.config.download_limit;

        info!(device = %device_id, cursor, new_cursor, count = changes.len(), "download page");
        Ok(DownloadBatch {
            changes,
            new_cursor,
            has_more,
        })
    }

    /// Full-state download synthesized from live snapshots, for devices
    /// whose cursor predates the ledger retention window entirely.
    async fn bootstrap_download(
        &self,
        device_id: &DeviceId,
        kinds: &[EntityKind],
    ) -> Result<DownloadBatch> {
        // Head first: anything committed after this re-arrives incrementally
        // and applies idempotently on the device.
        let head = self.store.head_sequence().await?;

        let mut changes = Vec::new();
        for kind in kinds {
            for snapshot in self.store.list_snapshots(*kind).await? {
                let Some(payload) = snapshot.payload else {
                    continue;
                };
                let payload_hash = canonical_json_hash(&payload);
                changes.push(ChangeRecord {
                    change_id: Uuid::new_v4(),
                    entity_kind: snapshot.entity_kind,
                    entity_id: snapshot.entity_id,
                    op: crate::domain::ChangeOp::Create,
                    payload: Some(payload),
                    payload_hash,
                    origin: crate::domain::Origin::server(),
                    created_at: snapshot.updated_at,
                    recorded_at: Some(snapshot.updated_at),
                    base_version: None,
                    version: Some(snapshot.version),
                    sequence: None,
                });
            }
        }

        info!(device = %device_id, count = changes.len(), head, "bootstrap download");
        Ok(DownloadBatch {
            changes,
            new_cursor: head,
            has_more: false,
        })
    }

    /// UPLOAD + RECONCILE: validate each record, recompute visit geofences
    /// (downgrade-only), then reconcile and commit all-or-nothing.
    pub async fn upload(
        &self,
        device_id: &DeviceId,
        records: Vec<ChangeRecord>,
    ) -> Result<UploadReceipt> {
        self.enter_phase(device_id, SessionPhase::Upload).await?;

        let mut receipt = UploadReceipt {
            accepted: Vec::new(),
            already_applied: Vec::new(),
            rejected: Vec::new(),
            conflicts: Vec::new(),
            head_sequence: 0,
            server_time: self.clock.now(),
        };

        let mut to_reconcile = Vec::with_capacity(records.len());
        for record in records {
            match self.validate_record(record).await {
                Ok(record) => to_reconcile.push(record),
                Err(rejected) => receipt.rejected.push(rejected),
            }
        }

        let outcome = self.reconciler.reconcile(to_reconcile).await?;
        receipt.accepted = outcome.accepted;
        receipt.already_applied = outcome.already_applied;
        receipt.rejected.extend(outcome.rejected);
        receipt.conflicts = outcome.conflicts;
        receipt.head_sequence = self.store.head_sequence().await?;

        self.enter_phase(device_id, SessionPhase::Reconcile).await?;
        info!(
            device = %device_id,
            accepted = receipt.accepted.len(),
            conflicts = receipt.conflicts.len(),
            rejected = receipt.rejected.len(),
            "upload reconciled"
        );
        Ok(receipt)
    }

    /// ACK: persist the cursor. The only step that advances it; re-acking
    /// the same watermark is a no-op, so delivery is at-least-once safe.
    pub async fn ack(&self, device_id: &DeviceId, cursor: u64) -> Result<()> {
        self.enter_phase(device_id, SessionPhase::Ack).await?;

        let head = self.store.head_sequence().await?;
        if cursor > head {
            return Err(SyncError::InvalidCursor(format!(
                "cursor {cursor} is ahead of ledger head {head}"
            )));
        }

        let now = self.clock.now();
        self.store
            .set_cursor(&SyncCursor {
                device_id: device_id.clone(),
                last_sequence: cursor,
                acked_at: now,
            })
            .await?;
        self.sessions.write().await.remove(device_id);

        info!(device = %device_id, cursor, "sync acknowledged");
        Ok(())
    }

    /// Geofence check against the current PDV snapshot. Missing PDV is
    /// not-found; a PDV without coordinates fails closed.
    pub async fn validate_geofence(
        &self,
        location: GeoPoint,
        pdv_id: Uuid,
    ) -> Result<GeofenceCheck> {
        let pdv = self.load_pdv(pdv_id).await?;
        geo::validate_geofence_against(location, pdv_id, pdv.location, pdv.geofence_radius_m)
    }

    /// Server-authored change (back-office edits) routed through the same
    /// reconcile path as device uploads.
    pub async fn apply_server_change(&self, record: ChangeRecord) -> Result<UploadReceipt> {
        let record = self.validate_record(record).await.map_err(|rejected| {
            SyncError::Validation(rejected.errors)
        })?;

        let outcome = self.reconciler.reconcile(vec![record]).await?;
        Ok(UploadReceipt {
            accepted: outcome.accepted,
            already_applied: outcome.already_applied,
            rejected: outcome.rejected,
            conflicts: outcome.conflicts,
            head_sequence: self.store.head_sequence().await?,
            server_time: self.clock.now(),
        })
    }

    /// Prune ledger entries older than the retention window. The ledger is
    /// append-only toward clients; this is the only permitted deletion.
    pub async fn prune_ledger(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.config.retention;
        let pruned = self.store.prune_recorded_before(cutoff).await?;
        if pruned > 0 {
            info!(pruned, %cutoff, "ledger pruned");
        }
        Ok(pruned)
    }

    /// Drop sessions with no activity within the timeout. Abandoned
    /// sessions leave no partial durable state.
    pub async fn expire_stale_sessions(&self) -> usize {
        let now = self.clock.now();
        let timeout = self.config.session_timeout;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|device, state| {
            let live = now - state.last_activity < timeout;
            if !live {
                warn!(device = %device, phase = %state.phase, "expiring abandoned session");
            }
            live
        });
        before - sessions.len()
    }

    /// Current phase of a device's session, if one is open.
    pub async fn session_phase(&self, device_id: &DeviceId) -> Option<SessionPhase> {
        self.sessions.read().await.get(device_id).map(|s| s.phase)
    }

    async fn enter_phase(&self, device_id: &DeviceId, next: SessionPhase) -> Result<()> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(device_id) {
            Some(state) => {
                // An abandoned session must not wedge the device.
                if now - state.last_activity >= self.config.session_timeout {
                    state.phase = SessionPhase::Check;
                }
                if !state.phase.can_transition_to(next) {
                    return Err(SyncError::InvalidSessionPhase {
                        device_id: device_id.to_string(),
                        from: state.phase.to_string(),
                        to: next.to_string(),
                    });
                }
                debug!(device = %device_id, from = %state.phase, to = %next, "session phase");
                state.phase = next;
                state.last_activity = now;
            }
            None => {
                if next != SessionPhase::Check {
                    return Err(SyncError::InvalidSessionPhase {
                        device_id: device_id.to_string(),
                        from: "none".to_string(),
                        to: next.to_string(),
                    });
                }
                sessions.insert(
                    device_id.clone(),
                    SessionState {
                        phase: next,
                        last_activity: now,
                    },
                );
            }
        }
        Ok(())
    }

    /// Last acknowledged cursor for a device, 0 before the first sync.
    pub async fn acked_cursor(&self, device_id: &DeviceId) -> Result<u64> {
        Ok(self
            .store
            .get_cursor(device_id)
            .await?
            .map(|c| c.last_sequence)
            .unwrap_or(0))
    }

    /// A cursor is live when every sequence past it is still retained.
    async fn ensure_cursor_live(&self, cursor: u64) -> Result<()> {
        let head = self.store.head_sequence().await?;
        if cursor > head {
            return Err(SyncError::InvalidCursor(format!(
                "cursor {cursor} is ahead of ledger head {head}"
            )));
        }
        let floor = self.store.retained_floor().await?;
        if cursor + 1 < floor {
            return Err(SyncError::StaleCursor {
                cursor,
                retained_floor: floor,
            });
        }
        Ok(())
    }

    /// Pre-ledger validation: hash integrity, typed payload validation, id
    /// consistency, and server-side geofence recompute for visits.
    async fn validate_record(
        &self,
        mut record: ChangeRecord,
    ) -> std::result::Result<ChangeRecord, crate::domain::RejectedChange> {
        let reject = |record: &ChangeRecord, errors: Vec<FieldError>| crate::domain::RejectedChange {
            change_id: record.change_id,
            errors,
        };

        if !record.payload_hash_valid() {
            return Err(reject(
                &record,
                vec![FieldError::new(
                    "payload_hash",
                    "hash does not match the canonical payload",
                )],
            ));
        }

        let Some(payload) = record.payload.clone() else {
            // Tombstone: nothing further to validate.
            return Ok(record);
        };

        let errors = match record.entity_kind {
            EntityKind::Pdv => match serde_json::from_value::<PointOfSale>(payload) {
                Ok(pdv) => {
                    let mut errors = pdv.validate();
                    if pdv.id != record.entity_id {
                        errors.push(FieldError::new("id", "payload id differs from entity id"));
                    }
                    errors
                }
                Err(err) => vec![FieldError::new("payload", err.to_string())],
            },
            EntityKind::Agent => match serde_json::from_value::<Agent>(payload) {
                Ok(agent) => {
                    let mut errors = agent.validate();
                    if agent.id != record.entity_id {
                        errors.push(FieldError::new("id", "payload id differs from entity id"));
                    }
                    errors
                }
                Err(err) => vec![FieldError::new("payload", err.to_string())],
            },
            EntityKind::Visit => match serde_json::from_value::<Visit>(payload) {
                Ok(mut visit) => {
                    let mut errors = visit.validate();
                    if visit.id != record.entity_id {
                        errors.push(FieldError::new("id", "payload id differs from entity id"));
                    }
                    if errors.is_empty() {
                        self.recompute_visit_geofence(&mut visit).await;
                        let payload = serde_json::to_value(&visit).map_err(|err| {
                            reject(&record, vec![FieldError::new("payload", err.to_string())])
                        })?;
                        record.payload_hash = canonical_json_hash(&payload);
                        record.payload = Some(payload);
                    }
                    errors
                }
                Err(err) => vec![FieldError::new("payload", err.to_string())],
            },
        };

        if errors.is_empty() {
            Ok(record)
        } else {
            Err(reject(&record, errors))
        }
    }

    /// Authoritative geofence recompute for an uploaded visit. The server
    /// may only downgrade a client-declared valid flag, never upgrade one.
    async fn recompute_visit_geofence(&self, visit: &mut Visit) {
        let check = match self.load_pdv(visit.pdv_id).await {
            Ok(pdv) => geo::validate_geofence_against(
                visit.location,
                visit.pdv_id,
                pdv.location,
                pdv.geofence_radius_m,
            ),
            Err(err) => Err(err),
        };

        match check {
            Ok(check) => {
                visit.distance_to_pdv_m = Some(check.distance_m);
                if visit.geofence_valid && !check.valid {
                    warn!(
                        visit = %visit.id, pdv = %visit.pdv_id,
                        distance_m = check.distance_m, radius_m = check.radius_m,
                        "downgrading client geofence flag"
                    );
                    visit.geofence_valid = false;
                }
            }
            Err(err) => {
                // Cannot verify the claim; fail closed.
                if visit.geofence_valid {
                    warn!(visit = %visit.id, pdv = %visit.pdv_id, %err,
                        "geofence unverifiable, downgrading");
                    visit.geofence_valid = false;
                }
                visit.distance_to_pdv_m = None;
            }
        }
    }

    async fn load_pdv(&self, pdv_id: Uuid) -> Result<PointOfSale> {
        let snapshot = self
            .store
            .get_snapshot(EntityKind::Pdv, pdv_id)
            .await?
            .filter(|s| !s.deleted)
            .ok_or(SyncError::PdvNotFound(pdv_id))?;
        let payload = snapshot
            .payload
            .ok_or(SyncError::PdvNotFound(pdv_id))?;
        serde_json::from_value(payload)
            .map_err(|err| SyncError::Internal(format!("corrupt pdv snapshot {pdv_id}: {err}")))
    }
}
