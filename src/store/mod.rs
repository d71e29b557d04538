//! Storage traits and implementations.
//!
//! Two durable surfaces back the sync core:
//! - the append-only change ledger (with a global monotonic sequence), and
//! - the mutable current-snapshot projection, updated only through
//!   compare-and-set on the entity version.
//!
//! All writes go through [`SyncStore::commit`], which applies one reconciled
//! batch atomically. No write bypasses the ledger.

mod memory;
mod outbox;
mod sqlite;

pub use memory::MemoryStore;
pub use outbox::{DeviceQueue, MemoryOutbox, SqliteOutbox};
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{AppliedChange, ChangeRecord, DeviceId, EntityKind, SyncCursor};
use crate::error::Result;

/// Current state of one entity in the snapshot projection.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    /// `None` once the entity has been tombstoned.
    pub payload: Option<Value>,
    pub version: u64,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

/// One reconciled write: a version-stamped ledger record plus the CAS guard
/// for the snapshot update.
#[derive(Debug, Clone)]
pub struct CommittedChange {
    /// Record with `version` and `recorded_at` already assigned; the store
    /// assigns `sequence` at append.
    pub record: ChangeRecord,
    /// Snapshot version the reconciler planned against; `None` means the
    /// entity must not exist yet. A mismatch at commit time aborts the batch.
    pub expected_version: Option<u64>,
}

/// Read surface of the append-only change ledger.
#[async_trait]
pub trait ChangeLedger: Send + Sync {
    /// Highest assigned sequence (0 when empty).
    async fn head_sequence(&self) -> Result<u64>;

    /// Lowest sequence still retained after pruning (1 when nothing pruned).
    async fn retained_floor(&self) -> Result<u64>;

    /// Records with `sequence > cursor` for the given kinds, oldest first.
    /// Cost is proportional to the number of changed entries, not total.
    async fn changes_since(
        &self,
        cursor: u64,
        kinds: &[EntityKind],
        limit: usize,
    ) -> Result<Vec<ChangeRecord>>;

    /// Per-kind count of records with `sequence > cursor`; no payloads.
    async fn pending_counts_since(&self, cursor: u64) -> Result<BTreeMap<EntityKind, u64>>;

    /// The ledger entry for exactly (kind, id, version), if retained.
    async fn entry_at(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        version: u64,
    ) -> Result<Option<ChangeRecord>>;

    /// Most recent ledger entry for an entity, if retained.
    async fn latest_entry(&self, kind: EntityKind, entity_id: Uuid)
        -> Result<Option<ChangeRecord>>;

    /// Whether a client change id has already been committed (idempotency).
    async fn change_exists(&self, change_id: Uuid) -> Result<bool>;

    /// Drop entries recorded before `cutoff`, advancing the retained floor.
    /// Returns the number of pruned entries.
    async fn prune_recorded_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Read surface of the current-snapshot projection.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get_snapshot(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> Result<Option<EntitySnapshot>>;

    /// All live (non-deleted) snapshots of one kind.
    async fn list_snapshots(&self, kind: EntityKind) -> Result<Vec<EntitySnapshot>>;
}

/// Combined server-side store: ledger + snapshots + per-device cursors.
#[async_trait]
pub trait SyncStore: ChangeLedger + SnapshotStore + Send + Sync {
    /// Atomically append a reconciled batch and update snapshots.
    ///
    /// Every snapshot update is guarded by its `expected_version`; any CAS
    /// failure (a concurrent session won the race since the reconciler read
    /// its snapshot) rolls the whole batch back with `StorageCommit`.
    /// Returns the applied changes with their assigned sequences, in input
    /// order.
    async fn commit(&self, writes: Vec<CommittedChange>) -> Result<Vec<AppliedChange>>;

    async fn get_cursor(&self, device_id: &DeviceId) -> Result<Option<SyncCursor>>;

    async fn set_cursor(&self, cursor: &SyncCursor) -> Result<()>;
}
