//! In-memory store for tests and embedded use.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{AppliedChange, ChangeRecord, DeviceId, EntityKind, SyncCursor};
use crate::error::{Result, SyncError};
use crate::store::{ChangeLedger, CommittedChange, EntitySnapshot, SnapshotStore, SyncStore};

#[derive(Default)]
struct Inner {
    /// Ledger entries ordered by sequence; pruning pops from the front.
    ledger: VecDeque<ChangeRecord>,
    committed_change_ids: HashSet<Uuid>,
    snapshots: HashMap<(EntityKind, Uuid), EntitySnapshot>,
    cursors: HashMap<DeviceId, SyncCursor>,
    next_sequence: u64,
    retained_floor: u64,
}

/// Fully in-memory [`SyncStore`].
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_sequence: 1,
                retained_floor: 1,
                ..Inner::default()
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeLedger for MemoryStore {
    async fn head_sequence(&self) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.next_sequence - 1)
    }

    async fn retained_floor(&self) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.retained_floor)
    }

    async fn changes_since(
        &self,
        cursor: u64,
        kinds: &[EntityKind],
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.read().await;
        // Entries are sequence-ordered, so skip straight past the cursor.
        let start = inner
            .ledger
            .partition_point(|r| r.sequence.unwrap_or(0) <= cursor);
        Ok(inner
            .ledger
            .iter()
            .skip(start)
            .filter(|r| kinds.contains(&r.entity_kind))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn pending_counts_since(&self, cursor: u64) -> Result<BTreeMap<EntityKind, u64>> {
        let inner = self.inner.read().await;
        let start = inner
            .ledger
            .partition_point(|r| r.sequence.unwrap_or(0) <= cursor);
        let mut counts = BTreeMap::new();
        for record in inner.ledger.iter().skip(start) {
            *counts.entry(record.entity_kind).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn entry_at(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        version: u64,
    ) -> Result<Option<ChangeRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ledger
            .iter()
            .find(|r| {
                r.entity_kind == kind && r.entity_id == entity_id && r.version == Some(version)
            })
            .cloned())
    }

    async fn latest_entry(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> Result<Option<ChangeRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ledger
            .iter()
            .rev()
            .find(|r| r.entity_kind == kind && r.entity_id == entity_id)
            .cloned())
    }

    async fn change_exists(&self, change_id: Uuid) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.committed_change_ids.contains(&change_id))
    }

    async fn prune_recorded_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut pruned = 0;
        loop {
            let expired = matches!(
                inner.ledger.front().and_then(|r| r.recorded_at),
                Some(at) if at < cutoff
            );
            if !expired {
                break;
            }
            if let Some(record) = inner.ledger.pop_front() {
                inner.retained_floor = record.sequence.unwrap_or(0) + 1;
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn get_snapshot(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> Result<Option<EntitySnapshot>> {
        let inner = self.inner.read().await;
        Ok(inner.snapshots.get(&(kind, entity_id)).cloned())
    }

    async fn list_snapshots(&self, kind: EntityKind) -> Result<Vec<EntitySnapshot>> {
        let inner = self.inner.read().await;
        Ok(inner
            .snapshots
            .values()
            .filter(|s| s.entity_kind == kind && !s.deleted)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn commit(&self, writes: Vec<CommittedChange>) -> Result<Vec<AppliedChange>> {
        let mut inner = self.inner.write().await;

        // Verify every CAS guard before touching anything: the whole batch
        // applies or none of it does. Later writes in the batch may chain
        // off earlier ones, so guards are checked against planned versions.
        let mut planned: HashMap<(EntityKind, Uuid), Option<u64>> = HashMap::new();
        for write in &writes {
            let key = (write.record.entity_kind, write.record.entity_id);
            let current = *planned
                .entry(key)
                .or_insert_with(|| inner.snapshots.get(&key).map(|s| s.version));
            if current != write.expected_version {
                return Err(SyncError::StorageCommit(format!(
                    "version race on {}/{}: planned against {:?}, store at {:?}",
                    write.record.entity_kind, write.record.entity_id, write.expected_version,
                    current
                )));
            }
            planned.insert(key, write.record.version);
            if inner.committed_change_ids.contains(&write.record.change_id) {
                return Err(SyncError::StorageCommit(format!(
                    "change {} already committed",
                    write.record.change_id
                )));
            }
        }

        let mut applied = Vec::with_capacity(writes.len());
        for write in writes {
            let mut record = write.record;
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            record.sequence = Some(sequence);

            let version = record
                .version
                .ok_or_else(|| SyncError::Internal("commit without assigned version".into()))?;
            let updated_at = record.recorded_at.unwrap_or_default();

            inner.snapshots.insert(
                (record.entity_kind, record.entity_id),
                EntitySnapshot {
                    entity_kind: record.entity_kind,
                    entity_id: record.entity_id,
                    payload: record.payload.clone(),
                    version,
                    deleted: record.is_tombstone(),
                    updated_at,
                },
            );
            inner.committed_change_ids.insert(record.change_id);

            applied.push(AppliedChange {
                change_id: record.change_id,
                entity_kind: record.entity_kind,
                entity_id: record.entity_id,
                new_version: version,
                sequence,
            });
            inner.ledger.push_back(record);
        }

        Ok(applied)
    }

    async fn get_cursor(&self, device_id: &DeviceId) -> Result<Option<SyncCursor>> {
        let inner = self.inner.read().await;
        Ok(inner.cursors.get(device_id).cloned())
    }

    async fn set_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.cursors.insert(cursor.device_id.clone(), cursor.clone());
        Ok(())
    }
}
