//! Sync reconciler.
//!
//! Merges a batch of client change records into server state: groups by
//! entity, compares each record's base version with the current server
//! version, applies clean changes, and resolves concurrent edits under the
//! configured [`ConflictPolicy`]. Every conflict is reported regardless of
//! how it was resolved; accepted writes commit atomically per batch.

mod policy;

pub use policy::{field_merge, ConflictPolicy, MergeSide};

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{
    AppliedChange, ChangeOp, ChangeRecord, ConflictRecord, ConflictResolution, EntityKind,
    Origin, RejectedChange,
};
use crate::error::{FieldError, Result};
use crate::hash::canonical_json_hash;
use crate::store::{CommittedChange, SyncStore};

/// Result of reconciling one uploaded batch.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub accepted: Vec<AppliedChange>,
    /// Changes recognized by client id as already committed; no-ops.
    pub already_applied: Vec<Uuid>,
    /// Records whose base version is ahead of anything the server assigned.
    pub rejected: Vec<RejectedChange>,
    pub conflicts: Vec<ConflictRecord>,
}

/// Whether a planned write was a clean apply or a conflict resolution.
/// Only clean applies land in `accepted`; resolution writes are reported
/// through their conflict record.
enum PlannedWrite {
    Clean,
    Resolution,
}

pub struct Reconciler<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: ConflictPolicy,
}

impl<S: SyncStore> Reconciler<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, policy: ConflictPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Reconcile a validated batch. Entities are processed independently:
    /// one entity's conflict never blocks acceptance of another's changes.
    pub async fn reconcile(&self, records: Vec<ChangeRecord>) -> Result<ReconcileOutcome> {
        let now = self.clock.now();
        let mut outcome = ReconcileOutcome::default();

        // Group by entity, preserving first-seen order and the record order
        // within each entity.
        let mut groups: Vec<((EntityKind, Uuid), Vec<ChangeRecord>)> = Vec::new();
        for record in records {
            let key = (record.entity_kind, record.entity_id);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(record),
                None => groups.push((key, vec![record])),
            }
        }

        let mut writes: Vec<CommittedChange> = Vec::new();
        let mut write_kinds: Vec<PlannedWrite> = Vec::new();
        let mut planned_ids: HashSet<Uuid> = HashSet::new();

        for ((kind, entity_id), group) in groups {
            let snapshot = self.store.get_snapshot(kind, entity_id).await?;
            let mut working_version = snapshot.as_ref().map(|s| s.version);
            let mut working_payload = snapshot.as_ref().and_then(|s| s.payload.clone());
            let mut working_deleted = snapshot.as_ref().map(|s| s.deleted).unwrap_or(false);

            for record in group {
                // Idempotency: a replayed change is a no-op, never a new
                // conflict or a duplicate version bump.
                if planned_ids.contains(&record.change_id)
                    || self.store.change_exists(record.change_id).await?
                {
                    debug!(change_id = %record.change_id, "change already applied, skipping");
                    outcome.already_applied.push(record.change_id);
                    continue;
                }

                let base = record.base_version.unwrap_or(0);
                let current = working_version.unwrap_or(0);

                if base == current {
                    // No concurrent edit: apply and bump.
                    let new_version = current + 1;
                    let mut accepted = record;
                    accepted.version = Some(new_version);
                    accepted.recorded_at = Some(now);

                    planned_ids.insert(accepted.change_id);
                    working_version = Some(new_version);
                    working_payload = accepted.payload.clone();
                    working_deleted = accepted.is_tombstone();
                    writes.push(CommittedChange {
                        record: accepted,
                        expected_version: if current == 0 && snapshot.is_none() {
                            None
                        } else {
                            Some(current)
                        },
                    });
                    write_kinds.push(PlannedWrite::Clean);
                } else if base < current {
                    // Concurrent edit: the server moved past the client's
                    // base. Resolve under the configured policy.
                    let resolution = self
                        .resolve_conflict(
                            &record,
                            kind,
                            entity_id,
                            base,
                            current,
                            working_payload.as_ref(),
                            working_deleted,
                            now,
                        )
                        .await?;

                    let mut conflict = ConflictRecord {
                        change_id: record.change_id,
                        entity_kind: kind,
                        entity_id,
                        base_version: base,
                        server_version: current,
                        client_payload: record.payload.clone(),
                        server_payload: working_payload.clone(),
                        resolution: ConflictResolution::KeptServer,
                    };

                    match resolution {
                        Resolved::KeptServer => {
                            warn!(
                                entity = %kind, %entity_id, base, current,
                                "conflict: keeping server state"
                            );
                        }
                        Resolved::Write { record: resolved, resolution } => {
                            let new_version = current + 1;
                            planned_ids.insert(resolved.change_id);
                            working_version = Some(new_version);
                            working_payload = resolved.payload.clone();
                            working_deleted = resolved.is_tombstone();
                            conflict.resolution = resolution;
                            writes.push(CommittedChange {
                                record: resolved,
                                expected_version: Some(current),
                            });
                            write_kinds.push(PlannedWrite::Resolution);
                        }
                    }

                    outcome.conflicts.push(conflict);
                } else {
                    // base > current: the client claims a version the server
                    // never assigned. Reject the record, keep the batch going.
                    outcome.rejected.push(RejectedChange {
                        change_id: record.change_id,
                        errors: vec![FieldError::new(
                            "base_version",
                            format!("base {base} is ahead of server version {current}"),
                        )],
                    });
                }
            }
        }

        if !writes.is_empty() {
            let applied = self.store.commit(writes).await?;
            for (change, kind) in applied.into_iter().zip(write_kinds) {
                if let PlannedWrite::Clean = kind {
                    outcome.accepted.push(change);
                }
            }
        }

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_conflict(
        &self,
        record: &ChangeRecord,
        kind: EntityKind,
        entity_id: Uuid,
        base: u64,
        current: u64,
        server_payload: Option<&serde_json::Value>,
        server_deleted: bool,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Resolved> {
        match self.policy {
            ConflictPolicy::ServerWins => Ok(Resolved::KeptServer),

            ConflictPolicy::ClientWins => {
                let mut forced = record.clone();
                forced.version = Some(current + 1);
                forced.recorded_at = Some(now);
                forced.origin = Origin::server();
                Ok(Resolved::Write {
                    record: forced,
                    resolution: ConflictResolution::AppliedClient {
                        new_version: current + 1,
                    },
                })
            }

            ConflictPolicy::FieldMerge => {
                // The merge needs three object payloads: the base image from
                // the ledger plus both sides' post-images. Anything else
                // (pruned base, tombstones) degrades to server-wins.
                let base_entry = self.store.entry_at(kind, entity_id, base).await?;
                let base_payload = base_entry.as_ref().and_then(|e| e.payload.as_ref());
                let client_payload = record.payload.as_ref();

                let (Some(base_payload), Some(server_value), Some(client_value)) =
                    (base_payload, server_payload, client_payload)
                else {
                    warn!(
                        entity = %kind, %entity_id, base,
                        "field-merge lacks a base or side image, keeping server state"
                    );
                    return Ok(Resolved::KeptServer);
                };
                if server_deleted {
                    return Ok(Resolved::KeptServer);
                }

                let server_entry = self.store.latest_entry(kind, entity_id).await?;
                let server_touched_at = server_entry
                    .as_ref()
                    .and_then(|e| e.recorded_at)
                    .unwrap_or(now);
                let server_origin = server_entry
                    .as_ref()
                    .map(|e| e.origin.clone())
                    .unwrap_or_else(Origin::server);

                let merged = field_merge(
                    base_payload,
                    MergeSide {
                        payload: server_value,
                        touched_at: server_touched_at,
                        origin: &server_origin,
                    },
                    MergeSide {
                        payload: client_value,
                        touched_at: record.created_at,
                        origin: &record.origin,
                    },
                );

                let mut resolved = record.clone();
                resolved.op = ChangeOp::Update;
                resolved.payload_hash = canonical_json_hash(&merged);
                resolved.payload = Some(merged);
                resolved.version = Some(current + 1);
                resolved.recorded_at = Some(now);
                resolved.origin = Origin::server();
                Ok(Resolved::Write {
                    record: resolved,
                    resolution: ConflictResolution::Merged {
                        new_version: current + 1,
                    },
                })
            }
        }
    }
}

enum Resolved {
    KeptServer,
    Write {
        record: ChangeRecord,
        resolution: ConflictResolution,
    },
}
