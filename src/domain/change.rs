//! Change records, cursors, and sync receipts.
//!
//! The [`ChangeRecord`] is the contract between offline devices and the
//! server of record: every mutation travels as a full post-image with the
//! version it was based on, and the ledger stores these records append-only.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::FieldError;
use crate::hash::{canonical_json_hash, hash256_hex, Hash256};

/// Identifier of an offline-capable device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a change was authored: a device, or the server itself.
///
/// Server-origin entries are written by the reconciler when it synthesizes
/// a post-image (client-wins force, field-merge result).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Origin(pub String);

impl Origin {
    pub const SERVER: &'static str = "server";

    pub fn server() -> Self {
        Self(Self::SERVER.to_string())
    }

    pub fn device(id: &DeviceId) -> Self {
        Self(id.0.clone())
    }

    pub fn is_server(&self) -> bool {
        self.0 == Self::SERVER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity classification for the sync surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Pdv,
    Visit,
    Agent,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Pdv, EntityKind::Visit, EntityKind::Agent];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Pdv => "pdv",
            EntityKind::Visit => "visit",
            EntityKind::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdv" => Some(EntityKind::Pdv),
            "visit" => Some(EntityKind::Visit),
            "agent" => Some(EntityKind::Agent),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operation kind for a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Create => "create",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(ChangeOp::Create),
            "update" => Some(ChangeOp::Update),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// One entity mutation, as recorded in the append-only ledger.
///
/// Deletions are tombstones: `op = delete`, `payload = None`. The record is
/// never mutated after append; `version` and `sequence` are assigned by the
/// server on acceptance and are `None` while the change sits in a device
/// outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Client-assigned id; the idempotency key for replayed batches.
    pub change_id: Uuid,

    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub op: ChangeOp,

    /// Full post-image; `None` for tombstones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// SHA-256 over the canonical JSON payload (zeroed for tombstones).
    #[serde(with = "hash256_hex")]
    pub payload_hash: Hash256,

    /// Device id, or `server` for reconciler-authored entries.
    pub origin: Origin,

    /// Client-side authoring timestamp (metadata; not used for ordering).
    pub created_at: DateTime<Utc>,

    /// Server wall-clock at append; `None` until accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,

    /// Entity version this edit was based on; `None` for creates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,

    /// Per-entity version assigned on acceptance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,

    /// Global ledger sequence assigned on append; the cursor watermark.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl ChangeRecord {
    pub fn create(
        entity_kind: EntityKind,
        entity_id: Uuid,
        payload: Value,
        origin: Origin,
        created_at: DateTime<Utc>,
    ) -> Self {
        let payload_hash = canonical_json_hash(&payload);
        Self {
            change_id: Uuid::new_v4(),
            entity_kind,
            entity_id,
            op: ChangeOp::Create,
            payload: Some(payload),
            payload_hash,
            origin,
            created_at,
            recorded_at: None,
            base_version: None,
            version: None,
            sequence: None,
        }
    }

    pub fn update(
        entity_kind: EntityKind,
        entity_id: Uuid,
        payload: Value,
        base_version: u64,
        origin: Origin,
        created_at: DateTime<Utc>,
    ) -> Self {
        let payload_hash = canonical_json_hash(&payload);
        Self {
            change_id: Uuid::new_v4(),
            entity_kind,
            entity_id,
            op: ChangeOp::Update,
            payload: Some(payload),
            payload_hash,
            origin,
            created_at,
            recorded_at: None,
            base_version: Some(base_version),
            version: None,
            sequence: None,
        }
    }

    pub fn delete(
        entity_kind: EntityKind,
        entity_id: Uuid,
        base_version: u64,
        origin: Origin,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            entity_kind,
            entity_id,
            op: ChangeOp::Delete,
            payload: None,
            payload_hash: [0u8; 32],
            origin,
            created_at,
            recorded_at: None,
            base_version: Some(base_version),
            version: None,
            sequence: None,
        }
    }

    /// Whether the stored hash matches the payload body.
    pub fn payload_hash_valid(&self) -> bool {
        match &self.payload {
            Some(payload) => canonical_json_hash(payload) == self.payload_hash,
            None => self.payload_hash == [0u8; 32],
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.op == ChangeOp::Delete
    }
}

/// Per-device watermark into the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub device_id: DeviceId,
    /// Last ledger sequence this device has acknowledged.
    pub last_sequence: u64,
    /// Server time at the acknowledging sync; diagnostics only.
    pub acked_at: DateTime<Utc>,
}

impl SyncCursor {
    /// Cursor for a device that has never synced.
    pub fn origin(device_id: DeviceId, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            last_sequence: 0,
            acked_at: now,
        }
    }
}

/// How a detected conflict was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Client change discarded; server state kept unchanged.
    KeptServer,
    /// Client payload forced; entity bumped to `new_version`.
    AppliedClient { new_version: u64 },
    /// Field-level merge applied; entity bumped to `new_version`.
    Merged { new_version: u64 },
}

/// A conflicting concurrent edit, always reported regardless of how the
/// configured policy resolved it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub change_id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    /// Version the client's edit was based on.
    pub base_version: u64,
    /// Server version at reconcile time.
    pub server_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_payload: Option<Value>,
    pub resolution: ConflictResolution,
}

/// A change accepted into the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedChange {
    pub change_id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub new_version: u64,
    pub sequence: u64,
}

/// A change rejected before the ledger, with field-level errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedChange {
    pub change_id: Uuid,
    pub errors: Vec<FieldError>,
}

/// Result of `UploadChanges` for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub accepted: Vec<AppliedChange>,
    /// Replayed changes recognized by their client id; no-ops, not conflicts.
    pub already_applied: Vec<Uuid>,
    pub rejected: Vec<RejectedChange>,
    pub conflicts: Vec<ConflictRecord>,
    /// Ledger head after the batch committed.
    pub head_sequence: u64,
    pub server_time: DateTime<Utc>,
}

impl UploadReceipt {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.conflicts.is_empty()
    }
}
