//! Error types for the sync core.

use thiserror::Error;
use uuid::Uuid;

/// A single field-level validation failure.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors that can occur in the sync core.
///
/// Conflicts are deliberately *not* an error variant: they are returned as
/// structured data in the upload receipt so callers can render a resolution
/// UI or apply the configured default policy.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Malformed payload or enum out of range; rejected before the ledger
    #[error("validation failed: {0:?}")]
    Validation(Vec<FieldError>),

    /// PDV has no registered coordinates; geofence fails closed
    #[error("missing reference location for pdv {0}")]
    MissingReferenceLocation(Uuid),

    /// PDV not found
    #[error("pdv not found: {0}")]
    PdvNotFound(Uuid),

    /// Entity not found
    #[error("entity not found: {entity_kind}/{entity_id}")]
    EntityNotFound {
        entity_kind: String,
        entity_id: Uuid,
    },

    /// Version CAS lost a race during commit; the batch was rolled back
    #[error("version conflict for {entity_kind}/{entity_id}: expected {expected}, found {actual}")]
    VersionConflict {
        entity_kind: String,
        entity_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// Batch-level storage failure; nothing was applied, client resubmits
    #[error("storage commit failed: {0}")]
    StorageCommit(String),

    /// Cursor predates the ledger retention window; full resync required
    #[error("stale cursor {cursor}: ledger retained from sequence {retained_floor}")]
    StaleCursor { cursor: u64, retained_floor: u64 },

    /// Cursor ahead of the ledger head or otherwise malformed
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// Payload hash does not match the payload body
    #[error("payload hash mismatch for change {0}")]
    PayloadHashMismatch(Uuid),

    /// Session phase transition not permitted
    #[error("invalid session phase for device {device_id}: {from} -> {to}")]
    InvalidSessionPhase {
        device_id: String,
        from: String,
        to: String,
    },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
