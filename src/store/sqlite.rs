//! SQLite-backed server store.
//!
//! Uuids and timestamps are bound as text. Timestamps use fixed-width
//! RFC 3339 with microsecond precision so lexicographic comparison in SQL
//! matches chronological order (retention pruning relies on this).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::domain::{
    AppliedChange, ChangeOp, ChangeRecord, DeviceId, EntityKind, Origin, SyncCursor,
};
use crate::error::{Result, SyncError};
use crate::store::{ChangeLedger, CommittedChange, EntitySnapshot, SnapshotStore, SyncStore};

pub(crate) fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Internal(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| SyncError::Internal(format!("bad uuid {s:?}: {e}")))
}

fn parse_kind(s: &str) -> Result<EntityKind> {
    EntityKind::parse(s).ok_or_else(|| SyncError::Internal(format!("bad entity kind {s:?}")))
}

fn parse_op(s: &str) -> Result<ChangeOp> {
    ChangeOp::parse(s).ok_or_else(|| SyncError::Internal(format!("bad change op {s:?}")))
}

fn parse_hash(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| SyncError::Internal(format!("bad hash: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| SyncError::Internal("hash is not 32 bytes".into()))
}

fn record_from_row(row: &SqliteRow) -> Result<ChangeRecord> {
    let payload: Option<String> = row.try_get("payload")?;
    let payload = match payload {
        Some(text) => Some(
            serde_json::from_str(&text)
                .map_err(|e| SyncError::Internal(format!("bad payload json: {e}")))?,
        ),
        None => None,
    };

    Ok(ChangeRecord {
        change_id: parse_uuid(row.try_get("change_id")?)?,
        entity_kind: parse_kind(row.try_get("entity_kind")?)?,
        entity_id: parse_uuid(row.try_get("entity_id")?)?,
        op: parse_op(row.try_get("op")?)?,
        payload,
        payload_hash: parse_hash(row.try_get("payload_hash")?)?,
        origin: Origin(row.try_get::<String, _>("origin")?),
        created_at: parse_ts(row.try_get("created_at")?)?,
        recorded_at: Some(parse_ts(row.try_get("recorded_at")?)?),
        base_version: row
            .try_get::<Option<i64>, _>("base_version")?
            .map(|v| v as u64),
        version: Some(row.try_get::<i64, _>("version")? as u64),
        sequence: Some(row.try_get::<i64, _>("sequence")? as u64),
    })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<EntitySnapshot> {
    let payload: Option<String> = row.try_get("payload")?;
    let payload = match payload {
        Some(text) => Some(
            serde_json::from_str(&text)
                .map_err(|e| SyncError::Internal(format!("bad snapshot json: {e}")))?,
        ),
        None => None,
    };

    Ok(EntitySnapshot {
        entity_kind: parse_kind(row.try_get("entity_kind")?)?,
        entity_id: parse_uuid(row.try_get("entity_id")?)?,
        payload,
        version: row.try_get::<i64, _>("version")? as u64,
        deleted: row.try_get::<i64, _>("deleted")? != 0,
        updated_at: parse_ts(row.try_get("updated_at")?)?,
    })
}

/// SQLite-backed [`SyncStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations. For in-memory databases the pool is
    /// pinned to a single connection so every handle sees the same store.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new().max_connections(1)
        } else {
            SqlitePoolOptions::new()
        };
        let pool = options.connect(url).await?;
        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| SyncError::Internal(format!("migrations failed: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ChangeLedger for SqliteStore {
    async fn head_sequence(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS head FROM ledger")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("head")? as u64)
    }

    async fn retained_floor(&self) -> Result<u64> {
        let row = sqlx::query("SELECT value FROM ledger_meta WHERE key = 'retained_floor'")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                value
                    .parse()
                    .map_err(|e| SyncError::Internal(format!("bad retained_floor: {e}")))
            }
            None => Ok(1),
        }
    }

    async fn changes_since(
        &self,
        cursor: u64,
        kinds: &[EntityKind],
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; kinds.len()].join(", ");
        let sql = format!(
            "SELECT * FROM ledger WHERE sequence > ? AND entity_kind IN ({placeholders}) \
             ORDER BY sequence ASC LIMIT ?"
        );
        let mut query = sqlx::query(&sql).bind(cursor as i64);
        for kind in kinds {
            query = query.bind(kind.as_str());
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn pending_counts_since(&self, cursor: u64) -> Result<BTreeMap<EntityKind, u64>> {
        let rows = sqlx::query(
            "SELECT entity_kind, COUNT(*) AS pending FROM ledger WHERE sequence > ? \
             GROUP BY entity_kind",
        )
        .bind(cursor as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let kind = parse_kind(row.try_get("entity_kind")?)?;
            counts.insert(kind, row.try_get::<i64, _>("pending")? as u64);
        }
        Ok(counts)
    }

    async fn entry_at(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        version: u64,
    ) -> Result<Option<ChangeRecord>> {
        let row = sqlx::query(
            "SELECT * FROM ledger WHERE entity_kind = ? AND entity_id = ? AND version = ?",
        )
        .bind(kind.as_str())
        .bind(entity_id.to_string())
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn latest_entry(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> Result<Option<ChangeRecord>> {
        let row = sqlx::query(
            "SELECT * FROM ledger WHERE entity_kind = ? AND entity_id = ? \
             ORDER BY version DESC LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(entity_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn change_exists(&self, change_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM ledger WHERE change_id = ?")
            .bind(change_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn prune_recorded_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let head: i64 = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS head FROM ledger")
            .fetch_one(&mut *tx)
            .await?
            .try_get("head")?;

        let pruned = sqlx::query("DELETE FROM ledger WHERE recorded_at < ?")
            .bind(format_ts(cutoff))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if pruned > 0 {
            let floor: i64 = sqlx::query(
                "SELECT COALESCE(MIN(sequence), ? + 1) AS floor FROM ledger",
            )
            .bind(head)
            .fetch_one(&mut *tx)
            .await?
            .try_get("floor")?;

            sqlx::query(
                "INSERT INTO ledger_meta (key, value) VALUES ('retained_floor', ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(floor.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(pruned)
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn get_snapshot(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> Result<Option<EntitySnapshot>> {
        let row = sqlx::query("SELECT * FROM snapshots WHERE entity_kind = ? AND entity_id = ?")
            .bind(kind.as_str())
            .bind(entity_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn list_snapshots(&self, kind: EntityKind) -> Result<Vec<EntitySnapshot>> {
        let rows = sqlx::query("SELECT * FROM snapshots WHERE entity_kind = ? AND deleted = 0")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(snapshot_from_row).collect()
    }
}

#[async_trait]
impl SyncStore for SqliteStore {
    async fn commit(&self, writes: Vec<CommittedChange>) -> Result<Vec<AppliedChange>> {
        let mut tx = self.pool.begin().await?;
        let mut applied = Vec::with_capacity(writes.len());

        for write in writes {
            let record = &write.record;
            let version = record
                .version
                .ok_or_else(|| SyncError::Internal("commit without assigned version".into()))?;
            let recorded_at = record
                .recorded_at
                .ok_or_else(|| SyncError::Internal("commit without recorded_at".into()))?;
            let payload_text = record
                .payload
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| SyncError::Internal(e.to_string()))?;

            // Snapshot CAS: guarded update for existing entities, plain
            // insert for new ones. A miss means a concurrent session won the
            // race since the reconciler read its snapshot.
            let cas = match write.expected_version {
                Some(expected) => {
                    sqlx::query(
                        "UPDATE snapshots SET payload = ?, version = ?, deleted = ?, \
                         updated_at = ? WHERE entity_kind = ? AND entity_id = ? AND version = ?",
                    )
                    .bind(&payload_text)
                    .bind(version as i64)
                    .bind(record.is_tombstone() as i64)
                    .bind(format_ts(recorded_at))
                    .bind(record.entity_kind.as_str())
                    .bind(record.entity_id.to_string())
                    .bind(expected as i64)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
                }
                None => {
                    let inserted = sqlx::query(
                        "INSERT OR IGNORE INTO snapshots \
                         (entity_kind, entity_id, payload, version, deleted, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(record.entity_kind.as_str())
                    .bind(record.entity_id.to_string())
                    .bind(&payload_text)
                    .bind(version as i64)
                    .bind(record.is_tombstone() as i64)
                    .bind(format_ts(recorded_at))
                    .execute(&mut *tx)
                    .await?;
                    inserted.rows_affected()
                }
            };
            if cas != 1 {
                return Err(SyncError::StorageCommit(format!(
                    "version race on {}/{}",
                    record.entity_kind, record.entity_id
                )));
            }

            let insert = sqlx::query(
                "INSERT INTO ledger (change_id, entity_kind, entity_id, op, payload, \
                 payload_hash, origin, created_at, recorded_at, base_version, version) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.change_id.to_string())
            .bind(record.entity_kind.as_str())
            .bind(record.entity_id.to_string())
            .bind(record.op.as_str())
            .bind(&payload_text)
            .bind(hex::encode(record.payload_hash))
            .bind(record.origin.as_str())
            .bind(format_ts(record.created_at))
            .bind(format_ts(recorded_at))
            .bind(record.base_version.map(|v| v as i64))
            .bind(version as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| SyncError::StorageCommit(format!("ledger append failed: {e}")))?;

            applied.push(AppliedChange {
                change_id: record.change_id,
                entity_kind: record.entity_kind,
                entity_id: record.entity_id,
                new_version: version,
                sequence: insert.last_insert_rowid() as u64,
            });
        }

        tx.commit().await?;
        Ok(applied)
    }

    async fn get_cursor(&self, device_id: &DeviceId) -> Result<Option<SyncCursor>> {
        let row = sqlx::query("SELECT * FROM cursors WHERE device_id = ?")
            .bind(device_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(SyncCursor {
                device_id: DeviceId::new(row.try_get::<String, _>("device_id")?),
                last_sequence: row.try_get::<i64, _>("last_sequence")? as u64,
                acked_at: parse_ts(row.try_get("acked_at")?)?,
            })),
            None => Ok(None),
        }
    }

    async fn set_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        sqlx::query(
            "INSERT INTO cursors (device_id, last_sequence, acked_at) VALUES (?, ?, ?) \
             ON CONFLICT(device_id) DO UPDATE SET last_sequence = excluded.last_sequence, \
             acked_at = excluded.acked_at",
        )
        .bind(cursor.device_id.as_str())
        .bind(cursor.last_sequence as i64)
        .bind(format_ts(cursor.acked_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
