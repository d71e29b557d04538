//! Device-side offline queue (outbox pattern).
//!
//! A client applies mutations locally, appends the matching change records
//! to its outbox, and pushes them to the server on the next sync session.
//! Downloaded server records are folded into the local snapshot projection,
//! and the acknowledged cursor lives beside the queue so an interrupted
//! session resumes from the last ACK.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{ChangeOp, ChangeRecord, EntityKind, Origin};
use crate::error::{Result, SyncError};
use crate::store::sqlite::{format_ts, parse_ts, parse_uuid};

/// Local queue and projection for one offline-capable device.
#[async_trait]
pub trait DeviceQueue: Send + Sync {
    /// Queue a locally authored change for the next push.
    async fn enqueue(&self, record: &ChangeRecord) -> Result<()>;

    /// Changes not yet accepted by the server, oldest first.
    async fn pending(&self) -> Result<Vec<ChangeRecord>>;

    /// Mark changes as accepted (or recognized as already applied).
    async fn mark_pushed(&self, change_ids: &[Uuid]) -> Result<()>;

    /// Mark changes the server rejected as invalid. They leave the pending
    /// queue (re-uploading an unchanged record would only be rejected
    /// again) and stay queryable for operator review.
    async fn mark_failed(&self, change_ids: &[Uuid]) -> Result<()>;

    /// Changes marked failed, oldest first.
    async fn failed(&self) -> Result<Vec<ChangeRecord>>;

    /// Fold downloaded server records into the local projection.
    async fn apply_remote(&self, records: &[ChangeRecord]) -> Result<()>;

    /// Last acknowledged server sequence (0 before the first sync).
    async fn cursor(&self) -> Result<u64>;

    /// Persist the cursor; called only after download + reconcile results
    /// are safely stored (the ACK step).
    async fn store_cursor(&self, sequence: u64) -> Result<()>;
}

/// In-memory [`DeviceQueue`] for tests and simulations.
#[derive(Default)]
pub struct MemoryOutbox {
    inner: RwLock<MemoryOutboxInner>,
}

#[derive(Default)]
struct MemoryOutboxInner {
    queue: Vec<ChangeRecord>,
    pushed: Vec<Uuid>,
    failed: Vec<Uuid>,
    remote: HashMap<(EntityKind, Uuid), ChangeRecord>,
    cursor: u64,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local view of an entity after remote applies (latest record wins).
    pub async fn remote_record(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
    ) -> Option<ChangeRecord> {
        let inner = self.inner.read().await;
        inner.remote.get(&(kind, entity_id)).cloned()
    }
}

#[async_trait]
impl DeviceQueue for MemoryOutbox {
    async fn enqueue(&self, record: &ChangeRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.queue.push(record.clone());
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .queue
            .iter()
            .filter(|r| {
                !inner.pushed.contains(&r.change_id) && !inner.failed.contains(&r.change_id)
            })
            .cloned()
            .collect())
    }

    async fn mark_pushed(&self, change_ids: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.pushed.extend_from_slice(change_ids);
        Ok(())
    }

    async fn mark_failed(&self, change_ids: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.failed.extend_from_slice(change_ids);
        Ok(())
    }

    async fn failed(&self) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .queue
            .iter()
            .filter(|r| inner.failed.contains(&r.change_id))
            .cloned()
            .collect())
    }

    async fn apply_remote(&self, records: &[ChangeRecord]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for record in records {
            inner
                .remote
                .insert((record.entity_kind, record.entity_id), record.clone());
        }
        Ok(())
    }

    async fn cursor(&self) -> Result<u64> {
        Ok(self.inner.read().await.cursor)
    }

    async fn store_cursor(&self, sequence: u64) -> Result<()> {
        self.inner.write().await.cursor = sequence;
        Ok(())
    }
}

/// SQLite-backed [`DeviceQueue`].
pub struct SqliteOutbox {
    pool: SqlitePool,
}

fn outbox_record_from_row(row: &SqliteRow) -> Result<ChangeRecord> {
    let payload: Option<String> = row.try_get("payload")?;
    let payload = match payload {
        Some(text) => Some(
            serde_json::from_str(&text)
                .map_err(|e| SyncError::Internal(format!("bad payload json: {e}")))?,
        ),
        None => None,
    };
    let hash_hex: String = row.try_get("payload_hash")?;
    let hash = hex::decode(&hash_hex)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .ok_or_else(|| SyncError::Internal("bad payload hash".into()))?;

    Ok(ChangeRecord {
        change_id: parse_uuid(row.try_get("change_id")?)?,
        entity_kind: EntityKind::parse(row.try_get("entity_kind")?)
            .ok_or_else(|| SyncError::Internal("bad entity kind".into()))?,
        entity_id: parse_uuid(row.try_get("entity_id")?)?,
        op: ChangeOp::parse(row.try_get("op")?)
            .ok_or_else(|| SyncError::Internal("bad change op".into()))?,
        payload,
        payload_hash: hash,
        origin: Origin(row.try_get::<String, _>("origin")?),
        created_at: parse_ts(row.try_get("created_at")?)?,
        recorded_at: None,
        base_version: row
            .try_get::<Option<i64>, _>("base_version")?
            .map(|v| v as u64),
        version: None,
        sequence: None,
    })
}

// Values of the outbox `pushed` column.
const PUSH_STATE_PENDING: i64 = 0;
const PUSH_STATE_PUSHED: i64 = 1;
const PUSH_STATE_FAILED: i64 = 2;

impl SqliteOutbox {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn set_push_state(&self, change_ids: &[Uuid], state: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for change_id in change_ids {
            sqlx::query("UPDATE outbox SET pushed = ? WHERE change_id = ?")
                .bind(state)
                .bind(change_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Open (or create) an outbox database and run migrations.
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

    /// Queue several locally authored changes in one transaction.
    pub async fn enqueue_batch(&self, records: &[ChangeRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            insert_outbox_record(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn insert_outbox_record(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record: &ChangeRecord,
) -> Result<()> {
    let payload_text = record
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| SyncError::Internal(e.to_string()))?;

    sqlx::query(
        "INSERT INTO outbox (change_id, entity_kind, entity_id, op, payload, payload_hash, \
         origin, created_at, base_version) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.change_id.to_string())
    .bind(record.entity_kind.as_str())
    .bind(record.entity_id.to_string())
    .bind(record.op.as_str())
    .bind(&payload_text)
    .bind(hex::encode(record.payload_hash))
    .bind(record.origin.as_str())
    .bind(format_ts(record.created_at))
    .bind(record.base_version.map(|v| v as i64))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl DeviceQueue for SqliteOutbox {
    async fn enqueue(&self, record: &ChangeRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_outbox_record(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query("SELECT * FROM outbox WHERE pushed = ? ORDER BY rowid_local ASC")
            .bind(PUSH_STATE_PENDING)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(outbox_record_from_row).collect()
    }

    async fn mark_pushed(&self, change_ids: &[Uuid]) -> Result<()> {
        self.set_push_state(change_ids, PUSH_STATE_PUSHED).await
    }

    async fn mark_failed(&self, change_ids: &[Uuid]) -> Result<()> {
        self.set_push_state(change_ids, PUSH_STATE_FAILED).await
    }

    async fn failed(&self) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query("SELECT * FROM outbox WHERE pushed = ? ORDER BY rowid_local ASC")
            .bind(PUSH_STATE_FAILED)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(outbox_record_from_row).collect()
    }

    async fn apply_remote(&self, records: &[ChangeRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let payload_text = record
                .payload
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| SyncError::Internal(e.to_string()))?;
            let version = record.version.unwrap_or(0) as i64;
            let updated_at: DateTime<Utc> = record.recorded_at.unwrap_or(record.created_at);

            sqlx::query(
                "INSERT INTO snapshots (entity_kind, entity_id, payload, version, deleted, \
                 updated_at) VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(entity_kind, entity_id) DO UPDATE SET \
                 payload = excluded.payload, version = excluded.version, \
                 deleted = excluded.deleted, updated_at = excluded.updated_at \
                 WHERE excluded.version >= snapshots.version",
            )
            .bind(record.entity_kind.as_str())
            .bind(record.entity_id.to_string())
            .bind(&payload_text)
            .bind(version)
            .bind(record.is_tombstone() as i64)
            .bind(format_ts(updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cursor(&self) -> Result<u64> {
        let row = sqlx::query("SELECT value FROM outbox_meta WHERE key = 'cursor'")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                value
                    .parse()
                    .map_err(|e| SyncError::Internal(format!("bad cursor: {e}")))
            }
            None => Ok(0),
        }
    }

    async fn store_cursor(&self, sequence: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO outbox_meta (key, value) VALUES ('cursor', ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(sequence.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
