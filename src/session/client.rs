//! Device-side sync driver.
//!
//! [`SyncClient`] walks a [`DeviceQueue`] through a full session against a
//! [`SyncTransport`]: check, page downloads into the local projection, push
//! the outbox, then acknowledge. The cursor is persisted only after the
//! downloaded pages and upload results are safely stored, so an interrupted
//! session replays from the last ACK and the server deduplicates by change
//! id.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::{DeviceId, EntityKind, UploadReceipt};
use crate::error::Result;
use crate::session::{CheckReport, DownloadBatch, SyncService};
use crate::store::{DeviceQueue, SyncStore};

/// Transport to the server-side sync operations. Implemented in-process for
/// embedded/test use; an HTTP client would implement the same seam.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn check(&self, device_id: &DeviceId, cursor: u64) -> Result<CheckReport>;

    async fn download(
        &self,
        device_id: &DeviceId,
        cursor: u64,
        kinds: &[EntityKind],
    ) -> Result<DownloadBatch>;

    async fn upload(
        &self,
        device_id: &DeviceId,
        records: Vec<crate::domain::ChangeRecord>,
    ) -> Result<UploadReceipt>;

    async fn ack(&self, device_id: &DeviceId, cursor: u64) -> Result<()>;
}

/// Transport that calls a [`SyncService`] directly.
pub struct InProcessTransport<S> {
    service: Arc<SyncService<S>>,
}

impl<S> InProcessTransport<S> {
    pub fn new(service: Arc<SyncService<S>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S: SyncStore + 'static> SyncTransport for InProcessTransport<S> {
    async fn check(&self, device_id: &DeviceId, cursor: u64) -> Result<CheckReport> {
        self.service.check(device_id, cursor).await
    }

    async fn download(
        &self,
        device_id: &DeviceId,
        cursor: u64,
        kinds: &[EntityKind],
    ) -> Result<DownloadBatch> {
        self.service.download(device_id, cursor, kinds).await
    }

    async fn upload(
        &self,
        device_id: &DeviceId,
        records: Vec<crate::domain::ChangeRecord>,
    ) -> Result<UploadReceipt> {
        self.service.upload(device_id, records).await
    }

    async fn ack(&self, device_id: &DeviceId, cursor: u64) -> Result<()> {
        self.service.ack(device_id, cursor).await
    }
}

/// Outcome of one full client-driven session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub check: CheckReport,
    pub downloaded: usize,
    pub receipt: Option<UploadReceipt>,
    pub acked_cursor: u64,
}

/// Drives one device through complete sync sessions.
pub struct SyncClient<Q, T> {
    device_id: DeviceId,
    queue: Q,
    transport: T,
    kinds: Vec<EntityKind>,
}

impl<Q: DeviceQueue, T: SyncTransport> SyncClient<Q, T> {
    pub fn new(device_id: DeviceId, queue: Q, transport: T) -> Self {
        Self {
            device_id,
            queue,
            transport,
            kinds: EntityKind::ALL.to_vec(),
        }
    }

    /// Restrict downloads to a subset of entity kinds.
    pub fn with_kinds(mut self, kinds: Vec<EntityKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Run one full session: check, download all pages, upload the pending
    /// outbox, acknowledge the new watermark.
    pub async fn sync(&self) -> Result<SessionReport> {
        let mut cursor = self.queue.cursor().await?;
        let check = self.transport.check(&self.device_id, cursor).await?;
        debug!(device = %self.device_id, pending = check.pending_total(), "session check");

        let mut downloaded = 0;
        loop {
            let batch = self
                .transport
                .download(&self.device_id, cursor, &self.kinds)
                .await?;
            if batch.changes.is_empty() {
                break;
            }
            self.queue.apply_remote(&batch.changes).await?;
            // Local progress only; the server cursor moves at ACK.
            self.queue.store_cursor(batch.new_cursor).await?;
            downloaded += batch.changes.len();
            cursor = batch.new_cursor;
            if !batch.has_more {
                break;
            }
        }

        let pending = self.queue.pending().await?;
        let receipt = if pending.is_empty() {
            None
        } else {
            let receipt = self.transport.upload(&self.device_id, pending).await?;
            let mut settled: Vec<_> = receipt.accepted.iter().map(|a| a.change_id).collect();
            settled.extend(receipt.already_applied.iter().copied());
            // Conflicts were resolved server-side; the local copy is settled
            // either way and the resolution arrives on the next download.
            settled.extend(receipt.conflicts.iter().map(|c| c.change_id));
            self.queue.mark_pushed(&settled).await?;

            // Rejected records would only be rejected again unchanged, so
            // they leave the pending queue too, flagged for review.
            if !receipt.rejected.is_empty() {
                let failed: Vec<_> = receipt.rejected.iter().map(|r| r.change_id).collect();
                warn!(
                    device = %self.device_id,
                    rejected = failed.len(),
                    "server rejected outbox changes, parking them"
                );
                self.queue.mark_failed(&failed).await?;
            }
            Some(receipt)
        };

        self.transport.ack(&self.device_id, cursor).await?;
        self.queue.store_cursor(cursor).await?;

        info!(
            device = %self.device_id,
            downloaded,
            uploaded = receipt.as_ref().map(|r| r.accepted.len()).unwrap_or(0),
            cursor,
            "session complete"
        );
        Ok(SessionReport {
            check,
            downloaded,
            receipt: receipt.clone(),
            acked_cursor: cursor,
        })
    }
}
