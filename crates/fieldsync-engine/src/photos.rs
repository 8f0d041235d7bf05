//! Photo Asset Synchronizer: upload pipeline for large binary payloads.
//!
//! Photos are tracked per asset, independently of the document CRDT -
//! a slow or failing upload never blocks document-field sync. Uploads
//! are keyed by asset id, so a retry after a half-completed attempt
//! cannot create a duplicate remote asset.

use fieldsync_core::assets::{AssetError, AssetRegistry, AssetStatus};
use fieldsync_core::events::{EventBus, SyncEvent};
use fieldsync_core::storage::{Storage, StorageError};
use fieldsync_core::time::now_ms;
use fieldsync_core::transport::{SyncTransport, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Asset(#[from] AssetError),
}

pub type Result<T> = std::result::Result<T, PhotoError>;

/// Outcome counts for one `sync_report` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub uploaded: usize,
    pub failed: usize,
    /// Assets with no local bytes (remote-only, nothing to upload).
    pub skipped: usize,
}

/// Drives asset state transitions: capture, upload, server merge.
pub struct PhotoSynchronizer<T, S> {
    transport: Arc<T>,
    storage: S,
    assets: Arc<AssetRegistry>,
    events: Arc<EventBus>,
}

impl<T: SyncTransport, S: Storage> PhotoSynchronizer<T, S> {
    pub(crate) fn new(
        transport: Arc<T>,
        storage: S,
        assets: Arc<AssetRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            transport,
            storage,
            assets,
            events,
        }
    }

    fn asset_key(asset_id: &str) -> String {
        format!("assets/{asset_id}")
    }

    fn emit_status(&self, asset_id: &str, entity_id: &str, status: AssetStatus) {
        self.events.emit(SyncEvent::AssetStatusChanged {
            asset_id: asset_id.to_string(),
            entity_id: entity_id.to_string(),
            status,
            timestamp: now_ms(),
        });
    }

    /// Store a captured photo's bytes durably and register it as
    /// pending. Immediately visible locally; never touches the network.
    /// A full local store surfaces as `StorageError::Full`.
    pub async fn store_local(&self, entity_id: &str, bytes: &[u8]) -> Result<String> {
        let asset_id = Uuid::new_v4().to_string();
        let key = Self::asset_key(&asset_id);
        self.storage.write(&key, bytes).await?;
        self.assets.register_local(&asset_id, entity_id, &key);
        self.emit_status(&asset_id, entity_id, AssetStatus::Pending);
        debug!("Captured asset {} for entity {}", asset_id, entity_id);
        Ok(asset_id)
    }

    /// Attempt an upload for every pending or errored asset of an
    /// entity. Per-asset failures are recorded in the registry (and
    /// counted), not returned as an error - each asset stays eligible
    /// for the next attempt.
    pub async fn sync_report(&self, entity_id: &str) -> Result<ReportSummary> {
        let mut summary = ReportSummary::default();

        for record in self.assets.needing_upload(entity_id) {
            let Some(local_path) = record.local_path.as_deref() else {
                summary.skipped += 1;
                continue;
            };

            self.assets.mark_syncing(&record.asset_id, now_ms())?;
            self.emit_status(&record.asset_id, entity_id, AssetStatus::Syncing);

            let bytes = match self.storage.read(local_path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    let message = format!("local bytes unavailable: {err}");
                    warn!("Asset {} upload skipped: {}", record.asset_id, message);
                    self.assets
                        .mark_failed(&record.asset_id, &message, now_ms())?;
                    self.emit_status(&record.asset_id, entity_id, AssetStatus::Error);
                    summary.failed += 1;
                    continue;
                }
            };

            match self.transport.upload_asset(&record.asset_id, &bytes).await {
                Ok(remote_url) => {
                    self.assets.mark_synced(&record.asset_id, &remote_url)?;
                    self.emit_status(&record.asset_id, entity_id, AssetStatus::Synced);
                    debug!("Uploaded asset {} -> {}", record.asset_id, remote_url);
                    summary.uploaded += 1;
                }
                Err(err) => {
                    warn!("Asset {} upload failed: {}", record.asset_id, err);
                    self.assets
                        .mark_failed(&record.asset_id, &err.to_string(), now_ms())?;
                    self.emit_status(&record.asset_id, entity_id, AssetStatus::Error);
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Merge the server's asset list for an entity into local state:
    /// union by asset id, local-only assets stay pending, remote-only
    /// assets appear as synced. Returns how many records changed.
    pub async fn initialize_from_server(&self, entity_id: &str) -> Result<usize> {
        let remote = self.transport.fetch_assets(entity_id).await?;
        let changed = self.assets.merge_remote(entity_id, remote);
        for asset_id in &changed {
            self.emit_status(asset_id, entity_id, AssetStatus::Synced);
        }
        debug!(
            "Initialized {} asset records for entity {} from server",
            changed.len(),
            entity_id
        );
        Ok(changed.len())
    }
}
