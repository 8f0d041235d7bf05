//! Asset sync-state registry for photo binaries.
//!
//! Tracks each captured photo's transfer state independently of the
//! document CRDT - large payloads never block document-field sync. The
//! registry is the data structure; state transitions are driven
//! exclusively by the Photo Asset Synchronizer in the engine crate.

use crate::transport::RemoteAsset;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Unknown asset: {0}")]
    UnknownAsset(String),
}

pub type Result<T> = std::result::Result<T, AssetError>;

/// Transfer state of one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetStatus {
    /// Captured locally, not yet uploaded
    Pending,
    /// Upload in progress
    Syncing,
    /// Upload complete (or known on the server already)
    Synced,
    /// Last upload attempt failed; eligible for retry
    Error,
}

/// Sync state for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub asset_id: String,
    pub entity_id: String,
    /// Where the bytes live on this device. Absent for assets that only
    /// exist remotely.
    pub local_path: Option<String>,
    pub remote_url: Option<String>,
    pub status: AssetStatus,
    pub error: Option<String>,
    pub last_attempt_ms: Option<u64>,
    pub attempts: u32,
}

/// Registry of asset states, keyed by asset id.
pub struct AssetRegistry {
    assets: RwLock<HashMap<String, AssetRecord>>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self {
            assets: RwLock::new(HashMap::new()),
        }
    }

    /// Record a freshly captured asset as pending. Immediately visible
    /// locally.
    pub fn register_local(
        &self,
        asset_id: &str,
        entity_id: &str,
        local_path: &str,
    ) -> AssetRecord {
        let record = AssetRecord {
            asset_id: asset_id.to_string(),
            entity_id: entity_id.to_string(),
            local_path: Some(local_path.to_string()),
            remote_url: None,
            status: AssetStatus::Pending,
            error: None,
            last_attempt_ms: None,
            attempts: 0,
        };
        let mut assets = self.assets.write().unwrap_or_else(|e| e.into_inner());
        assets.insert(asset_id.to_string(), record.clone());
        record
    }

    /// Current state of one asset.
    pub fn state(&self, asset_id: &str) -> Option<AssetRecord> {
        let assets = self.assets.read().unwrap_or_else(|e| e.into_inner());
        assets.get(asset_id).cloned()
    }

    /// All assets belonging to an entity, ordered by asset id.
    pub fn for_entity(&self, entity_id: &str) -> Vec<AssetRecord> {
        let assets = self.assets.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<AssetRecord> = assets
            .values()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        records
    }

    /// Assets that still need an upload attempt (pending or errored).
    pub fn needing_upload(&self, entity_id: &str) -> Vec<AssetRecord> {
        self.for_entity(entity_id)
            .into_iter()
            .filter(|r| matches!(r.status, AssetStatus::Pending | AssetStatus::Error))
            .collect()
    }

    /// Transition to syncing for an upload attempt.
    pub fn mark_syncing(&self, asset_id: &str, now_ms: u64) -> Result<()> {
        self.update(asset_id, |record| {
            record.status = AssetStatus::Syncing;
            record.last_attempt_ms = Some(now_ms);
            record.attempts += 1;
        })
    }

    /// Upload succeeded.
    pub fn mark_synced(&self, asset_id: &str, remote_url: &str) -> Result<()> {
        self.update(asset_id, |record| {
            record.status = AssetStatus::Synced;
            record.remote_url = Some(remote_url.to_string());
            record.error = None;
        })
    }

    /// Upload failed; the asset stays eligible for retry.
    pub fn mark_failed(&self, asset_id: &str, message: &str, now_ms: u64) -> Result<()> {
        self.update(asset_id, |record| {
            record.status = AssetStatus::Error;
            record.error = Some(message.to_string());
            record.last_attempt_ms = Some(now_ms);
        })
    }

    /// Merge the server's asset list for an entity: union by asset id.
    /// Remote-only assets appear as already synced; local assets keep
    /// their state (a pending upload stays pending) but learn their
    /// remote URL if the server already has the bytes.
    ///
    /// Returns the ids whose state changed, for event emission.
    pub fn merge_remote(&self, entity_id: &str, remote: Vec<RemoteAsset>) -> Vec<String> {
        let mut assets = self.assets.write().unwrap_or_else(|e| e.into_inner());
        let mut changed = Vec::new();
        for asset in remote {
            match assets.get_mut(&asset.asset_id) {
                Some(record) => {
                    if record.remote_url.is_none() {
                        record.remote_url = Some(asset.remote_url);
                        record.status = AssetStatus::Synced;
                        record.error = None;
                        changed.push(record.asset_id.clone());
                    }
                }
                None => {
                    changed.push(asset.asset_id.clone());
                    assets.insert(
                        asset.asset_id.clone(),
                        AssetRecord {
                            asset_id: asset.asset_id,
                            entity_id: entity_id.to_string(),
                            local_path: None,
                            remote_url: Some(asset.remote_url),
                            status: AssetStatus::Synced,
                            error: None,
                            last_attempt_ms: None,
                            attempts: 0,
                        },
                    );
                }
            }
        }
        changed
    }

    fn update(&self, asset_id: &str, apply: impl FnOnce(&mut AssetRecord)) -> Result<()> {
        let mut assets = self.assets.write().unwrap_or_else(|e| e.into_inner());
        let record = assets
            .get_mut(asset_id)
            .ok_or_else(|| AssetError::UnknownAsset(asset_id.to_string()))?;
        apply(record);
        Ok(())
    }
}

impl Default for AssetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
