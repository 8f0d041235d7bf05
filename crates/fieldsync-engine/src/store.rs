//! Durable per-entity persistence: document snapshots, replica
//! identity, and sync cursors.
//!
//! Layout under the storage root:
//! - `replica.json` - replica id plus the per-entity server cursors
//! - `documents/<entity_id>.snap` - document snapshot (binary envelope)
//!
//! Documents are loaded lazily and cached; snapshots are rewritten after
//! each mutation batch so a process restart recovers exactly the last
//! persisted state. The Operation Log keeps its own journals (see
//! `fieldsync_core::oplog`), replayed independently on startup.

use fieldsync_core::document::{DocumentError, InspectionDocument};
use fieldsync_core::replica::ReplicaId;
use fieldsync_core::storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Store state corrupt: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const REPLICA_KEY: &str = "replica.json";

/// Persisted identity and sync progress for this install.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplicaState {
    replica_id: ReplicaId,
    /// Last known server cursor per entity.
    #[serde(default)]
    cursors: BTreeMap<String, u64>,
}

/// Documents and sync cursors backed by durable storage.
pub struct EntityStore<S: Storage> {
    storage: S,
    replica_id: ReplicaId,
    cursors: BTreeMap<String, u64>,
    documents: HashMap<String, InspectionDocument>,
}

impl<S: Storage> EntityStore<S> {
    /// Open the store, minting and persisting a replica id on first run.
    pub async fn open(storage: S) -> Result<Self> {
        let (replica_id, cursors) = if storage.exists(REPLICA_KEY).await? {
            let bytes = storage.read(REPLICA_KEY).await?;
            let state: ReplicaState = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("replica state: {e}")))?;
            debug!("Opened store as replica {}", state.replica_id);
            (state.replica_id, state.cursors)
        } else {
            let replica_id = ReplicaId::generate();
            info!("First run: minted replica id {}", replica_id);
            (replica_id, BTreeMap::new())
        };

        let store = Self {
            storage,
            replica_id,
            cursors,
            documents: HashMap::new(),
        };
        store.persist_replica().await?;
        Ok(store)
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn snapshot_key(entity_id: &str) -> String {
        format!("documents/{entity_id}.snap")
    }

    async fn persist_replica(&self) -> Result<()> {
        let state = ReplicaState {
            replica_id: self.replica_id,
            cursors: self.cursors.clone(),
        };
        let bytes =
            serde_json::to_vec(&state).expect("replica state serialization should not fail");
        self.storage.write(REPLICA_KEY, &bytes).await?;
        Ok(())
    }

    /// Get (loading or creating as needed) the document for an entity.
    pub async fn document(&mut self, entity_id: &str) -> Result<&mut InspectionDocument> {
        if !self.documents.contains_key(entity_id) {
            let key = Self::snapshot_key(entity_id);
            let doc = if self.storage.exists(&key).await? {
                let bytes = self.storage.read(&key).await?;
                InspectionDocument::decode(&bytes, self.replica_id)?
            } else {
                InspectionDocument::new(entity_id, self.replica_id)
            };
            self.documents.insert(entity_id.to_string(), doc);
        }
        Ok(self
            .documents
            .get_mut(entity_id)
            .expect("document just inserted"))
    }

    /// A consistent point-in-time copy for UI reads. Never exposes a
    /// partially merged document.
    pub async fn snapshot(&mut self, entity_id: &str) -> Result<InspectionDocument> {
        Ok(self.document(entity_id).await?.clone())
    }

    /// Rewrite an entity's durable snapshot from the cached document.
    pub async fn persist_document(&mut self, entity_id: &str) -> Result<()> {
        let Some(doc) = self.documents.get(entity_id) else {
            return Ok(());
        };
        let key = Self::snapshot_key(entity_id);
        self.storage.write(&key, &doc.encode()).await?;
        Ok(())
    }

    /// Last known server cursor for an entity (0 = never synced).
    pub fn cursor(&self, entity_id: &str) -> u64 {
        self.cursors.get(entity_id).copied().unwrap_or(0)
    }

    /// Advance and persist the cursor for an entity.
    pub async fn set_cursor(&mut self, entity_id: &str, cursor: u64) -> Result<()> {
        self.cursors.insert(entity_id.to_string(), cursor);
        self.persist_replica().await
    }
}
