//! Sync Orchestrator: coordinates connectivity, the Operation Log, the
//! document store, presence, and photo assets.
//!
//! One state machine per entity: Idle -> Syncing -> (Success | Error)
//! -> Idle. A sync run pulls remote deltas since the last server
//! cursor, merges them, then drains the Operation Log and pushes each
//! operation's delta. Runs for the same entity are mutually exclusive
//! (`sync_now` during a run coalesces into it); runs for different
//! entities proceed concurrently.
//!
//! This is the only component that talks to the network. Local mutation
//! (`mutate`, `add_photo` registration) completes without any
//! network-dependent await - the offline-first guarantee. Connectivity
//! is pushed in from the platform via `set_connected`; going offline
//! mid-run aborts the in-flight transport call and leaves the log and
//! store consistent.

use crate::backoff::{BackoffConfig, BackoffState};
use crate::photos::{PhotoError, PhotoSynchronizer, ReportSummary};
use crate::store::{EntityStore, StoreError};
use fieldsync_core::assets::{AssetRecord, AssetRegistry};
use fieldsync_core::document::{DocumentError, GeoPoint, InspectionDocument, Mutation, PhotoKind};
use fieldsync_core::events::{EventBus, SyncEvent, SyncState};
use fieldsync_core::oplog::{
    FailureOutcome, Operation, OperationKind, OperationLog, OplogConfig, OplogError,
};
use fieldsync_core::presence::{PresenceConfig, PresenceRecord, PresenceTracker};
use fieldsync_core::replica::ReplicaId;
use fieldsync_core::storage::Storage;
use fieldsync_core::time::now_ms;
use fieldsync_core::transport::{SyncTransport, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Oplog(#[from] OplogError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Photo(#[from] PhotoError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Configuration for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Operations drained per push batch.
    pub batch_size: usize,
    /// A run exceeding this is treated as a transport error, never left
    /// hanging.
    pub sync_timeout: Duration,
    /// Retry policy for individual operations.
    pub oplog: OplogConfig,
    /// Heartbeat cadence and expiry for presence.
    pub presence: PresenceConfig,
    /// Pacing for whole-entity retries after a failed run.
    pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            sync_timeout: Duration::from_secs(30),
            oplog: OplogConfig::default(),
            presence: PresenceConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Per-entity runtime state.
struct EntityCell {
    /// Mutual exclusion for sync runs on this entity.
    sync_lock: Mutex<()>,
    /// Set when `sync_now` arrives during a run; the run goes again
    /// before releasing the lock.
    rerun: AtomicBool,
    state: StdRwLock<SyncState>,
    backoff: StdMutex<BackoffState>,
}

impl EntityCell {
    fn new() -> Self {
        Self {
            sync_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
            state: StdRwLock::new(SyncState::Idle),
            backoff: StdMutex::new(BackoffState::new()),
        }
    }
}

struct Inner<T, S: Storage> {
    config: SyncConfig,
    replica_id: ReplicaId,
    transport: Arc<T>,
    store: RwLock<EntityStore<S>>,
    oplog: Mutex<OperationLog<S>>,
    presence: PresenceTracker,
    assets: Arc<AssetRegistry>,
    photos: PhotoSynchronizer<T, S>,
    events: Arc<EventBus>,
    connected: watch::Sender<bool>,
    entities: StdMutex<HashMap<String, Arc<EntityCell>>>,
}

/// Handle to the per-process sync service. Cheap to clone; constructed
/// once and passed by reference to callers (no global singletons).
pub struct SyncOrchestrator<T, S: Storage> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S: Storage> Clone for SyncOrchestrator<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, S> SyncOrchestrator<T, S>
where
    T: SyncTransport + 'static,
    S: Storage + Clone + 'static,
{
    /// Open the orchestrator over durable storage. Starts offline; the
    /// platform's reachability observer pushes connectivity in via
    /// `set_connected`.
    pub async fn open(transport: T, storage: S, config: SyncConfig) -> Result<Self> {
        let transport = Arc::new(transport);
        let store = EntityStore::open(storage.clone()).await?;
        let replica_id = store.replica_id();
        let oplog = OperationLog::open(storage.clone(), config.oplog.clone()).await?;
        let events = Arc::new(EventBus::new());
        let assets = Arc::new(AssetRegistry::new());
        let photos = PhotoSynchronizer::new(
            Arc::clone(&transport),
            storage,
            Arc::clone(&assets),
            Arc::clone(&events),
        );
        let (connected, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                presence: PresenceTracker::new(config.presence.clone()),
                config,
                replica_id,
                transport,
                store: RwLock::new(store),
                oplog: Mutex::new(oplog),
                assets,
                photos,
                events,
                connected,
                entities: StdMutex::new(HashMap::new()),
            }),
        })
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.inner.replica_id
    }

    /// The event bus UI layers subscribe to.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.events)
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Push a connectivity transition in from the platform's
    /// reachability observer. Coming online kicks off a sync for every
    /// entity with pending work; going offline aborts in-flight runs at
    /// their next suspension point.
    pub async fn set_connected(&self, connected: bool) {
        let was = *self.inner.connected.borrow();
        if was == connected {
            return;
        }
        info!(
            "Connectivity {}",
            if connected { "restored" } else { "lost" }
        );
        self.inner.connected.send_replace(connected);

        if connected {
            let pending = {
                let oplog = self.inner.oplog.lock().await;
                oplog.entities_with_pending()
            };
            for entity_id in pending {
                self.spawn_sync(entity_id);
            }
        }
    }

    fn spawn_sync(&self, entity_id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.sync_now(&entity_id).await {
                warn!("Background sync for {} failed: {}", entity_id, err);
            }
        });
    }

    /// Schedule a sync for `entity_id` after `delay`, provided the
    /// orchestrator is still online when the timer fires. Routed through
    /// this non-async helper (rather than an inline spawn inside a sync
    /// run) so the spawned task's `Send` obligation does not recurse into
    /// the run it was scheduled from.
    fn spawn_delayed_sync(&self, entity_id: String, delay: Duration, context: &'static str) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let connected = *this.inner.connected.borrow();
            if connected {
                if let Err(err) = this.sync_now(&entity_id).await {
                    warn!("{} sync for {} failed: {}", context, entity_id, err);
                }
            }
        });
    }

    fn cell(&self, entity_id: &str) -> Arc<EntityCell> {
        let mut entities = self
            .inner
            .entities
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            entities
                .entry(entity_id.to_string())
                .or_insert_with(|| Arc::new(EntityCell::new())),
        )
    }

    fn set_state(&self, entity_id: &str, cell: &EntityCell, state: SyncState) {
        *cell.state.write().unwrap_or_else(|e| e.into_inner()) = state;
        self.inner.events.emit(SyncEvent::SyncStateChanged {
            entity_id: entity_id.to_string(),
            state,
            timestamp: now_ms(),
        });
    }

    /// Current sync phase for an entity (always queryable).
    pub fn sync_status(&self, entity_id: &str) -> SyncState {
        *self
            .cell(entity_id)
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Local mutation (offline-first path) ====================

    /// Apply a user mutation: optimistically to the local document,
    /// durably to the Operation Log. Completes without network access.
    /// Returns the queued operation's id.
    pub async fn mutate(
        &self,
        entity_id: &str,
        mutation: Mutation,
        priority: i64,
    ) -> Result<String> {
        let kind = match &mutation {
            Mutation::AddFieldNote { .. } => OperationKind::AddFieldNote,
            Mutation::SetField { .. } => OperationKind::UpdateProperty,
            Mutation::AddPhoto { .. } => OperationKind::AddPhoto,
            Mutation::SetPhotoCaption { .. } => OperationKind::SetPhotoCaption,
        };

        let delta = {
            let mut store = self.inner.store.write().await;
            let doc = store.document(entity_id).await?;
            let delta = doc.apply_local(mutation)?;
            store.persist_document(entity_id).await?;
            delta
        };

        let operation_id = {
            let mut oplog = self.inner.oplog.lock().await;
            oplog
                .enqueue(entity_id, kind, delta.encode(), priority)
                .await?
        };

        self.inner.events.emit(SyncEvent::DocumentUpdated {
            entity_id: entity_id.to_string(),
            timestamp: now_ms(),
        });

        Ok(operation_id)
    }

    /// A consistent point-in-time copy of an entity's document for
    /// display. Safe to call during an in-progress sync.
    pub async fn document(&self, entity_id: &str) -> Result<InspectionDocument> {
        let mut store = self.inner.store.write().await;
        Ok(store.snapshot(entity_id).await?)
    }

    pub async fn pending_operations(&self, entity_id: &str) -> usize {
        self.inner.oplog.lock().await.pending_count(entity_id)
    }

    // ==================== Sync state machine ====================

    /// Run a sync pass for one entity now. If a run is already in
    /// progress the call coalesces into it (the in-flight run goes
    /// again) and returns immediately.
    pub async fn sync_now(&self, entity_id: &str) -> Result<()> {
        let cell = self.cell(entity_id);
        let Ok(_guard) = cell.sync_lock.try_lock() else {
            cell.rerun.store(true, Ordering::Relaxed);
            debug!("Sync already running for {}; coalesced", entity_id);
            return Ok(());
        };

        loop {
            self.run_once(entity_id, &cell).await?;
            if !cell.rerun.swap(false, Ordering::Relaxed) {
                break;
            }
        }
        Ok(())
    }

    async fn run_once(&self, entity_id: &str, cell: &Arc<EntityCell>) -> Result<()> {
        if !*self.inner.connected.borrow() {
            debug!("Offline: not syncing {}", entity_id);
            return Ok(());
        }

        self.set_state(entity_id, cell, SyncState::Syncing);

        let mut offline = self.inner.connected.subscribe();
        let result = tokio::select! {
            res = tokio::time::timeout(self.inner.config.sync_timeout, self.sync_pass(entity_id)) => {
                match res {
                    Ok(inner) => inner,
                    Err(_) => Err(SyncError::Transport(TransportError::Timeout(format!(
                        "sync run exceeded {:?}",
                        self.inner.config.sync_timeout
                    )))),
                }
            }
            _ = async { let _ = offline.wait_for(|connected| !*connected).await; } => {
                Err(SyncError::Transport(TransportError::Offline))
            }
        };

        match result {
            Ok(()) => {
                cell.backoff
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .reset();
                self.set_state(entity_id, cell, SyncState::Success);
                self.set_state(entity_id, cell, SyncState::Idle);

                // Operations still waiting out a per-operation backoff
                // get a timer-elapsed run once the earliest is eligible
                let next = {
                    let oplog = self.inner.oplog.lock().await;
                    oplog.next_eligible_ms(entity_id)
                };
                if let Some(at) = next {
                    let delay = Duration::from_millis(at.saturating_sub(now_ms()));
                    debug!("Scheduling follow-up sync for {} in {:?}", entity_id, delay);
                    self.spawn_delayed_sync(entity_id.to_string(), delay, "Follow-up");
                }
                Ok(())
            }
            Err(SyncError::Transport(TransportError::Offline)) => {
                // Aborted, not failed: everything unacknowledged is
                // retried on reconnect, so this is a clean stop.
                info!("Sync for {} aborted: went offline", entity_id);
                self.set_state(entity_id, cell, SyncState::Idle);
                Ok(())
            }
            Err(err) => {
                warn!("Sync for {} failed: {}", entity_id, err);
                self.set_state(entity_id, cell, SyncState::Error);

                let delay = cell
                    .backoff
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_failure(&self.inner.config.backoff);
                debug!("Retrying {} in {:?}", entity_id, delay);
                self.spawn_delayed_sync(entity_id.to_string(), delay, "Retry");
                Err(err)
            }
        }
    }

    async fn sync_pass(&self, entity_id: &str) -> Result<()> {
        // Recover anything a cancelled earlier run left in flight
        {
            let mut oplog = self.inner.oplog.lock().await;
            let released = oplog.release_in_flight(entity_id).await?;
            if released > 0 {
                debug!(
                    "Released {} abandoned in-flight operations for {}",
                    released, entity_id
                );
            }
        }

        self.pull_phase(entity_id).await?;
        self.push_phase(entity_id).await?;
        Ok(())
    }

    /// Pull remote deltas since the last cursor and merge them.
    async fn pull_phase(&self, entity_id: &str) -> Result<()> {
        let since = {
            let store = self.inner.store.read().await;
            store.cursor(entity_id)
        };

        let pulled = self.inner.transport.pull_deltas(entity_id, since).await?;
        if pulled.deltas.is_empty() && pulled.cursor == since {
            return Ok(());
        }
        debug!(
            "Pulled {} deltas for {} (cursor {} -> {})",
            pulled.deltas.len(),
            entity_id,
            since,
            pulled.cursor
        );

        let mut store = self.inner.store.write().await;
        let mut modified = false;
        {
            let doc = store.document(entity_id).await?;
            for delta in &pulled.deltas {
                match doc.apply_remote(delta) {
                    Ok(changed) => modified |= changed,
                    // A corrupt delta is rejected whole; its siblings
                    // still apply
                    Err(err) => {
                        warn!("Rejected corrupt delta for {}: {}", entity_id, err);
                    }
                }
            }
        }
        if modified {
            store.persist_document(entity_id).await?;
        }
        store.set_cursor(entity_id, pulled.cursor).await?;
        drop(store);

        if modified {
            self.inner.events.emit(SyncEvent::DocumentUpdated {
                entity_id: entity_id.to_string(),
                timestamp: now_ms(),
            });
        }
        Ok(())
    }

    /// Drain the Operation Log and transmit each operation's delta, in
    /// the log's total order.
    async fn push_phase(&self, entity_id: &str) -> Result<()> {
        loop {
            let batch = {
                let mut oplog = self.inner.oplog.lock().await;
                oplog
                    .drain(entity_id, self.inner.config.batch_size, now_ms())
                    .await?
            };
            if batch.is_empty() {
                return Ok(());
            }

            for op in batch {
                match self.inner.transport.push_delta(entity_id, &op.payload).await {
                    Ok(()) => {
                        let mut oplog = self.inner.oplog.lock().await;
                        oplog.mark_acknowledged(&op.id).await?;
                        drop(oplog);
                        self.inner.events.emit(SyncEvent::OperationAcknowledged {
                            entity_id: entity_id.to_string(),
                            operation_id: op.id.clone(),
                            timestamp: now_ms(),
                        });
                    }
                    Err(err) => {
                        let outcome = {
                            let mut oplog = self.inner.oplog.lock().await;
                            oplog
                                .mark_failed(&op.id, &err.to_string(), now_ms())
                                .await?
                        };
                        if outcome == FailureOutcome::DeadLettered {
                            self.inner.events.emit(SyncEvent::OperationDeadLettered {
                                entity_id: entity_id.to_string(),
                                operation_id: op.id.clone(),
                                timestamp: now_ms(),
                            });
                        }
                        // Later operations stay in flight; the next run
                        // releases them
                        return Err(err.into());
                    }
                }
            }
        }
    }

    // ==================== Dead letters ====================

    pub async fn dead_letters(&self, entity_id: &str) -> Vec<Operation> {
        let oplog = self.inner.oplog.lock().await;
        oplog
            .dead_letters(entity_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn acknowledge_dead_letter(&self, operation_id: &str) -> Result<()> {
        let mut oplog = self.inner.oplog.lock().await;
        oplog.acknowledge_dead_letter(operation_id).await?;
        Ok(())
    }

    pub async fn discard_dead_letter(&self, operation_id: &str) -> Result<()> {
        let mut oplog = self.inner.oplog.lock().await;
        oplog.discard_dead_letter(operation_id).await?;
        Ok(())
    }

    // ==================== Presence ====================

    fn emit_presence(&self, document_id: &str) {
        self.inner.events.emit(SyncEvent::PresenceChanged {
            document_id: document_id.to_string(),
            timestamp: now_ms(),
        });
    }

    /// Publish a heartbeat and fold the server's roster into the local
    /// tracker. Advisory: failures are logged, never surfaced.
    async fn publish_presence(&self, document_id: &str, record: &PresenceRecord) {
        if !*self.inner.connected.borrow() {
            return;
        }
        match self.inner.transport.heartbeat(document_id, record).await {
            Ok(roster) => {
                self.inner
                    .presence
                    .replace_roster(document_id, roster, now_ms());
                self.emit_presence(document_id);
            }
            Err(err) => {
                debug!("Presence heartbeat for {} failed: {}", document_id, err);
            }
        }
    }

    /// Register a user on a document and announce them to the server.
    /// Returns the currently active users.
    pub async fn join_document(
        &self,
        document_id: &str,
        user_id: &str,
        display_name: &str,
        color: &str,
    ) -> Vec<PresenceRecord> {
        let record =
            self.inner
                .presence
                .join(document_id, user_id, display_name, color, now_ms());
        self.emit_presence(document_id);
        self.publish_presence(document_id, &record).await;
        self.active_users(document_id)
    }

    /// Refresh a user's liveness (call on the configured heartbeat
    /// interval while the document is open). Returns false if the
    /// record expired - the caller should re-join.
    pub async fn heartbeat(&self, document_id: &str, user_id: &str) -> bool {
        let refreshed = self.inner.presence.heartbeat(document_id, user_id, now_ms());
        if refreshed {
            let record = self
                .inner
                .presence
                .active_users(document_id, now_ms())
                .into_iter()
                .find(|r| r.user_id == user_id);
            if let Some(record) = record {
                self.publish_presence(document_id, &record).await;
            }
        }

        for (document_id, record) in self.inner.presence.prune(now_ms()) {
            debug!(
                "Presence expired for {} on {}",
                record.user_id, document_id
            );
            self.emit_presence(&document_id);
        }
        refreshed
    }

    /// Everyone currently active on a document. Purely informational;
    /// never gates mutation.
    pub fn active_users(&self, document_id: &str) -> Vec<PresenceRecord> {
        self.inner.presence.active_users(document_id, now_ms())
    }

    pub fn leave_document(&self, document_id: &str, user_id: &str) {
        self.inner.presence.leave(document_id, user_id);
        self.emit_presence(document_id);
    }

    /// Spawn a background heartbeat loop for an open document. Abort
    /// the handle (or let the record expire) when the document closes.
    pub fn spawn_presence_loop(&self, document_id: &str, user_id: &str) -> JoinHandle<()> {
        let this = self.clone();
        let document_id = document_id.to_string();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let interval = this.inner.config.presence.heartbeat_interval;
            loop {
                tokio::time::sleep(interval).await;
                if !this.heartbeat(&document_id, &user_id).await {
                    break;
                }
            }
        })
    }

    // ==================== Photo assets ====================

    /// Capture a photo: store its bytes durably, register the asset as
    /// pending, and queue the document mutation. Completes without
    /// network access; the upload happens in `sync_report`.
    pub async fn add_photo(
        &self,
        entity_id: &str,
        mutation_priority: i64,
        kind: PhotoKind,
        captured_at_ms: u64,
        location: Option<GeoPoint>,
        bytes: &[u8],
    ) -> Result<String> {
        let asset_id = self.inner.photos.store_local(entity_id, bytes).await?;
        self.mutate(
            entity_id,
            Mutation::AddPhoto {
                asset_id: asset_id.clone(),
                kind,
                captured_at_ms,
                location,
            },
            mutation_priority,
        )
        .await?;
        Ok(asset_id)
    }

    /// Upload every pending or errored asset for an entity. Runs
    /// outside the entity's document sync lock, so large payloads never
    /// block field synchronization.
    pub async fn sync_report(&self, entity_id: &str) -> Result<ReportSummary> {
        if !*self.inner.connected.borrow() {
            return Err(TransportError::Offline.into());
        }
        Ok(self.inner.photos.sync_report(entity_id).await?)
    }

    /// Merge the server's asset list for an entity into local state.
    pub async fn initialize_assets(&self, entity_id: &str) -> Result<usize> {
        Ok(self.inner.photos.initialize_from_server(entity_id).await?)
    }

    pub fn asset_state(&self, asset_id: &str) -> Option<AssetRecord> {
        self.inner.assets.state(asset_id)
    }

    pub fn assets_for_entity(&self, entity_id: &str) -> Vec<AssetRecord> {
        self.inner.assets.for_entity(entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fieldsync_core::delta::{DeltaOp, DocumentDelta};
    use fieldsync_core::document::FieldValue;
    use fieldsync_core::storage::InMemoryStorage;
    use fieldsync_core::transport::{PulledDeltas, RemoteAsset};
    use std::sync::Mutex as SyncMutex;

    #[derive(Default)]
    struct ServerState {
        deltas: HashMap<String, Vec<Vec<u8>>>,
        assets: HashMap<String, Vec<u8>>,
        roster: Vec<PresenceRecord>,
        pulls: usize,
        pushes: usize,
        fail_next_pushes: usize,
        hang_pulls: bool,
    }

    /// Scriptable in-memory server.
    #[derive(Default)]
    struct MockTransport {
        state: SyncMutex<ServerState>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn seed_delta(&self, entity_id: &str, delta: Vec<u8>) {
            let mut state = self.state.lock().unwrap();
            state.deltas.entry(entity_id.to_string()).or_default().push(delta);
        }

        fn fail_next_pushes(&self, count: usize) {
            self.state.lock().unwrap().fail_next_pushes = count;
        }

        fn hang_pulls(&self) {
            self.state.lock().unwrap().hang_pulls = true;
        }

        fn counters(&self) -> (usize, usize) {
            let state = self.state.lock().unwrap();
            (state.pulls, state.pushes)
        }

        fn received_deltas(&self, entity_id: &str) -> Vec<Vec<u8>> {
            let state = self.state.lock().unwrap();
            state.deltas.get(entity_id).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl SyncTransport for MockTransport {
        async fn pull_deltas(
            &self,
            entity_id: &str,
            since_cursor: u64,
        ) -> fieldsync_core::transport::Result<PulledDeltas> {
            let hang = {
                let mut state = self.state.lock().unwrap();
                state.pulls += 1;
                state.hang_pulls
            };
            if hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let state = self.state.lock().unwrap();
            let all = state.deltas.get(entity_id).cloned().unwrap_or_default();
            let from = (since_cursor as usize).min(all.len());
            Ok(PulledDeltas {
                deltas: all[from..].to_vec(),
                cursor: all.len() as u64,
            })
        }

        async fn push_delta(
            &self,
            entity_id: &str,
            delta: &[u8],
        ) -> fieldsync_core::transport::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.pushes += 1;
            if state.fail_next_pushes > 0 {
                state.fail_next_pushes -= 1;
                return Err(TransportError::ConnectionFailed("injected failure".into()));
            }
            state
                .deltas
                .entry(entity_id.to_string())
                .or_default()
                .push(delta.to_vec());
            Ok(())
        }

        async fn heartbeat(
            &self,
            _document_id: &str,
            record: &PresenceRecord,
        ) -> fieldsync_core::transport::Result<Vec<PresenceRecord>> {
            let mut state = self.state.lock().unwrap();
            state.roster.retain(|r| r.user_id != record.user_id);
            state.roster.push(record.clone());
            Ok(state.roster.clone())
        }

        async fn upload_asset(
            &self,
            asset_id: &str,
            bytes: &[u8],
        ) -> fieldsync_core::transport::Result<String> {
            let mut state = self.state.lock().unwrap();
            state.assets.insert(asset_id.to_string(), bytes.to_vec());
            Ok(format!("https://cdn.example/{asset_id}"))
        }

        async fn fetch_assets(
            &self,
            _entity_id: &str,
        ) -> fieldsync_core::transport::Result<Vec<RemoteAsset>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .assets
                .keys()
                .map(|asset_id| RemoteAsset {
                    asset_id: asset_id.clone(),
                    remote_url: format!("https://cdn.example/{asset_id}"),
                })
                .collect())
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            batch_size: 10,
            sync_timeout: Duration::from_secs(5),
            oplog: OplogConfig {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
            presence: PresenceConfig::default(),
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                backoff_factor: 2.0,
                jitter: false,
            },
        }
    }

    async fn open_orchestrator(
        server: Arc<MockTransport>,
        config: SyncConfig,
    ) -> SyncOrchestrator<Arc<MockTransport>, Arc<InMemoryStorage>> {
        SyncOrchestrator::open(server, Arc::new(InMemoryStorage::new()), config)
            .await
            .unwrap()
    }

    fn set_field(key: &str, value: i64) -> Mutation {
        Mutation::SetField {
            key: key.to_string(),
            value: FieldValue::Integer(value),
        }
    }

    fn field_key(delta_bytes: &[u8]) -> String {
        let delta = DocumentDelta::decode(delta_bytes).unwrap();
        match &delta.ops[0] {
            DeltaOp::FieldSet { key, .. } => key.clone(),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    async fn wait_for_drained(
        orch: &SyncOrchestrator<Arc<MockTransport>, Arc<InMemoryStorage>>,
        entity_id: &str,
    ) {
        for _ in 0..500 {
            // Queue empty and the run that drained it fully finished
            if orch.pending_operations(entity_id).await == 0
                && orch.sync_status(entity_id) == SyncState::Idle
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("operations for {entity_id} never drained");
    }

    // ==================== Offline-first guarantees ====================

    #[tokio::test]
    async fn test_mutate_offline_never_touches_the_transport() {
        let server = MockTransport::new();
        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;

        // Transport forcibly disabled: connectivity never restored
        orch.mutate("prop-1", set_field("bedrooms", 3), 1)
            .await
            .unwrap();
        orch.mutate(
            "prop-1",
            Mutation::AddFieldNote {
                author_id: "u-1".into(),
                author_name: "Dana".into(),
                timestamp_ms: 100,
                text: "leak in roof".into(),
            },
            2,
        )
        .await
        .unwrap();

        // Optimistically applied and queued
        let doc = orch.document("prop-1").await.unwrap();
        assert_eq!(doc.field("bedrooms"), Some(&FieldValue::Integer(3)));
        assert_eq!(doc.note_count(), 1);
        assert_eq!(orch.pending_operations("prop-1").await, 2);

        let (pulls, pushes) = server.counters();
        assert_eq!((pulls, pushes), (0, 0));
    }

    #[tokio::test]
    async fn test_sync_now_while_offline_is_a_quiet_no_op() {
        let server = MockTransport::new();
        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;

        orch.mutate("prop-1", set_field("bedrooms", 3), 1)
            .await
            .unwrap();
        orch.sync_now("prop-1").await.unwrap();

        assert_eq!(orch.sync_status("prop-1"), SyncState::Idle);
        assert_eq!(orch.pending_operations("prop-1").await, 1);
        assert_eq!(server.counters(), (0, 0));
    }

    // ==================== Push path ====================

    #[tokio::test]
    async fn test_reconnect_drains_in_priority_order() {
        let server = MockTransport::new();
        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;

        // Enqueued with priorities [1, 3, 2]
        orch.mutate("prop-1", set_field("year_built", 1987), 1)
            .await
            .unwrap();
        orch.mutate("prop-1", set_field("condition", 4), 3)
            .await
            .unwrap();
        orch.mutate("prop-1", set_field("bedrooms", 3), 2)
            .await
            .unwrap();

        // connectivityRestored triggers the sync automatically
        orch.set_connected(true).await;
        wait_for_drained(&orch, "prop-1").await;

        let keys: Vec<String> = server
            .received_deltas("prop-1")
            .iter()
            .map(|d| field_key(d))
            .collect();
        assert_eq!(keys, vec!["condition", "bedrooms", "year_built"]);
    }

    #[tokio::test]
    async fn test_push_failure_sets_error_then_background_retry_recovers() {
        let server = MockTransport::new();
        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;
        orch.set_connected(true).await;

        orch.mutate("prop-1", set_field("bedrooms", 3), 1)
            .await
            .unwrap();
        server.fail_next_pushes(1);

        let err = orch.sync_now("prop-1").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert_eq!(orch.sync_status("prop-1"), SyncState::Error);
        // Failed, not lost: requeued with backoff
        assert_eq!(orch.pending_operations("prop-1").await, 1);

        // The scheduled retry (millisecond backoff in tests) succeeds
        wait_for_drained(&orch, "prop-1").await;
        assert!(orch.dead_letters("prop-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_and_stop() {
        let server = MockTransport::new();
        let mut config = test_config();
        config.oplog.max_retries = 0;
        let orch = open_orchestrator(Arc::clone(&server), config).await;
        orch.set_connected(true).await;

        orch.mutate("prop-1", set_field("bedrooms", 3), 1)
            .await
            .unwrap();
        server.fail_next_pushes(10);

        let _ = orch.sync_now("prop-1").await.unwrap_err();

        let dead = orch.dead_letters("prop-1").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(orch.pending_operations("prop-1").await, 0);

        // Reported, not retried: another sync pushes nothing
        let (_, pushes_before) = server.counters();
        orch.sync_now("prop-1").await.unwrap();
        let (_, pushes_after) = server.counters();
        assert_eq!(pushes_before, pushes_after);

        orch.acknowledge_dead_letter(&dead[0].id).await.unwrap();
        assert!(orch.dead_letters("prop-1").await.is_empty());
    }

    // ==================== Pull path ====================

    #[tokio::test]
    async fn test_pull_applies_remote_deltas_and_advances_cursor() {
        let server = MockTransport::new();
        let mut remote = InspectionDocument::new("prop-1", ReplicaId::from(42));
        server.seed_delta(
            "prop-1",
            remote.apply_local(set_field("bedrooms", 4)).unwrap().encode(),
        );

        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;
        orch.set_connected(true).await;
        orch.sync_now("prop-1").await.unwrap();

        let doc = orch.document("prop-1").await.unwrap();
        assert_eq!(doc.field("bedrooms"), Some(&FieldValue::Integer(4)));

        // Cursor advanced: a second sync re-applies nothing
        orch.sync_now("prop-1").await.unwrap();
        let doc = orch.document("prop-1").await.unwrap();
        assert_eq!(doc.field("bedrooms"), Some(&FieldValue::Integer(4)));
    }

    #[tokio::test]
    async fn test_corrupt_delta_skipped_without_affecting_siblings() {
        let server = MockTransport::new();
        let mut remote = InspectionDocument::new("prop-1", ReplicaId::from(42));
        server.seed_delta(
            "prop-1",
            remote.apply_local(set_field("bedrooms", 4)).unwrap().encode(),
        );
        server.seed_delta("prop-1", vec![0xFF, 0xFE, 0xFD, 0xFC]);
        server.seed_delta(
            "prop-1",
            remote.apply_local(set_field("bathrooms", 2)).unwrap().encode(),
        );

        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;
        orch.set_connected(true).await;
        orch.sync_now("prop-1").await.unwrap();

        assert_eq!(orch.sync_status("prop-1"), SyncState::Idle);
        let doc = orch.document("prop-1").await.unwrap();
        assert_eq!(doc.field("bedrooms"), Some(&FieldValue::Integer(4)));
        assert_eq!(doc.field("bathrooms"), Some(&FieldValue::Integer(2)));
    }

    // ==================== Bounded runs and cancellation ====================

    #[tokio::test(start_paused = true)]
    async fn test_hung_transport_times_out_as_an_error() {
        let server = MockTransport::new();
        server.hang_pulls();
        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;
        orch.set_connected(true).await;

        let err = orch.sync_now("prop-1").await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Transport(TransportError::Timeout(_))
        ));
        assert_eq!(orch.sync_status("prop-1"), SyncState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_going_offline_aborts_the_run_cleanly() {
        let server = MockTransport::new();
        server.hang_pulls();
        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;
        // Connect before queueing work so no background sync races this
        // test's explicit run
        orch.set_connected(true).await;
        orch.mutate("prop-1", set_field("bedrooms", 3), 1)
            .await
            .unwrap();

        let runner = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.sync_now("prop-1").await })
        };
        // Let the run reach the hung pull, then cut connectivity
        tokio::time::sleep(Duration::from_millis(5)).await;
        orch.set_connected(false).await;

        // Aborting is a clean stop, not a failure
        runner.await.unwrap().unwrap();
        assert_eq!(orch.sync_status("prop-1"), SyncState::Idle);
        // Nothing lost: the operation is still queued for reconnect
        assert_eq!(orch.pending_operations("prop-1").await, 1);
    }

    // ==================== Coalescing ====================

    #[tokio::test(start_paused = true)]
    async fn test_sync_now_during_a_run_coalesces() {
        let server = MockTransport::new();
        server.hang_pulls();
        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;
        orch.set_connected(true).await;

        let runner = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.sync_now("prop-1").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Second call returns immediately instead of starting a
        // concurrent run for the same entity
        orch.sync_now("prop-1").await.unwrap();
        assert_eq!(orch.sync_status("prop-1"), SyncState::Syncing);

        orch.set_connected(false).await;
        runner.await.unwrap().unwrap();
    }

    // ==================== Presence ====================

    #[tokio::test]
    async fn test_join_publishes_and_merges_server_roster() {
        let server = MockTransport::new();
        {
            // Another appraiser is already on the document
            let mut state = server.state.lock().unwrap();
            state.roster.push(PresenceRecord {
                user_id: "u-2".into(),
                display_name: "Sam".into(),
                color: "#3d405b".into(),
                status: fieldsync_core::presence::PresenceStatus::Online,
                last_heartbeat_ms: 0,
            });
        }

        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;
        orch.set_connected(true).await;

        let active = orch
            .join_document("prop-1", "u-1", "Dana", "#e07a5f")
            .await;
        let ids: Vec<&str> = active.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["u-1", "u-2"]);
    }

    #[tokio::test]
    async fn test_presence_never_blocks_mutation() {
        let server = MockTransport::new();
        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;

        // Offline join: local record only, heartbeat skipped
        let active = orch
            .join_document("prop-1", "u-1", "Dana", "#e07a5f")
            .await;
        assert_eq!(active.len(), 1);

        // Mutation proceeds regardless of who else is on the document
        orch.mutate("prop-1", set_field("bedrooms", 3), 1)
            .await
            .unwrap();
        assert_eq!(orch.pending_operations("prop-1").await, 1);
    }

    // ==================== Photo assets ====================

    #[tokio::test]
    async fn test_add_photo_registers_pending_and_queues_mutation() {
        let server = MockTransport::new();
        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;

        let asset_id = orch
            .add_photo(
                "prop-1",
                1,
                PhotoKind::Exterior,
                1_000,
                None,
                b"jpeg bytes",
            )
            .await
            .unwrap();

        let state = orch.asset_state(&asset_id).unwrap();
        assert_eq!(
            state.status,
            fieldsync_core::assets::AssetStatus::Pending
        );
        // Document references the asset; the operation is queued
        let doc = orch.document("prop-1").await.unwrap();
        assert_eq!(doc.photos().next().unwrap().asset_id, asset_id);
        assert_eq!(orch.pending_operations("prop-1").await, 1);
        assert_eq!(server.counters(), (0, 0));
    }

    #[tokio::test]
    async fn test_sync_report_offline_is_an_error() {
        let server = MockTransport::new();
        let orch = open_orchestrator(Arc::clone(&server), test_config()).await;
        let err = orch.sync_report("prop-1").await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Transport(TransportError::Offline)
        ));
    }
}
