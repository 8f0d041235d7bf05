//! SyncTransport trait for talking to the backend.
//!
//! The wire protocol and codec are backend-defined; this trait pins down
//! only the operations the sync core needs. Implementations:
//! - HTTP/WebSocket clients in the host application
//! - In-memory scriptable servers in tests
//!
//! The orchestrator is the only caller. UI mutation paths never touch
//! this trait - that is the offline-first guarantee.

use crate::presence::PresenceRecord;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Connectivity is down (or the transport was disabled).
    #[error("Offline")]
    Offline,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The server refused the payload (retrying the same bytes will not
    /// help).
    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Deltas pulled from the server plus the new cursor to resume from.
#[derive(Debug, Clone)]
pub struct PulledDeltas {
    /// Encoded `DocumentDelta` payloads, in server order.
    pub deltas: Vec<Vec<u8>>,
    /// Server-assigned position to pass as `since_cursor` next time.
    pub cursor: u64,
}

/// An asset the server knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAsset {
    pub asset_id: String,
    pub remote_url: String,
}

/// Network operations the sync core depends on.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Pull deltas for an entity since a cursor. Idempotent: pulling
    /// from the same cursor twice returns the same deltas.
    async fn pull_deltas(&self, entity_id: &str, since_cursor: u64) -> Result<PulledDeltas>;

    /// Push one encoded delta. Acknowledgment is idempotent at the
    /// delta level - resending an already-received delta is a no-op on
    /// the server.
    async fn push_delta(&self, entity_id: &str, delta: &[u8]) -> Result<()>;

    /// Publish a presence heartbeat and receive the server's current
    /// roster for the document.
    async fn heartbeat(
        &self,
        document_id: &str,
        record: &PresenceRecord,
    ) -> Result<Vec<PresenceRecord>>;

    /// Upload an asset's bytes, keyed by asset id so retries cannot
    /// create duplicates. Returns the remote URL.
    async fn upload_asset(&self, asset_id: &str, bytes: &[u8]) -> Result<String>;

    /// List the assets the server holds for an entity.
    async fn fetch_assets(&self, entity_id: &str) -> Result<Vec<RemoteAsset>>;
}

// Implement SyncTransport for Arc<T> where T: SyncTransport
// This allows tests to keep a handle on an in-memory server while the
// orchestrator owns a clone
#[async_trait]
impl<T: SyncTransport> SyncTransport for std::sync::Arc<T> {
    async fn pull_deltas(&self, entity_id: &str, since_cursor: u64) -> Result<PulledDeltas> {
        (**self).pull_deltas(entity_id, since_cursor).await
    }

    async fn push_delta(&self, entity_id: &str, delta: &[u8]) -> Result<()> {
        (**self).push_delta(entity_id, delta).await
    }

    async fn heartbeat(
        &self,
        document_id: &str,
        record: &PresenceRecord,
    ) -> Result<Vec<PresenceRecord>> {
        (**self).heartbeat(document_id, record).await
    }

    async fn upload_asset(&self, asset_id: &str, bytes: &[u8]) -> Result<String> {
        (**self).upload_asset(asset_id, bytes).await
    }

    async fn fetch_assets(&self, entity_id: &str) -> Result<Vec<RemoteAsset>> {
        (**self).fetch_assets(entity_id).await
    }
}
