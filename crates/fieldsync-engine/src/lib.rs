//! fieldsync-engine: Tokio orchestration layer over fieldsync-core.
//!
//! Provides the per-process sync service the host application embeds:
//! - `SyncOrchestrator` - per-entity sync state machine, connectivity
//!   handling, presence heartbeats, and the local mutation entry point
//! - `PhotoSynchronizer` - upload pipeline for photo binaries
//! - `EntityStore` - durable per-entity snapshots and cursors
//! - `NativeStorage` - the tokio::fs storage backend

pub mod backoff;
pub mod native_storage;
pub mod orchestrator;
pub mod photos;
pub mod store;

pub use backoff::{calculate_backoff, BackoffConfig, BackoffState};
pub use native_storage::NativeStorage;
pub use orchestrator::{SyncConfig, SyncError, SyncOrchestrator};
pub use photos::{PhotoError, PhotoSynchronizer, ReportSummary};
pub use store::{EntityStore, StoreError};
