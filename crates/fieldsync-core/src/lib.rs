//! fieldsync-core: Offline-first synchronization core for field
//! inspection data.
//!
//! This crate provides the platform-agnostic pieces:
//! - Per-entity replicated documents (CRDT) for notes, structured
//!   fields, and photo references
//! - The versioned binary delta format
//! - The durable, prioritized Operation Log
//! - The ephemeral Presence Tracker
//! - The asset sync-state registry
//! - Storage and SyncTransport trait abstractions and the event bus
//!
//! The tokio orchestration layer lives in `fieldsync-engine`.

pub mod assets;
pub mod clock;
pub mod delta;
pub mod document;
pub mod events;
pub mod oplog;
pub mod presence;
pub mod replica;
pub mod storage;
pub mod time;
pub mod transport;

pub use assets::{AssetRecord, AssetRegistry, AssetStatus};
pub use clock::{LamportClock, Stamp};
pub use delta::{DeltaError, DeltaOp, DocumentDelta};
pub use document::{
    CausalId, DocumentError, FieldNote, FieldValue, GeoPoint, InspectionDocument, Mutation,
    PhotoKind, PhotoRef,
};
pub use events::{EventBus, Subscription, SyncEvent, SyncState};
pub use oplog::{Operation, OperationKind, OperationLog, OperationStatus, OplogConfig};
pub use presence::{PresenceConfig, PresenceRecord, PresenceStatus, PresenceTracker};
pub use replica::{ReplicaId, ReplicaIdError};
pub use storage::{InMemoryStorage, Storage, StorageError};
pub use transport::{PulledDeltas, RemoteAsset, SyncTransport, TransportError};
