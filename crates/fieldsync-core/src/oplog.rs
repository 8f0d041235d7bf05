//! Operation Log: append-only record of user-initiated mutations
//! awaiting transmission.
//!
//! Every local mutation is recorded here durably before `enqueue`
//! returns, so nothing a user does offline is ever lost to a crash.
//! Draining yields operations in `(priority desc, sequence asc)` order,
//! a stable total order. Failed operations are re-enqueued with
//! exponential backoff; after the retry budget is exhausted they move to
//! a dead-letter state and are reported, never silently dropped.
//!
//! Durable layout: one JSON journal per entity (`oplog/<entity>.json`),
//! rewritten on mutation and replayed on open. Operations found
//! in-flight at open are reset to pending - a crash mid-transmission
//! just means the delta is resent, which is safe because delta
//! application is idempotent on the receiving side.

use crate::storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OplogError {
    /// Local durability exhausted. Fatal to the triggering enqueue;
    /// surfaced to the caller immediately.
    #[error("Local storage full")]
    StorageFull,

    #[error(transparent)]
    Storage(StorageError),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Journal corrupt for entity {entity_id}: {detail}")]
    CorruptJournal { entity_id: String, detail: String },
}

impl From<StorageError> for OplogError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Full => OplogError::StorageFull,
            other => OplogError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, OplogError>;

/// Kind of queued intent, mirroring the mutation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    AddFieldNote,
    UpdateProperty,
    AddPhoto,
    SetPhotoCaption,
}

/// Lifecycle state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    /// Waiting to be drained (possibly held back by backoff)
    Pending,
    /// Drained and handed to the transport
    InFlight,
    /// Retry budget exhausted; requires explicit acknowledgment or
    /// discard
    DeadLettered,
}

/// A single queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub entity_id: String,
    pub kind: OperationKind,
    /// Encoded `DocumentDelta` to transmit.
    pub payload: Vec<u8>,
    /// Higher drains first.
    pub priority: i64,
    /// Monotonically increasing; the FIFO tie-break within a priority.
    pub sequence: u64,
    pub status: OperationStatus,
    pub retries: u32,
    /// Earliest time (ms since epoch) the operation may be drained
    /// again after a failure.
    pub not_before_ms: u64,
    pub last_error: Option<String>,
}

/// Outcome of `mark_failed`, so callers can report dead-letters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Re-enqueued; eligible again at the contained time (ms since
    /// epoch).
    Requeued { not_before_ms: u64 },
    /// Retry budget exhausted; moved to the dead-letter state.
    DeadLettered,
}

/// Retry policy for failed operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogConfig {
    /// Failures allowed before an operation dead-letters.
    pub max_retries: u32,
    /// Base backoff delay; actual delay is `base * 2^retries`, capped.
    pub base_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Durable, prioritized log of operations for all entities.
pub struct OperationLog<S: Storage> {
    storage: S,
    config: OplogConfig,
    /// Non-acknowledged operations per entity (pending, in-flight, and
    /// dead-lettered). Acknowledged operations leave the log entirely.
    entries: HashMap<String, Vec<Operation>>,
    next_sequence: u64,
}

impl<S: Storage> OperationLog<S> {
    /// Open the log, replaying every entity journal found in storage.
    pub async fn open(storage: S, config: OplogConfig) -> Result<Self> {
        let mut entries: HashMap<String, Vec<Operation>> = HashMap::new();
        let mut next_sequence = 1;

        for key in storage.list("oplog").await? {
            let bytes = storage.read(&key).await?;
            let entity_id = key
                .trim_start_matches("oplog/")
                .trim_end_matches(".json")
                .to_string();
            let mut ops: Vec<Operation> =
                serde_json::from_slice(&bytes).map_err(|e| OplogError::CorruptJournal {
                    entity_id: entity_id.clone(),
                    detail: e.to_string(),
                })?;

            for op in &mut ops {
                if op.sequence >= next_sequence {
                    next_sequence = op.sequence + 1;
                }
                // A crash mid-transmission leaves operations in-flight;
                // resend is safe, so put them back in the queue.
                if op.status == OperationStatus::InFlight {
                    op.status = OperationStatus::Pending;
                }
            }

            debug!("Replayed {} operations for entity {}", ops.len(), entity_id);
            entries.insert(entity_id, ops);
        }

        Ok(Self {
            storage,
            config,
            entries,
            next_sequence,
        })
    }

    fn journal_key(entity_id: &str) -> String {
        format!("oplog/{entity_id}.json")
    }

    /// Rewrite one entity's journal from the in-memory state.
    async fn persist(&self, entity_id: &str) -> Result<()> {
        let key = Self::journal_key(entity_id);
        match self.entries.get(entity_id) {
            Some(ops) if !ops.is_empty() => {
                let bytes = serde_json::to_vec(ops)
                    .expect("operation serialization should not fail");
                self.storage.write(&key, &bytes).await?;
            }
            _ => {
                // Empty journal - remove the file rather than leave a stub
                if self.storage.exists(&key).await? {
                    self.storage.delete(&key).await?;
                }
            }
        }
        Ok(())
    }

    /// Record a new operation. Durable before return; never waits on
    /// the network. The only failure mode is local storage.
    pub async fn enqueue(
        &mut self,
        entity_id: &str,
        kind: OperationKind,
        payload: Vec<u8>,
        priority: i64,
    ) -> Result<String> {
        let op = Operation {
            id: Uuid::new_v4().to_string(),
            entity_id: entity_id.to_string(),
            kind,
            payload,
            priority,
            sequence: self.next_sequence,
            status: OperationStatus::Pending,
            retries: 0,
            not_before_ms: 0,
            last_error: None,
        };
        let id = op.id.clone();

        let ops = self.entries.entry(entity_id.to_string()).or_default();
        ops.push(op);

        if let Err(err) = self.persist(entity_id).await {
            // Durability failed - the enqueue did not happen
            let ops = self.entries.get_mut(entity_id).expect("entry just inserted");
            ops.pop();
            return Err(err);
        }

        self.next_sequence += 1;
        Ok(id)
    }

    /// Drain up to `max_batch` operations for an entity, in
    /// `(priority desc, sequence asc)` order, skipping operations whose
    /// backoff delay has not yet elapsed. Drained operations move to
    /// in-flight.
    pub async fn drain(
        &mut self,
        entity_id: &str,
        max_batch: usize,
        now_ms: u64,
    ) -> Result<Vec<Operation>> {
        let Some(ops) = self.entries.get_mut(entity_id) else {
            return Ok(Vec::new());
        };

        let mut eligible: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter(|(_, op)| {
                op.status == OperationStatus::Pending && op.not_before_ms <= now_ms
            })
            .map(|(i, _)| i)
            .collect();
        eligible.sort_by(|&a, &b| {
            ops[b]
                .priority
                .cmp(&ops[a].priority)
                .then(ops[a].sequence.cmp(&ops[b].sequence))
        });
        eligible.truncate(max_batch);

        let mut drained = Vec::with_capacity(eligible.len());
        for i in eligible {
            ops[i].status = OperationStatus::InFlight;
            drained.push(ops[i].clone());
        }

        if !drained.is_empty() {
            self.persist(entity_id).await?;
        }
        Ok(drained)
    }

    fn find(&self, operation_id: &str) -> Result<(String, usize)> {
        for (entity_id, ops) in &self.entries {
            if let Some(i) = ops.iter().position(|op| op.id == operation_id) {
                return Ok((entity_id.clone(), i));
            }
        }
        Err(OplogError::UnknownOperation(operation_id.to_string()))
    }

    /// The server acknowledged this operation: remove it from the log.
    pub async fn mark_acknowledged(&mut self, operation_id: &str) -> Result<()> {
        let (entity_id, i) = self.find(operation_id)?;
        let ops = self.entries.get_mut(&entity_id).expect("entity present");
        let op = ops.remove(i);
        debug!(
            "Acknowledged operation {} ({:?}) for entity {}",
            op.id, op.kind, entity_id
        );
        self.persist(&entity_id).await
    }

    /// Return all of an entity's in-flight operations to pending
    /// without counting a retry. Called at the start of a sync run:
    /// anything still in-flight was abandoned by a cancelled or failed
    /// earlier run, and resending is safe.
    pub async fn release_in_flight(&mut self, entity_id: &str) -> Result<usize> {
        let released = match self.entries.get_mut(entity_id) {
            Some(ops) => {
                let mut count = 0;
                for op in ops.iter_mut() {
                    if op.status == OperationStatus::InFlight {
                        op.status = OperationStatus::Pending;
                        count += 1;
                    }
                }
                count
            }
            None => 0,
        };
        if released > 0 {
            self.persist(entity_id).await?;
        }
        Ok(released)
    }

    /// Transmission failed: re-enqueue with exponential backoff, or
    /// dead-letter once the retry budget is exhausted.
    pub async fn mark_failed(
        &mut self,
        operation_id: &str,
        reason: &str,
        now_ms: u64,
    ) -> Result<FailureOutcome> {
        let (entity_id, i) = self.find(operation_id)?;
        let max_retries = self.config.max_retries;
        // Backoff delay is base * 2^retries, capped at max_delay
        let base = self.config.base_delay.as_millis() as u64;
        let cap = self.config.max_delay.as_millis() as u64;

        let outcome = {
            let ops = self.entries.get_mut(&entity_id).expect("entity present");
            let op = &mut ops[i];
            op.retries += 1;
            op.last_error = Some(reason.to_string());

            if op.retries > max_retries {
                op.status = OperationStatus::DeadLettered;
                warn!(
                    "Operation {} ({:?}) dead-lettered after {} attempts: {}",
                    op.id, op.kind, op.retries, reason
                );
                FailureOutcome::DeadLettered
            } else {
                let delay_ms = base
                    .saturating_mul(1u64 << op.retries.min(32))
                    .min(cap);
                op.status = OperationStatus::Pending;
                op.not_before_ms = now_ms + delay_ms;
                debug!(
                    "Operation {} failed (attempt {}): {}. Retrying in {}ms",
                    op.id, op.retries, reason, delay_ms
                );
                FailureOutcome::Requeued {
                    not_before_ms: op.not_before_ms,
                }
            }
        };
        self.persist(&entity_id).await?;
        Ok(outcome)
    }

    /// Pending operations for an entity (not yet drained or
    /// dead-lettered), regardless of backoff eligibility.
    pub fn pending_count(&self, entity_id: &str) -> usize {
        self.entries
            .get(entity_id)
            .map(|ops| {
                ops.iter()
                    .filter(|op| op.status == OperationStatus::Pending)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Earliest time any of an entity's pending operations becomes
    /// eligible to drain, if one exists. Drives the follow-up sync
    /// timer for operations waiting out their backoff.
    pub fn next_eligible_ms(&self, entity_id: &str) -> Option<u64> {
        self.entries
            .get(entity_id)?
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .map(|op| op.not_before_ms)
            .min()
    }

    /// Entities with at least one pending operation.
    pub fn entities_with_pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, ops)| {
                ops.iter().any(|op| op.status == OperationStatus::Pending)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Dead-lettered operations for an entity.
    pub fn dead_letters(&self, entity_id: &str) -> Vec<&Operation> {
        self.entries
            .get(entity_id)
            .map(|ops| {
                ops.iter()
                    .filter(|op| op.status == OperationStatus::DeadLettered)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Operator has handled a dead-lettered operation: remove it.
    pub async fn acknowledge_dead_letter(&mut self, operation_id: &str) -> Result<()> {
        self.remove_dead_letter(operation_id, false).await
    }

    /// Operator chose to abandon a dead-lettered operation: remove it
    /// and record that data was intentionally dropped.
    pub async fn discard_dead_letter(&mut self, operation_id: &str) -> Result<()> {
        self.remove_dead_letter(operation_id, true).await
    }

    async fn remove_dead_letter(&mut self, operation_id: &str, discarded: bool) -> Result<()> {
        let (entity_id, i) = self.find(operation_id)?;
        let ops = self.entries.get_mut(&entity_id).expect("entity present");
        if ops[i].status != OperationStatus::DeadLettered {
            return Err(OplogError::UnknownOperation(operation_id.to_string()));
        }
        let op = ops.remove(i);
        if discarded {
            warn!(
                "Discarded dead-lettered operation {} ({:?}) for entity {}",
                op.id, op.kind, entity_id
            );
        }
        self.persist(&entity_id).await
    }
}
