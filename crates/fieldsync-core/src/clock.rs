//! Lamport clock and write stamps for last-writer-wins resolution.
//!
//! Every structured-field write carries a `Stamp`: the writing replica's
//! logical clock value plus its replica id. Stamps form a total order
//! (clock first, replica id as tie-break), so any two replicas resolve a
//! conflicting write identically regardless of delivery order. Wall time
//! never participates in conflict resolution.

use crate::replica::ReplicaId;
use serde::{Deserialize, Serialize};

/// A logical write stamp: `(clock, replica)`.
///
/// Ordering is derived: higher clock wins; equal clocks fall back to the
/// replica id. The tie-break is arbitrary but consistent everywhere.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Stamp {
    pub clock: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(clock: u64, replica: ReplicaId) -> Self {
        Self { clock, replica }
    }
}

/// A Lamport clock owned by one replica.
///
/// `tick()` before every local write; `observe()` for every stamp merged
/// in from a remote delta. After observing, the next local tick is
/// guaranteed to produce a stamp greater than anything seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self { value: 0 }
    }

    /// Restore a clock from a persisted value.
    pub fn from_value(value: u64) -> Self {
        Self { value }
    }

    /// Current clock value.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Advance for a local write and return the new value.
    pub fn tick(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    /// Fold in a remotely observed clock value.
    pub fn observe(&mut self, remote: u64) {
        if remote > self.value {
            self.value = remote;
        }
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}
