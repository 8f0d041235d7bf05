//! InspectionDocument: per-entity replicated document (CRDT).
//!
//! Each entity (a property, or property+parcel composite) owns one
//! document holding three replicated collections:
//! - field notes: an add-only set keyed by `(replica, counter)`; merge is
//!   set union, deletion is not supported (append-only audit trail)
//! - structured fields: last-writer-wins registers stamped with a
//!   Lamport clock; higher stamp wins, ties broken by replica id
//! - photo references: add-only like notes; captions live in a separate
//!   last-writer-wins map so caption updates commute with photo adds
//!
//! Applying the same set of remote deltas in any order, any number of
//! times, yields an identical document. Local mutation goes through
//! `apply_local`, which returns the encoded delta driving both the
//! Operation Log payload and outbound sync. UI code never mutates a
//! document directly.

use crate::clock::{LamportClock, Stamp};
use crate::delta::{
    decode_payload, encode_payload, DeltaError, DeltaOp, DocumentDelta, PayloadKind,
};
use crate::replica::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error("Unknown photo: {0}")]
    UnknownPhoto(CausalId),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Causal identity for add-only records: `(replica, counter)`.
///
/// Minted from the owning replica's per-document counter, so two
/// replicas can never produce the same id and duplicate delivery is
/// idempotent by construction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CausalId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl CausalId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }
}

impl Display for CausalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica, self.counter)
    }
}

/// A single appraiser note. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldNote {
    pub id: CausalId,
    pub author_id: String,
    pub author_name: String,
    /// UTC capture time in milliseconds since epoch. Display ordering
    /// only; never used for conflict resolution.
    pub timestamp_ms: u64,
    pub text: String,
}

/// Value of a structured property attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
}

/// A last-writer-wins register for a structured field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwField {
    pub value: FieldValue,
    pub stamp: Stamp,
}

/// A last-writer-wins register for a photo caption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwText {
    pub value: String,
    pub stamp: Stamp,
}

/// Category of a captured photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhotoKind {
    Exterior,
    Interior,
    Detail,
    Damage,
    Document,
}

/// Capture location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A replicated photo reference. The binary payload itself is tracked
/// by the asset registry, not the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRef {
    pub id: CausalId,
    pub asset_id: String,
    pub kind: PhotoKind,
    pub captured_at_ms: u64,
    pub location: Option<GeoPoint>,
}

/// A user-initiated local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    AddFieldNote {
        author_id: String,
        author_name: String,
        timestamp_ms: u64,
        text: String,
    },
    SetField {
        key: String,
        value: FieldValue,
    },
    AddPhoto {
        asset_id: String,
        kind: PhotoKind,
        captured_at_ms: u64,
        location: Option<GeoPoint>,
    },
    SetPhotoCaption {
        photo: CausalId,
        caption: String,
    },
}

/// Serialized snapshot body. Replica-independent: the decoding replica
/// restores its own counter from `seen`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DocumentState {
    entity_id: String,
    clock: u64,
    notes: BTreeMap<CausalId, FieldNote>,
    fields: BTreeMap<String, LwwField>,
    photos: BTreeMap<CausalId, PhotoRef>,
    captions: BTreeMap<CausalId, LwwText>,
    seen: BTreeMap<ReplicaId, u64>,
}

/// One entity's replicated document, owned by one replica.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectionDocument {
    entity_id: String,
    replica: ReplicaId,
    clock: LamportClock,
    /// Counter for minting causal ids under our replica id.
    counter: u64,
    notes: BTreeMap<CausalId, FieldNote>,
    fields: BTreeMap<String, LwwField>,
    photos: BTreeMap<CausalId, PhotoRef>,
    captions: BTreeMap<CausalId, LwwText>,
    /// Highest counter observed per replica. Restores `counter` after
    /// snapshot recovery and keeps duplicate detection cheap.
    seen: BTreeMap<ReplicaId, u64>,
}

impl InspectionDocument {
    /// Create an empty document for an entity.
    pub fn new(entity_id: impl Into<String>, replica: ReplicaId) -> Self {
        Self {
            entity_id: entity_id.into(),
            replica,
            clock: LamportClock::new(),
            counter: 0,
            notes: BTreeMap::new(),
            fields: BTreeMap::new(),
            photos: BTreeMap::new(),
            captions: BTreeMap::new(),
            seen: BTreeMap::new(),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Notes in display order: newest first by capture time, causal id
    /// as the deterministic tie-break.
    pub fn notes_newest_first(&self) -> Vec<&FieldNote> {
        let mut notes: Vec<&FieldNote> = self.notes.values().collect();
        notes.sort_by(|a, b| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        notes
    }

    /// Current value of a structured field.
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key).map(|f| &f.value)
    }

    /// All structured fields.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, f)| (k.as_str(), &f.value))
    }

    /// All photo references.
    pub fn photos(&self) -> impl Iterator<Item = &PhotoRef> {
        self.photos.values()
    }

    /// Current caption for a photo, if one has been written.
    pub fn caption(&self, photo: &CausalId) -> Option<&str> {
        self.captions.get(photo).map(|c| c.value.as_str())
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    /// Mint a fresh causal id under our replica.
    fn mint_id(&mut self) -> CausalId {
        self.counter += 1;
        self.seen.insert(self.replica, self.counter);
        CausalId::new(self.replica, self.counter)
    }

    fn record_seen(&mut self, id: CausalId) {
        let entry = self.seen.entry(id.replica).or_insert(0);
        if id.counter > *entry {
            *entry = id.counter;
        }
    }

    /// Apply a local mutation and return the delta describing exactly
    /// the change made. Never touches storage or network.
    pub fn apply_local(&mut self, mutation: Mutation) -> Result<DocumentDelta> {
        let mut delta = DocumentDelta::new(self.entity_id.clone());

        match mutation {
            Mutation::AddFieldNote {
                author_id,
                author_name,
                timestamp_ms,
                text,
            } => {
                let note = FieldNote {
                    id: self.mint_id(),
                    author_id,
                    author_name,
                    timestamp_ms,
                    text,
                };
                self.notes.insert(note.id, note.clone());
                delta.ops.push(DeltaOp::NoteAdded(note));
            }

            Mutation::SetField { key, value } => {
                let stamp = Stamp::new(self.clock.tick(), self.replica);
                self.fields.insert(
                    key.clone(),
                    LwwField {
                        value: value.clone(),
                        stamp,
                    },
                );
                delta.ops.push(DeltaOp::FieldSet { key, value, stamp });
            }

            Mutation::AddPhoto {
                asset_id,
                kind,
                captured_at_ms,
                location,
            } => {
                let photo = PhotoRef {
                    id: self.mint_id(),
                    asset_id,
                    kind,
                    captured_at_ms,
                    location,
                };
                self.photos.insert(photo.id, photo.clone());
                delta.ops.push(DeltaOp::PhotoAdded(photo));
            }

            Mutation::SetPhotoCaption { photo, caption } => {
                if !self.photos.contains_key(&photo) {
                    return Err(DocumentError::UnknownPhoto(photo));
                }
                let stamp = Stamp::new(self.clock.tick(), self.replica);
                self.captions.insert(
                    photo,
                    LwwText {
                        value: caption.clone(),
                        stamp,
                    },
                );
                delta.ops.push(DeltaOp::CaptionSet {
                    photo,
                    caption,
                    stamp,
                });
            }
        }

        Ok(delta)
    }

    /// Merge an encoded remote delta.
    ///
    /// Idempotent and commutative: safe to call multiple times with the
    /// same delta, in any order relative to other deltas. A malformed
    /// delta is rejected whole and no state changes.
    ///
    /// Returns true if the document was modified.
    pub fn apply_remote(&mut self, bytes: &[u8]) -> Result<bool> {
        let delta = DocumentDelta::decode(bytes)?;
        if delta.entity_id != self.entity_id {
            return Err(DeltaError::CorruptDelta(format!(
                "delta addressed to entity {}, document is {}",
                delta.entity_id, self.entity_id
            ))
            .into());
        }
        Ok(self.merge_delta(&delta))
    }

    /// Merge an already-decoded delta. Returns true if state changed.
    pub fn merge_delta(&mut self, delta: &DocumentDelta) -> bool {
        let mut modified = false;

        for op in &delta.ops {
            match op {
                DeltaOp::NoteAdded(note) => {
                    self.record_seen(note.id);
                    if !self.notes.contains_key(&note.id) {
                        self.notes.insert(note.id, note.clone());
                        modified = true;
                    }
                }

                DeltaOp::FieldSet { key, value, stamp } => {
                    self.clock.observe(stamp.clock);
                    let wins = match self.fields.get(key) {
                        Some(current) => *stamp > current.stamp,
                        None => true,
                    };
                    if wins {
                        self.fields.insert(
                            key.clone(),
                            LwwField {
                                value: value.clone(),
                                stamp: *stamp,
                            },
                        );
                        modified = true;
                    }
                }

                DeltaOp::PhotoAdded(photo) => {
                    self.record_seen(photo.id);
                    if !self.photos.contains_key(&photo.id) {
                        self.photos.insert(photo.id, photo.clone());
                        modified = true;
                    }
                }

                DeltaOp::CaptionSet {
                    photo,
                    caption,
                    stamp,
                } => {
                    self.clock.observe(stamp.clock);
                    // The photo itself may not have arrived yet; the
                    // caption register is kept independently so the
                    // merge commutes either way.
                    let wins = match self.captions.get(photo) {
                        Some(current) => *stamp > current.stamp,
                        None => true,
                    };
                    if wins {
                        self.captions.insert(
                            *photo,
                            LwwText {
                                value: caption.clone(),
                                stamp: *stamp,
                            },
                        );
                        modified = true;
                    }
                }
            }
        }

        modified
    }

    /// Full-state snapshot in the versioned envelope. Internal maps are
    /// ordered, so the encoding is canonical: two converged replicas
    /// produce byte-identical snapshots.
    pub fn encode(&self) -> Vec<u8> {
        let state = DocumentState {
            entity_id: self.entity_id.clone(),
            clock: self.clock.value(),
            notes: self.notes.clone(),
            fields: self.fields.clone(),
            photos: self.photos.clone(),
            captions: self.captions.clone(),
            seen: self.seen.clone(),
        };
        encode_payload(PayloadKind::Snapshot, &state)
    }

    /// Restore a document from a snapshot for the given replica.
    ///
    /// The replica's minting counter is recovered from the snapshot's
    /// per-replica counters, so ids minted after recovery never collide
    /// with ids minted before.
    pub fn decode(bytes: &[u8], replica: ReplicaId) -> Result<Self> {
        let state: DocumentState = decode_payload(PayloadKind::Snapshot, bytes)?;
        let counter = state.seen.get(&replica).copied().unwrap_or(0);
        Ok(Self {
            entity_id: state.entity_id,
            replica,
            clock: LamportClock::from_value(state.clock),
            counter,
            notes: state.notes,
            fields: state.fields,
            photos: state.photos,
            captions: state.captions,
            seen: state.seen,
        })
    }
}
