//! Versioned binary wire format for document deltas and snapshots.
//!
//! Every encoded payload is wrapped in a fixed envelope:
//!
//! ```text
//! [0..2)  magic  b"FD"
//! [2]     format version (currently 1)
//! [3]     payload kind (0 = delta, 1 = snapshot)
//! [4..]   bincode-encoded body
//! ```
//!
//! Decoding rejects the whole message on any fault - unknown magic,
//! unsupported version, kind mismatch, body decode failure, or trailing
//! bytes - before any document state is touched. A delta either applies
//! completely or not at all.

use crate::clock::Stamp;
use crate::document::{CausalId, FieldNote, FieldValue, PhotoRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magic prefix for all fieldsync payloads.
pub const WIRE_MAGIC: [u8; 2] = *b"FD";

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("Corrupt delta: {0}")]
    CorruptDelta(String),
}

pub type Result<T> = std::result::Result<T, DeltaError>;

/// Payload kind tag carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Delta,
    Snapshot,
}

impl PayloadKind {
    fn as_byte(self) -> u8 {
        match self {
            PayloadKind::Delta => 0,
            PayloadKind::Snapshot => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PayloadKind::Delta),
            1 => Some(PayloadKind::Snapshot),
            _ => None,
        }
    }
}

/// One merge operation inside a delta.
///
/// The union is tagged per field type: add-only inserts carry the full
/// record (merge is set union), last-writer-wins updates carry their
/// stamp (merge is stamp comparison).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// A field note was appended.
    NoteAdded(FieldNote),
    /// A structured field was written.
    FieldSet {
        key: String,
        value: FieldValue,
        stamp: Stamp,
    },
    /// A photo reference was added.
    PhotoAdded(PhotoRef),
    /// A photo caption was written.
    CaptionSet {
        photo: CausalId,
        caption: String,
        stamp: Stamp,
    },
}

/// An encoded change to one entity's document.
///
/// Produced by `InspectionDocument::apply_local`, carried as the
/// Operation Log payload, and merged on the receiving side with
/// `apply_remote`. Application is idempotent and commutative, so
/// duplicate or out-of-order delivery is safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDelta {
    pub entity_id: String,
    pub ops: Vec<DeltaOp>,
}

impl DocumentDelta {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            ops: Vec::new(),
        }
    }

    /// Encode with the versioned envelope.
    pub fn encode(&self) -> Vec<u8> {
        encode_payload(PayloadKind::Delta, self)
    }

    /// Decode, rejecting the whole message on any fault.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_payload(PayloadKind::Delta, bytes)
    }
}

/// Wrap a bincode body in the magic/version/kind envelope.
pub fn encode_payload<T: Serialize>(kind: PayloadKind, payload: &T) -> Vec<u8> {
    let body = bincode::serialize(payload).expect("payload serialization should not fail");
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&WIRE_MAGIC);
    out.push(WIRE_VERSION);
    out.push(kind.as_byte());
    out.extend_from_slice(&body);
    out
}

/// Unwrap and decode an envelope, verifying magic, version, kind, and
/// that the body consumes every byte.
pub fn decode_payload<T: Serialize + DeserializeOwned>(
    kind: PayloadKind,
    bytes: &[u8],
) -> Result<T> {
    if bytes.len() < 4 {
        return Err(DeltaError::CorruptDelta(format!(
            "payload too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[..2] != WIRE_MAGIC {
        return Err(DeltaError::CorruptDelta("bad magic".into()));
    }
    if bytes[2] != WIRE_VERSION {
        return Err(DeltaError::CorruptDelta(format!(
            "unsupported format version {}",
            bytes[2]
        )));
    }
    match PayloadKind::from_byte(bytes[3]) {
        Some(found) if found == kind => {}
        Some(found) => {
            return Err(DeltaError::CorruptDelta(format!(
                "expected {:?} payload, found {:?}",
                kind, found
            )));
        }
        None => {
            return Err(DeltaError::CorruptDelta(format!(
                "unknown payload kind {}",
                bytes[3]
            )));
        }
    }

    let body = &bytes[4..];
    let decoded: T = bincode::deserialize(body)
        .map_err(|e| DeltaError::CorruptDelta(e.to_string()))?;

    // Re-measure the canonical encoding so trailing garbage is caught.
    let expected_len = bincode::serialized_size(&decoded)
        .map_err(|e| DeltaError::CorruptDelta(e.to_string()))? as usize;
    if expected_len != body.len() {
        return Err(DeltaError::CorruptDelta(format!(
            "trailing bytes: body is {} bytes, payload consumed {}",
            body.len(),
            expected_len
        )));
    }

    Ok(decoded)
}
