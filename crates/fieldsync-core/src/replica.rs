//! ReplicaId: Unique identifier for a device/process participating in sync.
//!
//! Wraps a u64 internally (cheap to compare, copy, and embed in causal
//! identifiers) but displays as a 16-character hex string for logs and
//! persisted state.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaIdError {
    #[error("Invalid replica ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// A unique identifier for a replica (one device or server process).
///
/// Every causal identifier and every last-writer-wins tie-break in the
/// document store is scoped by a `ReplicaId`, so two replicas must never
/// share one. Generated once per install and persisted with the local
/// store.
///
/// # Examples
/// ```
/// use fieldsync_core::ReplicaId;
///
/// let replica_id = ReplicaId::generate();
/// println!("{}", replica_id);  // "a1b2c3d4e5f67890"
///
/// let parsed: ReplicaId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(u64);

impl ReplicaId {
    /// Generate a new random replica ID.
    ///
    /// Uses cryptographically secure randomness. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Get the underlying u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = ReplicaIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)
                .map_err(ReplicaIdError::InvalidHex)?;
            return Ok(Self(id));
        }

        Err(ReplicaIdError::InvalidFormat)
    }
}

impl From<u64> for ReplicaId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ReplicaId> for u64 {
    fn from(replica_id: ReplicaId) -> u64 {
        replica_id.0
    }
}

// Serialize as hex string for consistency in logs, errors, JSON
impl serde::Serialize for ReplicaId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ReplicaId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_hex() {
        let replica_id = ReplicaId(0xa1b2c3d4e5f67890);
        assert_eq!(replica_id.to_string(), "a1b2c3d4e5f67890");
    }

    #[test]
    fn test_display_zero_padded() {
        let replica_id = ReplicaId(0xff);
        assert_eq!(replica_id.to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_hex() {
        let replica_id: ReplicaId = "a1b2c3d4e5f67890".parse().unwrap();
        assert_eq!(replica_id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let replica_id: ReplicaId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(replica_id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_roundtrip() {
        let original = ReplicaId::generate();
        let serialized = original.to_string();
        let parsed: ReplicaId = serialized.parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_invalid_format() {
        assert!("too_short".parse::<ReplicaId>().is_err());
        assert!("not-a-valid-format-at-all".parse::<ReplicaId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<ReplicaId>().is_err()); // non-hex
    }

    #[test]
    fn test_reject_wrong_length() {
        assert!("a1b2c3d4e5f6789".parse::<ReplicaId>().is_err()); // 15 chars
        assert!("a1b2c3d4e5f678901".parse::<ReplicaId>().is_err()); // 17 chars
        assert!("".parse::<ReplicaId>().is_err()); // empty
    }

    #[test]
    fn test_generate_not_zero() {
        // Generate many and ensure none are zero
        for _ in 0..1000 {
            assert_ne!(ReplicaId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_ordering_is_total() {
        let a = ReplicaId(1);
        let b = ReplicaId(2);
        assert!(a < b);
        assert_eq!(a.max(b), b);
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = ReplicaId::generate();
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ReplicaId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
