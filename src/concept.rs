//! Concept identifiers.
//!
//! Facts are tuples of opaque concept identifiers supplied by the underlying
//! graph. LatticeQL never inspects their structure; it only compares, hashes,
//! and prints them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier for a concept in the fact graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptId(u64);

impl ConceptId {
    /// Wraps a raw identifier handed out by the storage engine.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Derives a stable identifier from a human-readable name.
    ///
    /// The mapping is deterministic across runs and processes, so proofs and
    /// exported explanations built from named concepts reproduce byte-for-byte.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let hash = blake3::hash(name.as_bytes());
        let bytes = hash.as_bytes();
        let mut raw = 0u64;
        for (i, b) in bytes[..8].iter().enumerate() {
            raw |= u64::from(*b) << (8 * i);
        }
        Self(raw)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_name_is_stable() {
        let a = ConceptId::from_name("alice");
        let b = ConceptId::from_name("alice");
        assert_eq!(a, b);
        assert_ne!(a, ConceptId::from_name("bob"));
    }

    #[test]
    fn display_is_compact() {
        let id = ConceptId::new(0xff);
        assert_eq!(id.to_string(), "#ff");
    }
}
