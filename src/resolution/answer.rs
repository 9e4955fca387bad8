//! Answers and derivation provenance.
//!
//! Every answer carries the binding it resolved, the unit that produced it,
//! and a derivation: the map from contributing downstream units to the
//! sub-answers they supplied. An empty derivation means the answer came
//! straight from the fact source. Derivations are never mutated once attached
//! to a published answer; answers are shared as `Arc<Answer>` so concurrent
//! upstream consumers of a memoized answer observe one consistent snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::binding::Binding;
use crate::error::ProtocolError;
use crate::resolution::message::UnitId;

/// Provenance record: contributing unit -> the answer that unit supplied.
#[derive(Debug, Clone, Default)]
pub struct Derivation {
    entries: BTreeMap<UnitId, Arc<Answer>>,
}

impl Derivation {
    /// The empty derivation: "not inferred, came from the fact source".
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when no unit contributed (a fact-backed answer).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of contributing units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates contributing units and their answers, ordered by unit handle.
    pub fn entries(&self) -> impl Iterator<Item = (UnitId, &Arc<Answer>)> {
        self.entries.iter().map(|(unit, answer)| (*unit, answer))
    }

    /// Returns a new derivation with one more entry.
    ///
    /// A unit may contribute at most once; a duplicate key would silently
    /// corrupt explanations, so it is rejected as a protocol error.
    pub fn with(&self, unit: UnitId, answer: Arc<Answer>) -> Result<Self, ProtocolError> {
        if self.entries.contains_key(&unit) {
            return Err(ProtocolError::DuplicateDerivationEntry {
                unit: unit.to_string(),
            });
        }
        let mut entries = self.entries.clone();
        entries.insert(unit, answer);
        Ok(Self { entries })
    }
}

/// A resolved binding with provenance.
#[derive(Debug, Clone)]
pub struct Answer {
    binding: Binding,
    derivation: Derivation,
    producer: UnitId,
    description: Arc<str>,
}

impl Answer {
    /// Constructs an answer.
    #[must_use]
    pub fn new(
        binding: Binding,
        derivation: Derivation,
        producer: UnitId,
        description: Arc<str>,
    ) -> Self {
        Self {
            binding,
            derivation,
            producer,
            description,
        }
    }

    /// The resolved binding.
    #[must_use]
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// The provenance record.
    #[must_use]
    pub fn derivation(&self) -> &Derivation {
        &self.derivation
    }

    /// Handle of the unit that produced this answer.
    #[must_use]
    pub fn producer(&self) -> UnitId {
        self.producer
    }

    /// Human-readable label of the produced pattern.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// True when at least one rule application contributed.
    #[must_use]
    pub fn is_inferred(&self) -> bool {
        !self.derivation.is_empty()
    }

    /// Materializes the full proof tree for this answer.
    #[must_use]
    pub fn proof(&self) -> ProofNode {
        let mut children: Vec<ProofNode> = self
            .derivation
            .entries()
            .map(|(_, sub)| sub.proof())
            .collect();
        // Content-wise order keeps the export independent of arena handles,
        // so identical derivation graphs serialize byte-for-byte.
        children.sort_by(|a, b| (&a.pattern, &a.binding).cmp(&(&b.pattern, &b.binding)));
        ProofNode {
            pattern: self.description.to_string(),
            fingerprint: fingerprint(&self.description),
            binding: self.binding.clone(),
            kind: if self.is_inferred() {
                ProofKind::Inferred
            } else {
                ProofKind::Fact
            },
            children,
        }
    }
}

// Equality and hashing are over the binding only: deduplication throughout
// the protocol treats two answers with the same binding as the same answer,
// whatever their derivations.
impl PartialEq for Answer {
    fn eq(&self, other: &Self) -> bool {
        self.binding == other.binding
    }
}

impl Eq for Answer {}

impl Hash for Answer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.binding.hash(state);
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.description, self.binding)
    }
}

/// Stable content fingerprint of a pattern label.
#[must_use]
fn fingerprint(label: &str) -> String {
    let hash = blake3::hash(label.as_bytes());
    let mut out = String::with_capacity(16);
    for b in &hash.as_bytes()[..8] {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Whether a proof node rests on a fact or a rule application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    /// Supplied directly by the fact source.
    Fact,
    /// Derived by applying a rule.
    Inferred,
}

/// One node of an exported proof tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    /// Label of the resolved pattern.
    pub pattern: String,
    /// Stable content fingerprint of the pattern label.
    pub fingerprint: String,
    /// The binding this node resolved.
    pub binding: Binding,
    /// Fact-backed or inferred.
    pub kind: ProofKind,
    /// Sub-proofs, in content order.
    pub children: Vec<ProofNode>,
}

impl ProofNode {
    /// Serializes the proof tree to JSON.
    ///
    /// Given the same derivation graph the output is identical byte-for-byte,
    /// which makes exported explanations diffable across runs.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
