//! Pattern registry and unit arena.
//!
//! The registry maps pattern identities to resolution units, creating each
//! unit lazily on first lookup and reusing it for identical patterns — this
//! is what makes a recursive rule resolve to the same unit instead of
//! unrolling without bound. It owns the arena of unit cells; units reference
//! each other only through stable handles, never through pointers, so cyclic
//! dependency graphs stay plain data.
//!
//! Locking: lookups take the read lock; only creation takes the write lock.
//! Nothing here is held while a unit processes a message.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::error::{LatticeError, LatticeResult};
use crate::pattern::{Pattern, Term};
use crate::rule::RuleSet;
use crate::resolution::message::{Message, UnitId};
use crate::resolution::unit::{ResolutionUnit, RuleAlternative, UnitKind, UnitRole};
use crate::storage::FactSource;

/// Canonical term of a pattern identity: constants kept, variables replaced
/// by first-occurrence indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyTerm {
    Var(u32),
    Const(u64),
}

/// Canonical identity of a resolvable pattern in a given role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternKey {
    role: UnitRole,
    atoms: Vec<(String, Vec<KeyTerm>)>,
}

impl PatternKey {
    /// Canonicalizes a pattern: variable names are erased in favor of
    /// first-occurrence indices, so `p(?x, ?y)` and `p(?a, ?b)` share a unit.
    #[must_use]
    pub fn of(role: UnitRole, pattern: &Pattern) -> Self {
        let mut var_index: HashMap<&str, u32> = HashMap::new();
        let mut atoms = Vec::with_capacity(pattern.atoms().len());
        for atom in pattern.atoms() {
            let mut terms = Vec::with_capacity(atom.arity());
            for term in atom.terms() {
                terms.push(match term {
                    Term::Var(name) => {
                        let next = var_index.len() as u32;
                        KeyTerm::Var(*var_index.entry(name.as_str()).or_insert(next))
                    }
                    Term::Const(id) => KeyTerm::Const(id.raw()),
                });
            }
            atoms.push((atom.predicate().to_string(), terms));
        }
        Self { role, atoms }
    }

    /// Stable content fingerprint, for logs and diagnostics.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.to_string().as_bytes());
        let mut out = String::with_capacity(16);
        for b in &hash.as_bytes()[..8] {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            UnitRole::Conjunctive => write!(f, "conj|")?,
            UnitRole::Concludable => write!(f, "concl|")?,
        }
        for (i, (predicate, terms)) in self.atoms.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{predicate}(")?;
            for (j, term) in terms.iter().enumerate() {
                if j > 0 {
                    write!(f, ",")?;
                }
                match term {
                    KeyTerm::Var(v) => write!(f, "v{v}")?,
                    KeyTerm::Const(c) => write!(f, "#{c:x}")?,
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// One unit's cell in the arena: mailbox, scheduling flag, and state.
///
/// The `scheduled` flag guarantees a single consumer: whoever wins the swap
/// enqueues the unit on the ready queue, and only the worker that dequeued it
/// drains the mailbox and touches the state.
pub struct UnitCell {
    pub(crate) mailbox: Mutex<VecDeque<Message>>,
    pub(crate) scheduled: AtomicBool,
    pub(crate) state: Mutex<ResolutionUnit>,
}

struct Inner {
    keys: HashMap<PatternKey, UnitId>,
    units: Vec<Arc<UnitCell>>,
}

/// Maps pattern identities to units; owns the unit arena.
pub struct Registry {
    rules: Arc<RuleSet>,
    facts: Arc<dyn FactSource>,
    inner: RwLock<Inner>,
}

impl Registry {
    /// Creates a registry over a rule configuration and a fact source.
    #[must_use]
    pub fn new(rules: Arc<RuleSet>, facts: Arc<dyn FactSource>) -> Self {
        Self {
            rules,
            facts,
            inner: RwLock::new(Inner {
                keys: HashMap::new(),
                units: Vec::new(),
            }),
        }
    }

    /// Idempotent get-or-create of the unit for a pattern in a role.
    pub fn resolve(&self, role: UnitRole, pattern: &Pattern) -> LatticeResult<UnitId> {
        let key = PatternKey::of(role, pattern);
        {
            let inner = self
                .inner
                .read()
                .map_err(|_| LatticeError::internal("registry lock poisoned"))?;
            if let Some(id) = inner.keys.get(&key) {
                return Ok(*id);
            }
        }

        // Build the kind outside the write lock; construction is pure.
        let kind = self.kind_for(role, pattern);

        let mut inner = self
            .inner
            .write()
            .map_err(|_| LatticeError::internal("registry lock poisoned"))?;
        if let Some(id) = inner.keys.get(&key) {
            // Another thread created it while we were building.
            return Ok(*id);
        }
        let id = UnitId::new(inner.units.len() as u32);
        let description: Arc<str> = Arc::from(pattern.to_string());
        debug!(unit = %id, key = %key, fingerprint = %key.fingerprint(), "unit created");
        let unit = ResolutionUnit::new(id, description, kind, Arc::clone(&self.facts));
        inner.units.push(Arc::new(UnitCell {
            mailbox: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
            state: Mutex::new(unit),
        }));
        inner.keys.insert(key, id);
        Ok(id)
    }

    /// Selects the unit kind from pattern shape and the rule configuration.
    fn kind_for(&self, role: UnitRole, pattern: &Pattern) -> UnitKind {
        match role {
            UnitRole::Concludable => {
                // Concludable patterns are single atoms by construction.
                let atom = pattern.atoms()[0].clone();
                let alternatives: Vec<RuleAlternative> = self
                    .rules
                    .rules_for(atom.predicate())
                    .filter_map(|rule| {
                        let theta = rule.match_head(&atom)?;
                        let body_pattern = rule.body().bound(&theta);
                        let body_vars = body_pattern.vars();
                        Some(RuleAlternative {
                            rule_name: rule.name().to_string(),
                            body_vars,
                            head: rule.head().bound(&theta),
                            body_pattern,
                        })
                    })
                    .collect();
                UnitKind::Conclusion {
                    atom,
                    alternatives,
                    deps: Vec::new(),
                }
            }
            UnitRole::Conjunctive => {
                let mut base_atoms = Vec::new();
                let mut inferable = Vec::new();
                for atom in pattern.atoms() {
                    if self.rules.is_inferable(atom.predicate()) {
                        inferable.push(atom.clone());
                    } else {
                        base_atoms.push(atom.clone());
                    }
                }
                if inferable.is_empty() {
                    UnitKind::Retrieval {
                        pattern: pattern.clone(),
                    }
                } else {
                    UnitKind::Conjunction {
                        base: Pattern::new(base_atoms).ok(),
                        inferable,
                        out_vars: pattern.vars(),
                    }
                }
            }
        }
    }

    /// The cell for a unit handle.
    pub fn cell(&self, id: UnitId) -> LatticeResult<Arc<UnitCell>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LatticeError::internal("registry lock poisoned"))?;
        inner
            .units
            .get(id.index())
            .cloned()
            .ok_or_else(|| LatticeError::internal(format!("unknown unit {id}")))
    }

    /// Handles of every unit created so far (for per-query cleanup).
    pub fn unit_ids(&self) -> Vec<UnitId> {
        match self.inner.read() {
            Ok(inner) => (0..inner.units.len())
                .map(|i| UnitId::new(i as u32))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of units created so far.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.inner.read().map(|inner| inner.units.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::ConceptId;
    use crate::pattern::Atom;
    use crate::rule::Rule;
    use crate::storage::MemoryFactStore;

    fn c(n: u64) -> ConceptId {
        ConceptId::new(n)
    }

    fn ancestor_rules() -> Arc<RuleSet> {
        let base = Rule::new(
            "anc-base",
            Atom::new("ancestor", vec![Term::var("x"), Term::var("y")]).unwrap(),
            Pattern::atom(Atom::new("parent", vec![Term::var("x"), Term::var("y")]).unwrap())
                .unwrap(),
        )
        .unwrap();
        Arc::new(RuleSet::new(vec![base]).unwrap())
    }

    fn registry() -> Registry {
        Registry::new(ancestor_rules(), Arc::new(MemoryFactStore::new()))
    }

    #[test]
    fn identical_patterns_share_a_unit() {
        let registry = registry();
        let p1 = Pattern::atom(Atom::new("parent", vec![Term::var("x"), Term::var("y")]).unwrap())
            .unwrap();
        let p2 = Pattern::atom(Atom::new("parent", vec![Term::var("a"), Term::var("b")]).unwrap())
            .unwrap();
        let u1 = registry.resolve(UnitRole::Conjunctive, &p1).unwrap();
        let u2 = registry.resolve(UnitRole::Conjunctive, &p2).unwrap();
        assert_eq!(u1, u2, "alpha-equivalent patterns share identity");
        assert_eq!(registry.unit_count(), 1);
    }

    #[test]
    fn roles_are_distinct_identities() {
        let registry = registry();
        let p = Pattern::atom(
            Atom::new("ancestor", vec![Term::var("x"), Term::var("y")]).unwrap(),
        )
        .unwrap();
        let conjunctive = registry.resolve(UnitRole::Conjunctive, &p).unwrap();
        let concludable = registry.resolve(UnitRole::Concludable, &p).unwrap();
        assert_ne!(conjunctive, concludable);
    }

    #[test]
    fn bound_patterns_get_their_own_units() {
        let registry = registry();
        let unbound = Pattern::atom(
            Atom::new("ancestor", vec![Term::var("x"), Term::var("y")]).unwrap(),
        )
        .unwrap();
        let bound = Pattern::atom(
            Atom::new("ancestor", vec![Term::constant(c(1)), Term::var("y")]).unwrap(),
        )
        .unwrap();
        let u1 = registry.resolve(UnitRole::Concludable, &unbound).unwrap();
        let u2 = registry.resolve(UnitRole::Concludable, &bound).unwrap();
        assert_ne!(u1, u2);
    }

    #[test]
    fn repeated_vars_differ_from_distinct_vars() {
        let p_xy = Pattern::atom(Atom::new("p", vec![Term::var("x"), Term::var("y")]).unwrap())
            .unwrap();
        let p_xx = Pattern::atom(Atom::new("p", vec![Term::var("x"), Term::var("x")]).unwrap())
            .unwrap();
        let k1 = PatternKey::of(UnitRole::Conjunctive, &p_xy);
        let k2 = PatternKey::of(UnitRole::Conjunctive, &p_xx);
        assert_ne!(k1, k2);
    }

    #[test]
    fn fingerprint_is_stable() {
        let p = Pattern::atom(Atom::new("p", vec![Term::var("x")]).unwrap()).unwrap();
        let k1 = PatternKey::of(UnitRole::Conjunctive, &p);
        let k2 = PatternKey::of(UnitRole::Conjunctive, &p);
        assert_eq!(k1.fingerprint(), k2.fingerprint());
        assert_eq!(k1.fingerprint().len(), 16);
    }
}
