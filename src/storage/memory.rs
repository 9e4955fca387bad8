//! In-memory fact store.
//!
//! Thread-safe reference backend answering conjunctive base patterns with a
//! deterministic nested-loop join. Intended for embedded usage, tests, and as
//! the substrate of the bottom-up oracle; a production deployment would back
//! `FactSource` with the graph-traversal engine instead.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::binding::{Binding, Substitution};
use crate::concept::ConceptId;
use crate::pattern::Pattern;
use crate::storage::{FactSource, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct Relation {
    arity: usize,
    // Insertion order drives enumeration order; the set enforces set semantics.
    rows: Vec<Vec<ConceptId>>,
    seen: HashSet<Vec<ConceptId>>,
}

/// Thread-safe in-memory fact store with set semantics per predicate.
#[derive(Debug, Default)]
pub struct MemoryFactStore {
    relations: RwLock<HashMap<String, Relation>>,
}

impl MemoryFactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fact tuple. Returns `true` if the tuple was new.
    ///
    /// The first insert for a predicate fixes its arity; later inserts with a
    /// different arity are rejected.
    pub fn insert(
        &self,
        predicate: impl Into<String>,
        tuple: Vec<ConceptId>,
    ) -> Result<bool, StorageError> {
        let predicate = predicate.into();
        let mut relations = self.relations.write().map_err(|_| lock_err("relations"))?;
        let relation = relations.entry(predicate.clone()).or_insert_with(|| Relation {
            arity: tuple.len(),
            rows: Vec::new(),
            seen: HashSet::new(),
        });
        if relation.arity != tuple.len() {
            return Err(StorageError::ArityMismatch {
                predicate,
                expected: relation.arity,
                actual: tuple.len(),
            });
        }
        if !relation.seen.insert(tuple.clone()) {
            return Ok(false);
        }
        relation.rows.push(tuple);
        Ok(true)
    }

    /// Number of stored tuples for a predicate.
    pub fn count(&self, predicate: &str) -> Result<usize, StorageError> {
        let relations = self.relations.read().map_err(|_| lock_err("relations"))?;
        Ok(relations.get(predicate).map_or(0, |r| r.rows.len()))
    }

    /// Total number of stored tuples.
    pub fn len(&self) -> Result<usize, StorageError> {
        let relations = self.relations.read().map_err(|_| lock_err("relations"))?;
        Ok(relations.values().map(|r| r.rows.len()).sum())
    }

    /// True when no tuple is stored.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Lists every stored fact as `(predicate, tuple)` pairs.
    pub fn facts(&self) -> Result<Vec<(String, Vec<ConceptId>)>, StorageError> {
        let relations = self.relations.read().map_err(|_| lock_err("relations"))?;
        let mut out = Vec::new();
        for (predicate, relation) in relations.iter() {
            for row in &relation.rows {
                out.push((predicate.clone(), row.clone()));
            }
        }
        Ok(out)
    }

    /// Enumerates every solution of a conjunctive pattern, deduplicated, in a
    /// deterministic order (depth-first over atoms, rows in insertion order).
    ///
    /// Solutions are tuples over the pattern's canonical variable sequence.
    pub fn solutions(&self, pattern: &Pattern) -> Result<Vec<Binding>, StorageError> {
        let relations = self.relations.read().map_err(|_| lock_err("relations"))?;
        let vars = pattern.vars();
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        fn descend(
            relations: &HashMap<String, Relation>,
            pattern: &Pattern,
            vars: &[String],
            index: usize,
            subst: &Substitution,
            seen: &mut HashSet<Binding>,
            out: &mut Vec<Binding>,
        ) {
            let Some(atom) = pattern.atoms().get(index) else {
                if let Some(binding) = subst.project(vars) {
                    if seen.insert(binding.clone()) {
                        out.push(binding);
                    }
                }
                return;
            };
            let Some(relation) = relations.get(atom.predicate()) else {
                return;
            };
            for row in &relation.rows {
                if let Some(extended) = subst.unify_tuple(atom, row) {
                    descend(relations, pattern, vars, index + 1, &extended, seen, out);
                }
            }
        }

        descend(
            &relations,
            pattern,
            &vars,
            0,
            &Substitution::new(),
            &mut seen,
            &mut out,
        );
        Ok(out)
    }
}

impl FactSource for MemoryFactStore {
    fn pull(
        &self,
        pattern: &Pattern,
        returned: &HashSet<Binding>,
    ) -> Result<Option<Binding>, StorageError> {
        // Re-enumerates per pull; acceptable for the reference backend, whose
        // relations are small. The traversal engine streams instead.
        let solutions = self.solutions(pattern)?;
        Ok(solutions.into_iter().find(|b| !returned.contains(b)))
    }
}
