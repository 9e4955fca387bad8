//! Bindings and substitutions.
//!
//! A `Binding` is the ordered tuple of concepts an answer assigns to a
//! pattern's canonical variable sequence (or term positions, for conclusion
//! answers). A `Substitution` is the named view used while joining: a map from
//! variable names to concepts.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::concept::ConceptId;
use crate::pattern::{Atom, Term};

/// Ordered tuple of concepts satisfying a pattern's variables.
///
/// Deduplication throughout the engine is over bindings, so equality and
/// hashing are structural over the tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Binding(Vec<ConceptId>);

impl Binding {
    /// Wraps a tuple of concepts.
    #[must_use]
    pub fn new(concepts: Vec<ConceptId>) -> Self {
        Self(concepts)
    }

    /// The empty binding (a ground pattern's single solution).
    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// The bound concepts in order.
    #[must_use]
    pub fn concepts(&self) -> &[ConceptId] {
        &self.0
    }

    /// Number of bound positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty tuple.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}")?;
        }
        write!(f, ")")
    }
}

/// Error returned when a variable would be bound to two different concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingConflict;

/// Map from variable names to concepts, built up while joining.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitution {
    entries: BTreeMap<String, ConceptId>,
}

impl Substitution {
    /// The empty substitution.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ConceptId> {
        self.entries.get(name).copied()
    }

    /// Binds `name` to `id`.
    ///
    /// Re-binding to the same concept is a no-op; binding to a different
    /// concept is a conflict (the join candidate does not unify).
    pub fn bind(&mut self, name: impl Into<String>, id: ConceptId) -> Result<(), BindingConflict> {
        let name = name.into();
        match self.entries.get(&name) {
            Some(existing) if *existing != id => Err(BindingConflict),
            Some(_) => Ok(()),
            None => {
                self.entries.insert(name, id);
                Ok(())
            }
        }
    }

    /// Number of bound variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no variable is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Projects the named variables, in order, into a binding tuple.
    ///
    /// Returns `None` if any variable is unbound.
    #[must_use]
    pub fn project(&self, vars: &[String]) -> Option<Binding> {
        vars.iter()
            .map(|v| self.get(v))
            .collect::<Option<Vec<_>>>()
            .map(Binding::new)
    }

    /// Returns this substitution extended by matching `atom` against a
    /// full-position `tuple`, or `None` when they do not unify (a constant
    /// mismatch or a variable conflict).
    #[must_use]
    pub fn unify_tuple(&self, atom: &Atom, tuple: &[ConceptId]) -> Option<Self> {
        if atom.arity() != tuple.len() {
            return None;
        }
        let mut extended = self.clone();
        for (term, id) in atom.terms().iter().zip(tuple.iter()) {
            match term {
                Term::Var(name) => {
                    if extended.bind(name.clone(), *id).is_err() {
                        return None;
                    }
                }
                Term::Const(expected) => {
                    if expected != id {
                        return None;
                    }
                }
            }
        }
        Some(extended)
    }

    /// Builds a substitution by zipping a variable sequence with a binding.
    ///
    /// Returns `None` on length mismatch or conflicting repeats.
    #[must_use]
    pub fn from_vars(vars: &[String], binding: &Binding) -> Option<Self> {
        if vars.len() != binding.len() {
            return None;
        }
        let mut subst = Self::new();
        for (name, id) in vars.iter().zip(binding.concepts().iter()) {
            if subst.bind(name.clone(), *id).is_err() {
                return None;
            }
        }
        Some(subst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Atom;

    fn c(n: u64) -> ConceptId {
        ConceptId::new(n)
    }

    #[test]
    fn bind_rejects_conflicts_and_accepts_repeats() {
        let mut s = Substitution::new();
        s.bind("x", c(1)).unwrap();
        assert!(s.bind("x", c(1)).is_ok());
        assert!(s.bind("x", c(2)).is_err());
    }

    #[test]
    fn unify_tuple_checks_constants_and_repeated_vars() {
        let atom = Atom::new("edge", vec![Term::var("x"), Term::var("x")]).unwrap();
        let s = Substitution::new();
        assert!(s.unify_tuple(&atom, &[c(1), c(1)]).is_some());
        assert!(s.unify_tuple(&atom, &[c(1), c(2)]).is_none());

        let atom = Atom::new("edge", vec![Term::constant(c(7)), Term::var("y")]).unwrap();
        assert!(s.unify_tuple(&atom, &[c(7), c(2)]).is_some());
        assert!(s.unify_tuple(&atom, &[c(8), c(2)]).is_none());
    }

    #[test]
    fn project_requires_all_vars() {
        let mut s = Substitution::new();
        s.bind("x", c(1)).unwrap();
        assert!(s.project(&["x".to_string(), "y".to_string()]).is_none());
        s.bind("y", c(2)).unwrap();
        assert_eq!(
            s.project(&["y".to_string(), "x".to_string()]).unwrap(),
            Binding::new(vec![c(2), c(1)])
        );
    }

    #[test]
    fn binding_display() {
        let b = Binding::new(vec![c(1), c(2)]);
        assert_eq!(b.to_string(), "(#1, #2)");
    }
}
