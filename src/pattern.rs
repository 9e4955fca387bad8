//! Query patterns.
//!
//! A pattern is a conjunction of atoms; an atom applies a predicate to terms,
//! each term being a variable or a concept constant. Patterns are immutable
//! value objects: binding a pattern produces a new pattern. Their display form
//! is the human-readable label carried by answers and proofs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::binding::Substitution;
use crate::concept::ConceptId;
use crate::error::ValidationError;

/// A term in an atom: a named variable or a concept constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    /// A named variable, bound during resolution.
    Var(String),
    /// A concrete concept.
    Const(ConceptId),
}

impl Term {
    /// Shorthand for a variable term.
    #[must_use]
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    /// Shorthand for a constant term.
    #[must_use]
    pub const fn constant(id: ConceptId) -> Self {
        Self::Const(id)
    }

    /// Returns the variable name, if this term is a variable.
    #[must_use]
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Self::Var(name) => Some(name),
            Self::Const(_) => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(name) => write!(f, "?{name}"),
            Self::Const(id) => write!(f, "{id}"),
        }
    }
}

/// A predicate applied to terms, e.g. `parent(?x, ?y)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Atom {
    predicate: String,
    terms: Vec<Term>,
}

impl Atom {
    /// Constructs an atom, validating predicate and terms.
    pub fn new(predicate: impl Into<String>, terms: Vec<Term>) -> Result<Self, ValidationError> {
        let predicate = predicate.into();
        if predicate.trim().is_empty() {
            return Err(ValidationError::EmptyPredicate);
        }
        if terms.is_empty() {
            return Err(ValidationError::EmptyAtom { predicate });
        }
        Ok(Self { predicate, terms })
    }

    /// The atom's predicate name.
    #[must_use]
    pub fn predicate(&self) -> &str {
        &self.predicate
    }

    /// The atom's terms in positional order.
    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Number of term positions.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.terms.len()
    }

    /// True when no term is a variable.
    #[must_use]
    pub fn is_ground(&self) -> bool {
        self.terms.iter().all(|t| matches!(t, Term::Const(_)))
    }

    /// Variable names in positional order, repeats included.
    pub fn var_occurrences(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().filter_map(Term::as_var)
    }

    /// Returns a copy with every variable bound in `subst` replaced by its
    /// concept. Unbound variables are left in place.
    #[must_use]
    pub fn bound(&self, subst: &Substitution) -> Self {
        let terms = self
            .terms
            .iter()
            .map(|t| match t {
                Term::Var(name) => match subst.get(name) {
                    Some(id) => Term::Const(id),
                    None => t.clone(),
                },
                Term::Const(_) => t.clone(),
            })
            .collect();
        Self {
            predicate: self.predicate.clone(),
            terms,
        }
    }

    /// Grounds the atom into a full-position tuple using `subst`.
    ///
    /// Returns `None` if any variable is unbound.
    #[must_use]
    pub fn ground(&self, subst: &Substitution) -> Option<Vec<ConceptId>> {
        self.terms
            .iter()
            .map(|t| match t {
                Term::Var(name) => subst.get(name),
                Term::Const(id) => Some(*id),
            })
            .collect()
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{term}")?;
        }
        write!(f, ")")
    }
}

/// A conjunction of atoms: the unit of querying and of rule bodies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pattern {
    atoms: Vec<Atom>,
}

impl Pattern {
    /// Constructs a pattern from a non-empty conjunction of atoms.
    pub fn new(atoms: Vec<Atom>) -> Result<Self, ValidationError> {
        if atoms.is_empty() {
            return Err(ValidationError::EmptyPattern);
        }
        Ok(Self { atoms })
    }

    /// Single-atom convenience constructor.
    pub fn atom(atom: Atom) -> Result<Self, ValidationError> {
        Self::new(vec![atom])
    }

    /// The pattern's atoms.
    #[must_use]
    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    /// Distinct variable names in first-occurrence order.
    ///
    /// This is the canonical variable order: answer bindings for a pattern are
    /// tuples over exactly this sequence.
    #[must_use]
    pub fn vars(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for atom in &self.atoms {
            for name in atom.var_occurrences() {
                if !seen.iter().any(|s: &String| s == name) {
                    seen.push(name.to_string());
                }
            }
        }
        seen
    }

    /// Returns a copy with `subst` applied to every atom.
    #[must_use]
    pub fn bound(&self, subst: &Substitution) -> Self {
        Self {
            atoms: self.atoms.iter().map(|a| a.bound(subst)).collect(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, atom) in self.atoms.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{atom}")?;
        }
        Ok(())
    }
}
