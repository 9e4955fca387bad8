//! Inference rules.
//!
//! A rule derives its head atom from a conjunctive body pattern. The rule set
//! is caller-supplied configuration: it decides which patterns are inferable
//! and therefore how the resolution network is wired.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::binding::Substitution;
use crate::error::ValidationError;
use crate::pattern::{Atom, Pattern, Term};

/// A single inference rule: `body => head`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    name: String,
    head: Atom,
    body: Pattern,
}

impl Rule {
    /// Constructs a rule with validation.
    ///
    /// Enforces range restriction: every head variable must occur in the body,
    /// otherwise derived tuples would be unbound.
    pub fn new(
        name: impl Into<String>,
        head: Atom,
        body: Pattern,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyRuleName);
        }
        let body_vars = body.vars();
        for var in head.var_occurrences() {
            if !body_vars.iter().any(|v| v == var) {
                return Err(ValidationError::UnboundHeadVariable {
                    rule: name,
                    variable: var.to_string(),
                });
            }
        }
        Ok(Self { name, head, body })
    }

    /// The rule's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The derived atom.
    #[must_use]
    pub fn head(&self) -> &Atom {
        &self.head
    }

    /// The body pattern.
    #[must_use]
    pub fn body(&self) -> &Pattern {
        &self.body
    }

    /// Matches the head against a (possibly partially bound) pattern atom.
    ///
    /// Returns the substitution binding head variables to the pattern's
    /// constants when the rule can produce answers for that atom, `None` when
    /// a constant clash makes it inapplicable. Pattern variables stay free.
    #[must_use]
    pub fn match_head(&self, atom: &Atom) -> Option<Substitution> {
        if self.head.predicate() != atom.predicate() || self.head.arity() != atom.arity() {
            return None;
        }
        let mut theta = Substitution::new();
        for (head_term, pattern_term) in self.head.terms().iter().zip(atom.terms().iter()) {
            match (head_term, pattern_term) {
                (Term::Const(h), Term::Const(p)) => {
                    if h != p {
                        return None;
                    }
                }
                (Term::Var(name), Term::Const(p)) => {
                    if theta.bind(name.clone(), *p).is_err() {
                        return None;
                    }
                }
                // The pattern leaves this position open; the rule may produce
                // any value (or its constant) there.
                (_, Term::Var(_)) => {}
            }
        }
        Some(theta)
    }
}

/// The complete rule configuration for an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// An empty rule set (pure retrieval engine).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Constructs a rule set, checking arity consistency across all rules.
    pub fn new(rules: Vec<Rule>) -> Result<Self, ValidationError> {
        let mut arities: HashMap<&str, usize> = HashMap::new();
        for rule in &rules {
            let atoms = std::iter::once(rule.head()).chain(rule.body().atoms().iter());
            for atom in atoms {
                let expected = *arities.entry(atom.predicate()).or_insert_with(|| atom.arity());
                if expected != atom.arity() {
                    return Err(ValidationError::ArityMismatch {
                        predicate: atom.predicate().to_string(),
                        expected,
                        actual: atom.arity(),
                    });
                }
            }
        }
        Ok(Self { rules })
    }

    /// All rules.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rules whose head predicate matches.
    pub fn rules_for<'a>(&'a self, predicate: &'a str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules
            .iter()
            .filter(move |r| r.head().predicate() == predicate)
    }

    /// True when some rule can derive the predicate.
    #[must_use]
    pub fn is_inferable(&self, predicate: &str) -> bool {
        self.rules_for(predicate).next().is_some()
    }
}
