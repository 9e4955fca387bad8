//! Bottom-up fixpoint oracle.
//!
//! The reference semantics the lazy protocol must match: materialize every
//! rule's body over the current fact set, record every conclusion, and
//! reiterate until no rule produces a tuple that is not already recorded.
//! Not production machinery; the tests hold the pull-driven engine to
//! set-equality with this evaluator.

use crate::binding::{Binding, Substitution};
use crate::error::{ExecutionError, LatticeError, LatticeResult};
use crate::pattern::Pattern;
use crate::rule::RuleSet;
use crate::storage::MemoryFactStore;

/// Saturates `base` under `rules`: returns a store holding the base facts
/// plus every derivable tuple (the least fixpoint).
pub fn saturate(rules: &RuleSet, base: &MemoryFactStore) -> LatticeResult<MemoryFactStore> {
    let store = MemoryFactStore::new();
    for (predicate, tuple) in base
        .facts()
        .map_err(|e| LatticeError::internal(e.to_string()))?
    {
        store
            .insert(predicate, tuple)
            .map_err(|e| LatticeError::internal(e.to_string()))?;
    }

    loop {
        let mut changed = false;
        for rule in rules.rules() {
            let body_vars = rule.body().vars();
            let solutions = store.solutions(rule.body()).map_err(|e| {
                LatticeError::Execution(ExecutionError::FactSource {
                    pattern: rule.body().to_string(),
                    reason: e.to_string(),
                })
            })?;
            for solution in solutions {
                let Some(subst) = Substitution::from_vars(&body_vars, &solution) else {
                    continue;
                };
                // Range restriction guarantees the head grounds.
                let Some(tuple) = rule.head().ground(&subst) else {
                    continue;
                };
                let inserted = store
                    .insert(rule.head().predicate(), tuple)
                    .map_err(|e| LatticeError::internal(e.to_string()))?;
                changed = changed || inserted;
            }
        }
        if !changed {
            return Ok(store);
        }
    }
}

/// Evaluates `pattern` over the fixpoint of `rules` and `base`.
///
/// Returns the complete deduplicated answer set, in the deterministic order
/// of the saturated store's joins.
pub fn oracle_answers(
    rules: &RuleSet,
    base: &MemoryFactStore,
    pattern: &Pattern,
) -> LatticeResult<Vec<Binding>> {
    let saturated = saturate(rules, base)?;
    saturated.solutions(pattern).map_err(|e| {
        LatticeError::Execution(ExecutionError::FactSource {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::concept::ConceptId;
    use crate::pattern::{Atom, Term};
    use crate::rule::Rule;

    fn c(name: &str) -> ConceptId {
        ConceptId::from_name(name)
    }

    fn ancestor_rules() -> RuleSet {
        let base = Rule::new(
            "anc-base",
            Atom::new("ancestor", vec![Term::var("x"), Term::var("y")]).unwrap(),
            Pattern::atom(Atom::new("parent", vec![Term::var("x"), Term::var("y")]).unwrap())
                .unwrap(),
        )
        .unwrap();
        let step = Rule::new(
            "anc-step",
            Atom::new("ancestor", vec![Term::var("x"), Term::var("y")]).unwrap(),
            Pattern::new(vec![
                Atom::new("parent", vec![Term::var("x"), Term::var("z")]).unwrap(),
                Atom::new("ancestor", vec![Term::var("z"), Term::var("y")]).unwrap(),
            ])
            .unwrap(),
        )
        .unwrap();
        RuleSet::new(vec![base, step]).unwrap()
    }

    #[test]
    fn saturate_computes_transitive_closure() {
        let store = MemoryFactStore::new();
        store.insert("parent", vec![c("a"), c("b")]).unwrap();
        store.insert("parent", vec![c("b"), c("c")]).unwrap();
        store.insert("parent", vec![c("c"), c("d")]).unwrap();

        let saturated = saturate(&ancestor_rules(), &store).unwrap();
        // 3 direct + 2 two-step + 1 three-step.
        assert_eq!(saturated.count("ancestor").unwrap(), 6);
        // The base store is untouched.
        assert_eq!(store.count("ancestor").unwrap(), 0);
    }

    #[test]
    fn saturate_terminates_on_cyclic_facts() {
        let store = MemoryFactStore::new();
        store.insert("parent", vec![c("a"), c("b")]).unwrap();
        store.insert("parent", vec![c("b"), c("a")]).unwrap();

        let saturated = saturate(&ancestor_rules(), &store).unwrap();
        // Every ordered pair over {a, b} is an ancestor in the cycle.
        assert_eq!(saturated.count("ancestor").unwrap(), 4);
    }

    #[test]
    fn oracle_answers_projects_the_query_pattern() {
        let store = MemoryFactStore::new();
        store.insert("parent", vec![c("a"), c("b")]).unwrap();
        store.insert("parent", vec![c("b"), c("d")]).unwrap();

        let query = Pattern::atom(
            Atom::new("ancestor", vec![Term::constant(c("a")), Term::var("y")]).unwrap(),
        )
        .unwrap();
        let answers: HashSet<Binding> = oracle_answers(&ancestor_rules(), &store, &query)
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(
            answers,
            HashSet::from([
                Binding::new(vec![c("b")]),
                Binding::new(vec![c("d")]),
            ])
        );
    }
}
