//! The lazy protocol must be observationally equivalent to the bottom-up
//! fixpoint oracle: exhausting any query yields exactly the oracle's answer
//! set, for recursive and mutually-recursive rule sets alike.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use latticeql::{
    oracle_answers, Atom, Binding, ConceptId, EngineConfig, LatticeEngine, MemoryFactStore,
    Pattern, Rule, RuleSet, Term,
};

fn cid(n: u64) -> ConceptId {
    ConceptId::new(n)
}

fn atom(predicate: &str, terms: Vec<Term>) -> Atom {
    Atom::new(predicate, terms).unwrap()
}

fn single(a: Atom) -> Pattern {
    Pattern::atom(a).unwrap()
}

/// Rule pool: `t/2` is derived from base edges `e/2`, `m/1` from base nodes
/// `n/1`. The flags switch on the recursive variants.
fn build_rules(linear: bool, doubling: bool, reach: bool, mutual: bool) -> RuleSet {
    let mut rules = vec![
        Rule::new(
            "t-edge",
            atom("t", vec![Term::var("x"), Term::var("y")]),
            single(atom("e", vec![Term::var("x"), Term::var("y")])),
        )
        .unwrap(),
        Rule::new(
            "m-node",
            atom("m", vec![Term::var("x")]),
            single(atom("n", vec![Term::var("x")])),
        )
        .unwrap(),
    ];
    if linear {
        // Self-recursive transitive step.
        rules.push(
            Rule::new(
                "t-step",
                atom("t", vec![Term::var("x"), Term::var("y")]),
                Pattern::new(vec![
                    atom("e", vec![Term::var("x"), Term::var("z")]),
                    atom("t", vec![Term::var("z"), Term::var("y")]),
                ])
                .unwrap(),
            )
            .unwrap(),
        );
    }
    if doubling {
        // Both body atoms are inferable: a two-stage join through the same
        // conclusion predicate.
        rules.push(
            Rule::new(
                "t-double",
                atom("t", vec![Term::var("x"), Term::var("y")]),
                Pattern::new(vec![
                    atom("t", vec![Term::var("x"), Term::var("z")]),
                    atom("t", vec![Term::var("z"), Term::var("y")]),
                ])
                .unwrap(),
            )
            .unwrap(),
        );
    }
    if reach {
        rules.push(
            Rule::new(
                "m-reach",
                atom("m", vec![Term::var("x")]),
                Pattern::new(vec![
                    atom("e", vec![Term::var("x"), Term::var("y")]),
                    atom("m", vec![Term::var("y")]),
                ])
                .unwrap(),
            )
            .unwrap(),
        );
    }
    if mutual {
        // Mutually-recursive pair.
        rules.push(
            Rule::new(
                "w-from-m",
                atom("w", vec![Term::var("x")]),
                single(atom("m", vec![Term::var("x")])),
            )
            .unwrap(),
        );
        rules.push(
            Rule::new(
                "m-from-w",
                atom("m", vec![Term::var("x")]),
                single(atom("w", vec![Term::var("x")])),
            )
            .unwrap(),
        );
    }
    RuleSet::new(rules).unwrap()
}

fn store_with(edges: &[(u64, u64)], nodes: &[u64]) -> MemoryFactStore {
    let store = MemoryFactStore::new();
    for (a, b) in edges {
        store.insert("e", vec![cid(*a), cid(*b)]).unwrap();
    }
    for n in nodes {
        store.insert("n", vec![cid(*n)]).unwrap();
    }
    store
}

fn exhaust_set(engine: &LatticeEngine, pattern: Pattern) -> HashSet<Binding> {
    engine
        .resolve_all(pattern)
        .unwrap()
        .iter()
        .map(|a| a.binding().clone())
        .collect()
}

fn test_config() -> EngineConfig {
    EngineConfig {
        poll_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn lazy_protocol_matches_bottom_up_oracle(
        edges in proptest::collection::vec((0u64..4, 0u64..4), 0..12),
        nodes in proptest::collection::vec(0u64..4, 0..5),
        linear in any::<bool>(),
        doubling in any::<bool>(),
        reach in any::<bool>(),
        mutual in any::<bool>(),
    ) {
        let rules = build_rules(linear, doubling, reach, mutual);
        let store = store_with(&edges, &nodes);

        let queries = [
            single(atom("t", vec![Term::var("x"), Term::var("y")])),
            single(atom("m", vec![Term::var("x")])),
        ];

        let engine = LatticeEngine::with_config(
            rules.clone(),
            Arc::new(store_with(&edges, &nodes)),
            test_config(),
        );
        for query in queries {
            let expected: HashSet<Binding> =
                oracle_answers(&rules, &store, &query).unwrap().into_iter().collect();
            let got = exhaust_set(&engine, query.clone());
            prop_assert_eq!(got, expected, "query {}", query);
        }
    }
}

#[test]
fn doubling_rule_alone_computes_the_closure() {
    // t(x,y) :- e(x,y) | t(x,z), t(z,y) over the chain 0 -> 1 -> 2 -> 3.
    let edges = [(0, 1), (1, 2), (2, 3)];
    let rules = build_rules(false, true, false, false);
    let store = store_with(&edges, &[]);

    let query = single(atom("t", vec![Term::var("x"), Term::var("y")]));
    let expected: HashSet<Binding> = oracle_answers(&rules, &store, &query)
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(expected.len(), 6);

    let engine =
        LatticeEngine::with_config(rules, Arc::new(store_with(&edges, &[])), test_config());
    assert_eq!(exhaust_set(&engine, query), expected);
}

#[test]
fn dense_cyclic_graph_matches_the_oracle() {
    // Fully cyclic component: every node reaches every node.
    let edges = [(0, 1), (1, 2), (2, 0)];
    let rules = build_rules(true, false, false, false);
    let store = store_with(&edges, &[]);

    let query = single(atom("t", vec![Term::var("x"), Term::var("y")]));
    let expected: HashSet<Binding> = oracle_answers(&rules, &store, &query)
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(expected.len(), 9);

    let engine =
        LatticeEngine::with_config(rules, Arc::new(store_with(&edges, &[])), test_config());
    assert_eq!(exhaust_set(&engine, query), expected);
}

#[test]
fn bound_queries_match_the_oracle_projection() {
    let edges = [(0, 1), (1, 2), (1, 3)];
    let rules = build_rules(true, false, false, false);
    let store = store_with(&edges, &[]);

    // Oracle answers for t(#0, ?y) are 1-tuples over ?y; the engine resolves
    // the atom's full grounding, so compare on the ?y position.
    let bound = single(atom("t", vec![Term::constant(cid(0)), Term::var("y")]));
    let expected: HashSet<ConceptId> = oracle_answers(&rules, &store, &bound)
        .unwrap()
        .into_iter()
        .map(|b| b.concepts()[0])
        .collect();
    assert_eq!(expected.len(), 3);

    let engine =
        LatticeEngine::with_config(rules, Arc::new(store_with(&edges, &[])), test_config());
    let got: HashSet<ConceptId> = exhaust_set(&engine, bound)
        .into_iter()
        .map(|b| b.concepts()[1])
        .collect();
    assert_eq!(got, expected);
}
