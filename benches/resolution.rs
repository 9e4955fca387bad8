use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use latticeql::{
    Atom, ConceptId, LatticeEngine, MemoryFactStore, Pattern, Rule, RuleSet, Term,
};

const CHAIN: u64 = 32;

fn ancestor_rules() -> RuleSet {
    let base = Rule::new(
        "anc-base",
        Atom::new("ancestor", vec![Term::var("x"), Term::var("y")]).unwrap(),
        Pattern::atom(Atom::new("parent", vec![Term::var("x"), Term::var("y")]).unwrap()).unwrap(),
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

fn chain_store(len: u64) -> Arc<MemoryFactStore> {
    let store = MemoryFactStore::new();
    for i in 0..len {
        store
            .insert("parent", vec![ConceptId::new(i), ConceptId::new(i + 1)])
            .unwrap();
    }
    Arc::new(store)
}

fn bench_transitive_closure(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolution");
    // Closure of a chain of length n has n*(n+1)/2 answers.
    group.throughput(Throughput::Elements(CHAIN * (CHAIN + 1) / 2));
    group.sample_size(10);
    group.bench_function("transitive_closure_chain", |b| {
        b.iter(|| {
            // Fresh engine per iteration: resolution state is per-request,
            // but unit reuse across iterations would skew wiring costs.
            let engine = LatticeEngine::new(ancestor_rules(), chain_store(CHAIN));
            let query = Pattern::atom(
                Atom::new("ancestor", vec![Term::var("x"), Term::var("y")]).unwrap(),
            )
            .unwrap();
            let answers = engine.resolve_all(query).unwrap();
            assert_eq!(answers.len(), (CHAIN * (CHAIN + 1) / 2) as usize);
        });
    });
    group.finish();
}

fn bench_bound_ancestor_probe(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolution");
    group.sample_size(10);
    group.bench_function("bound_ancestor_probe", |b| {
        let engine = LatticeEngine::new(ancestor_rules(), chain_store(CHAIN));
        b.iter(|| {
            let query = Pattern::atom(
                Atom::new(
                    "ancestor",
                    vec![Term::constant(ConceptId::new(0)), Term::var("y")],
                )
                .unwrap(),
            )
            .unwrap();
            let answers = engine.resolve_all(query).unwrap();
            assert_eq!(answers.len(), CHAIN as usize);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_transitive_closure, bench_bound_ancestor_probe);
criterion_main!(benches);
