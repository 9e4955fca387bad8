//! The resolution engine.
//!
//! `LatticeEngine` wires a rule configuration and a fact source into a
//! resolution network and serves pull-driven queries over it. A query is a
//! sequence of root requests: each `QueryHandle::next` call issues one pull
//! and waits for the matching response on the query's output channel. When
//! the root reports Exhausted but memo caches grew while a cycle was blocked,
//! the handle transparently starts another pass (reiteration) until the
//! answer set reaches its fixpoint, deduplicating across passes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use tracing::debug;

use crate::binding::Binding;
use crate::error::{ExecutionError, LatticeError, LatticeResult, ProtocolError};
use crate::pattern::Pattern;
use crate::resolution::answer::Answer;
use crate::resolution::message::{Message, QueryEvent, QueryId, Request, UnitId};
use crate::resolution::registry::Registry;
use crate::resolution::runtime::{PassCounters, Runtime};
use crate::resolution::unit::UnitRole;
use crate::rule::RuleSet;
use crate::storage::FactSource;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Resolver worker threads.
    pub workers: usize,
    /// Capacity of each query's output channel.
    pub output_capacity: usize,
    /// How long one pull may wait for a response before the query fails.
    /// A unit that never responds is a protocol violation, not a condition
    /// to retry.
    pub poll_timeout: Duration,
    /// Upper bound on fixpoint passes per query; exceeding it aborts the
    /// query. Guards adversarial rule sets.
    pub reiteration_limit: u32,
    /// Optional cap on answers returned per query.
    pub answer_limit: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            output_capacity: 1024,
            poll_timeout: Duration::from_secs(10),
            reiteration_limit: 64,
            answer_limit: None,
        }
    }
}

/// Statistics of one query evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct QueryStats {
    /// Distinct answers returned so far.
    pub answers: usize,
    /// Fixpoint passes run (1 for non-recursive queries).
    pub passes: u32,
    /// When the query was opened.
    pub started_at: DateTime<Utc>,
    /// When the query finished (exhausted, failed, or closed).
    pub finished_at: Option<DateTime<Utc>>,
}

/// Pull-driven rule-resolution engine over a knowledge graph.
pub struct LatticeEngine {
    registry: Arc<Registry>,
    runtime: Arc<Runtime>,
    config: EngineConfig,
}

impl LatticeEngine {
    /// Creates an engine with the default configuration.
    pub fn new(rules: RuleSet, facts: Arc<dyn FactSource>) -> Self {
        Self::with_config(rules, facts, EngineConfig::default())
    }

    /// Creates an engine with an explicit configuration.
    pub fn with_config(
        rules: RuleSet,
        facts: Arc<dyn FactSource>,
        config: EngineConfig,
    ) -> Self {
        let registry = Arc::new(Registry::new(Arc::new(rules), facts));
        let runtime = Arc::new(Runtime::start(Arc::clone(&registry), config.workers));
        Self {
            registry,
            runtime,
            config,
        }
    }

    /// Opens a pull-driven query over a pattern.
    ///
    /// An atomic query resolves the atom's full grounding (every term
    /// position); a conjunctive query resolves the tuple over its canonical
    /// variable sequence.
    pub fn query(&self, pattern: Pattern) -> LatticeResult<QueryHandle> {
        let role = if pattern.atoms().len() == 1 {
            UnitRole::Concludable
        } else {
            UnitRole::Conjunctive
        };
        let root = self.registry.resolve(role, &pattern)?;
        let query = QueryId::new();
        let rx = self
            .runtime
            .register_query(query, self.config.output_capacity);
        debug!(%query, pattern = %pattern, root = %root, "query opened");
        Ok(QueryHandle {
            registry: Arc::clone(&self.registry),
            runtime: Arc::clone(&self.runtime),
            query,
            root,
            pattern_label: pattern.to_string(),
            root_request: Request::root(root, query),
            rx,
            seen: HashSet::new(),
            baseline: PassCounters::default(),
            poll_timeout: self.config.poll_timeout,
            reiteration_limit: self.config.reiteration_limit,
            answer_limit: self.config.answer_limit,
            finished: false,
            stats: QueryStats {
                answers: 0,
                passes: 1,
                started_at: Utc::now(),
                finished_at: None,
            },
        })
    }

    /// Convenience: exhausts a query and returns its distinct answers.
    pub fn resolve_all(&self, pattern: Pattern) -> LatticeResult<Vec<Arc<Answer>>> {
        self.query(pattern)?.exhaust()
    }
}

/// Caller's handle on one in-flight query.
///
/// Pulls are sequential: each `next` issues one root request and waits for
/// its response. Dropping the handle abandons the query and releases every
/// producer, routing entry, and memo cache it reached.
pub struct QueryHandle {
    registry: Arc<Registry>,
    runtime: Arc<Runtime>,
    query: QueryId,
    root: UnitId,
    pattern_label: String,
    root_request: Request,
    rx: Receiver<QueryEvent>,
    seen: HashSet<Binding>,
    baseline: PassCounters,
    poll_timeout: Duration,
    reiteration_limit: u32,
    answer_limit: Option<usize>,
    finished: bool,
    stats: QueryStats,
}

impl QueryHandle {
    /// The query's identifier.
    #[must_use]
    pub fn id(&self) -> QueryId {
        self.query
    }

    /// Statistics so far.
    #[must_use]
    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }

    /// Pulls the next distinct answer, or `None` once the query is complete.
    ///
    /// Runs as many fixpoint passes as the answer set requires; bindings are
    /// never repeated across passes.
    pub fn next(&mut self) -> LatticeResult<Option<Arc<Answer>>> {
        if self.finished {
            return Ok(None);
        }
        if let Some(limit) = self.answer_limit {
            if self.stats.answers >= limit {
                self.finish();
                return Ok(None);
            }
        }
        loop {
            self.runtime
                .send(self.root, Message::Request(self.root_request.clone()));
            match self.rx.recv_timeout(self.poll_timeout) {
                Ok(QueryEvent::Answer(answer)) => {
                    if self.seen.insert(answer.binding().clone()) {
                        self.stats.answers += 1;
                        return Ok(Some(answer));
                    }
                    // Duplicate from a later pass; pull again.
                }
                Ok(QueryEvent::Exhausted) => {
                    let counters = self.runtime.pass_counters(self.query);
                    let grew = counters.fresh_answers > self.baseline.fresh_answers;
                    let cycled = counters.cycles > self.baseline.cycles;
                    if grew && cycled {
                        self.stats.passes += 1;
                        if self.stats.passes > self.reiteration_limit {
                            self.finish();
                            return Err(LatticeError::Execution(
                                ExecutionError::ReiterationLimitExceeded {
                                    limit: self.reiteration_limit,
                                },
                            ));
                        }
                        debug!(query = %self.query, pass = self.stats.passes, "reiterating");
                        self.baseline = counters;
                        self.root_request = Request::root(self.root, self.query);
                        continue;
                    }
                    self.finish();
                    return Ok(None);
                }
                Ok(QueryEvent::Failed(failure)) => {
                    self.finish();
                    return Err(LatticeError::Execution(ExecutionError::QueryFailed {
                        pattern: failure.pattern,
                        reason: failure.reason,
                    }));
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.finish();
                    return Err(LatticeError::Execution(ExecutionError::Timeout {
                        duration_ms: self.poll_timeout.as_millis().min(u128::from(u64::MAX))
                            as u64,
                    }));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    return Err(LatticeError::Protocol(ProtocolError::Disconnected {
                        path: self.pattern_label.clone(),
                    }));
                }
            }
        }
    }

    /// Pulls until Exhausted (or the answer limit) and returns every distinct
    /// answer.
    pub fn exhaust(mut self) -> LatticeResult<Vec<Arc<Answer>>> {
        let mut answers = Vec::new();
        while let Some(answer) = self.next()? {
            answers.push(answer);
        }
        Ok(answers)
    }

    /// Closes the query and releases all per-query state it reached.
    pub fn close(&mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.stats.finished_at = Some(Utc::now());
        self.runtime.unregister_query(self.query);
        // Units are shared across queries; cleanup is scoped to this query.
        for unit in self.registry.unit_ids() {
            self.runtime
                .send(unit, Message::Cleanup { query: self.query });
        }
        debug!(query = %self.query, answers = self.stats.answers, passes = self.stats.passes, "query closed");
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::ConceptId;
    use crate::pattern::{Atom, Term};
    use crate::rule::Rule;
    use crate::storage::MemoryFactStore;

    fn c(name: &str) -> ConceptId {
        ConceptId::from_name(name)
    }

    fn family_store() -> Arc<MemoryFactStore> {
        let store = MemoryFactStore::new();
        store.insert("parent", vec![c("a"), c("b")]).unwrap();
        store.insert("parent", vec![c("b"), c("c")]).unwrap();
        Arc::new(store)
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
    fn retrieval_query_returns_base_facts() {
        let engine = LatticeEngine::new(RuleSet::empty(), family_store());
        let pattern = Pattern::atom(
            Atom::new("parent", vec![Term::var("x"), Term::var("y")]).unwrap(),
        )
        .unwrap();
        let answers = engine.resolve_all(pattern).unwrap();
        assert_eq!(answers.len(), 2);
        assert!(answers.iter().all(|a| !a.is_inferred()));
    }

    #[test]
    fn answer_limit_caps_the_drain() {
        let engine = LatticeEngine::with_config(
            RuleSet::empty(),
            family_store(),
            EngineConfig {
                answer_limit: Some(1),
                ..EngineConfig::default()
            },
        );
        let pattern = Pattern::atom(
            Atom::new("parent", vec![Term::var("x"), Term::var("y")]).unwrap(),
        )
        .unwrap();
        let answers = engine.resolve_all(pattern).unwrap();
        assert_eq!(answers.len(), 1);
    }

    #[test]
    fn recursive_query_terminates_and_reports_stats() {
        let engine = LatticeEngine::new(ancestor_rules(), family_store());
        let pattern = Pattern::atom(
            Atom::new("ancestor", vec![Term::constant(c("a")), Term::var("y")]).unwrap(),
        )
        .unwrap();
        let mut handle = engine.query(pattern).unwrap();
        let mut bindings = HashSet::new();
        while let Some(answer) = handle.next().unwrap() {
            bindings.insert(answer.binding().clone());
        }
        // Atomic queries resolve the full grounding of the atom.
        assert_eq!(
            bindings,
            HashSet::from([
                Binding::new(vec![c("a"), c("b")]),
                Binding::new(vec![c("a"), c("c")]),
            ])
        );
        let stats = handle.stats();
        assert_eq!(stats.answers, 2);
        assert!(stats.finished_at.is_some());
    }

    #[test]
    fn exhausted_handle_stays_exhausted() {
        let engine = LatticeEngine::new(RuleSet::empty(), family_store());
        let pattern = Pattern::atom(
            Atom::new("parent", vec![Term::var("x"), Term::var("y")]).unwrap(),
        )
        .unwrap();
        let mut handle = engine.query(pattern).unwrap();
        while handle.next().unwrap().is_some() {}
        assert!(handle.next().unwrap().is_none());
        assert!(handle.next().unwrap().is_none());
    }
}
