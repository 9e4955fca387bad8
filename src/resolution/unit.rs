//! Resolution units.
//!
//! A unit is the state machine answering Requests for one pattern identity.
//! Its kind is fixed by pattern shape at construction time:
//!
//! - `Retrieval` — a pure-base pattern; answers come from one fact-source
//!   stream and carry empty derivations.
//! - `Conjunction` — a rule body or root query with inferable atoms; base
//!   atoms are grounded through one joint fact-source stream and each base
//!   solution is extended through the inferable atoms left-to-right by
//!   pulling their conclusion units.
//! - `Conclusion` — an atomic pattern some rule can derive; the pattern's own
//!   fact stream is drained first, then each applicable rule's body is one
//!   alternative, pulled fair round-robin with cross-alternative
//!   deduplication. Every emitted answer is also appended to a per-query memo
//!   cache, which serves cyclic re-entrant requests instead of recursing.
//!
//! Units are only ever touched through their mailbox; all state here is owned
//! exclusively by the unit and never observed mid-message.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::binding::{Binding, Substitution};
use crate::error::LatticeResult;
use crate::pattern::{Atom, Pattern};
use crate::resolution::answer::{Answer, Derivation};
use crate::resolution::message::{
    Envelope, Message, QueryEvent, QueryFailure, QueryId, Request, RequestId, Response, UnitId,
};
use crate::resolution::producer::AnswerProducer;
use crate::storage::FactSource;

/// Role a pattern plays in the resolution network.
///
/// The same syntactic atom can exist both as a conjunctive (root) pattern and
/// as a concludable dependency; the two are distinct unit identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitRole {
    /// Resolved as a conjunction (root queries, rule bodies).
    Conjunctive,
    /// Resolved as a rule conclusion (inferable atoms inside conjunctions).
    Concludable,
}

/// Services a unit needs while handling one message.
///
/// Implemented by the runtime; keeps units decoupled from the registry and
/// the per-query bookkeeping.
pub trait UnitContext {
    /// Resolves (get-or-create) the unit for a pattern in the given role.
    fn resolve(&self, role: UnitRole, pattern: &Pattern) -> LatticeResult<UnitId>;

    /// Records that a new binding entered a memo cache for `query`.
    fn note_fresh_answer(&self, query: QueryId);

    /// Records that a cyclic request was served from cache for `query`.
    fn note_cycle(&self, query: QueryId);
}

/// Outbound effect of handling one message.
#[derive(Debug)]
pub enum Outbound {
    /// Deliver a message to another unit.
    Unit(Envelope),
    /// Surface an event on a query's output channel.
    Query {
        /// The owning query.
        query: QueryId,
        /// The event.
        event: QueryEvent,
    },
}

/// One applicable rule at a conclusion unit: the rule's body bound by the
/// head match, plus what is needed to translate body answers back into
/// conclusion tuples.
#[derive(Debug, Clone)]
pub struct RuleAlternative {
    /// Rule name, for logs.
    pub rule_name: String,
    /// The rule body with the conclusion's constants pushed in.
    pub body_pattern: Pattern,
    /// Canonical variable order of `body_pattern`.
    pub body_vars: Vec<String>,
    /// The rule head with the conclusion's constants pushed in.
    pub head: Atom,
}

/// A wired rule alternative: the body unit plus its translation data.
#[derive(Debug)]
pub struct ConclusionDep {
    unit: UnitId,
    alternative: RuleAlternative,
}

/// Kind-specific configuration of a unit.
#[derive(Debug)]
pub enum UnitKind {
    /// Pure-base pattern; leaf.
    Retrieval {
        /// The base pattern pulled from the fact source.
        pattern: Pattern,
    },
    /// Rule body or root query with inferable atoms.
    Conjunction {
        /// Base (rule-free) atoms, grounded as one joint stream.
        base: Option<Pattern>,
        /// Inferable atoms in conjunction order.
        inferable: Vec<Atom>,
        /// Canonical variable order of the whole pattern.
        out_vars: Vec<String>,
    },
    /// Atomic pattern with applicable rules; disjunctive.
    Conclusion {
        /// The (possibly partially bound) conclusion atom.
        atom: Atom,
        /// Applicable rules, precomputed by the registry.
        alternatives: Vec<RuleAlternative>,
        /// Body units, wired lazily on first request.
        deps: Vec<ConclusionDep>,
    },
}

type StreamKey = (UnitId, RequestId);

fn key_of(request: &Request) -> StreamKey {
    (request.receiver(), request.correlation())
}

/// Join progress of one downstream stream inside a conjunction.
#[derive(Debug, Clone)]
struct JoinStage {
    subst: Substitution,
    atom_index: usize,
    derivation: Derivation,
}

/// Per-upstream-request state.
#[derive(Debug)]
struct ProducerSlot {
    upstream: Request,
    producer: AnswerProducer,
    /// Conclusion: serving a cyclic request from the memo cache.
    cyclic: bool,
    /// Conclusion cyclic requests: next cache row to inspect.
    cache_pos: usize,
    /// Conclusion fresh requests: fact-stream dedup in variable space.
    fact_returned: HashSet<Binding>,
    /// Conclusion: downstream stream -> alternative index.
    alt_by_stream: HashMap<StreamKey, usize>,
    /// Conjunction: base-stream dedup.
    base_returned: HashSet<Binding>,
    /// Conjunction without base atoms: the single empty base solution.
    base_seeded: bool,
    base_exhausted: bool,
    /// Conjunction: join progress per downstream stream.
    stages: HashMap<StreamKey, JoinStage>,
}

impl ProducerSlot {
    fn new(upstream: Request, cyclic: bool) -> Self {
        Self {
            upstream,
            producer: AnswerProducer::new(),
            cyclic,
            cache_pos: 0,
            fact_returned: HashSet::new(),
            alt_by_stream: HashMap::new(),
            base_returned: HashSet::new(),
            base_seeded: false,
            base_exhausted: false,
            stages: HashMap::new(),
        }
    }
}

/// Per-query memo cache of a conclusion unit.
#[derive(Debug, Default)]
struct MemoCache {
    rows: Vec<Arc<Answer>>,
    seen: HashSet<Binding>,
}

/// What the per-kind decide step wants to happen next.
enum Step {
    /// Emit this response upstream.
    Emit(Response),
    /// Dispatch this downstream request (already registered and routed).
    Send(Request),
    /// Nothing can be decided until an in-flight response arrives.
    Wait,
    /// State changed (stream registered, fact stream exhausted); re-decide.
    Continue,
}

/// The per-pattern state machine.
pub struct ResolutionUnit {
    id: UnitId,
    description: Arc<str>,
    kind: UnitKind,
    facts: Arc<dyn FactSource>,
    initialized: bool,
    /// Downstream stream -> the upstream request it serves. Written before
    /// the first dispatch of a stream, removed when the stream exhausts or on
    /// per-query cleanup.
    routing: HashMap<StreamKey, Request>,
    producers: HashMap<RequestId, ProducerSlot>,
    /// Conclusion only: per-query memo caches.
    caches: HashMap<QueryId, MemoCache>,
}

impl ResolutionUnit {
    /// Constructs a unit. Dependencies are wired lazily on first request.
    #[must_use]
    pub fn new(
        id: UnitId,
        description: Arc<str>,
        kind: UnitKind,
        facts: Arc<dyn FactSource>,
    ) -> Self {
        Self {
            id,
            description,
            kind,
            facts,
            initialized: false,
            routing: HashMap::new(),
            producers: HashMap::new(),
            caches: HashMap::new(),
        }
    }

    /// The unit's handle.
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// The unit's pattern label.
    #[must_use]
    pub fn description(&self) -> &Arc<str> {
        &self.description
    }

    /// Handles one inbound message, returning the messages and events to
    /// dispatch. Never called concurrently for the same unit.
    pub fn handle(&mut self, message: Message, ctx: &dyn UnitContext) -> Vec<Outbound> {
        match message {
            Message::Request(request) => self.on_request(request, ctx),
            Message::Response(Response::Answer { request, answer }) => {
                self.on_downstream_answer(&request, answer, ctx)
            }
            Message::Response(Response::Exhausted { request }) => {
                self.on_downstream_exhausted(&request, ctx)
            }
            Message::Response(Response::Failed { request, failure }) => {
                self.on_downstream_failed(&request, failure)
            }
            Message::Cleanup { query } => {
                self.cleanup(query);
                Vec::new()
            }
        }
    }

    fn on_request(&mut self, request: Request, ctx: &dyn UnitContext) -> Vec<Outbound> {
        if !self.initialized {
            if let Err(err) = self.initialize(ctx) {
                error!(unit = %self.id, pattern = %self.description, %err, "initialization failed");
                return vec![route_response(Response::Failed {
                    failure: QueryFailure {
                        pattern: self.description.to_string(),
                        reason: err.to_string(),
                    },
                    request,
                })];
            }
            self.initialized = true;
        }

        let correlation = request.correlation();
        if !self.producers.contains_key(&correlation) {
            match self.create_slot(request.clone(), ctx) {
                Ok(slot) => {
                    self.producers.insert(correlation, slot);
                }
                Err(failure) => {
                    return vec![route_response(Response::Failed { request, failure })];
                }
            }
        }

        let slot = self
            .producers
            .get_mut(&correlation)
            .expect("slot just ensured");
        slot.producer.push_pull();
        self.advance(correlation, ctx)
    }

    /// Lazily creates the Answer Producer state for a new upstream request.
    fn create_slot(
        &mut self,
        request: Request,
        ctx: &dyn UnitContext,
    ) -> Result<ProducerSlot, QueryFailure> {
        let cyclic = matches!(self.kind, UnitKind::Conclusion { .. }) && request.on_path(self.id);
        let mut slot = ProducerSlot::new(request.clone(), cyclic);
        if cyclic {
            // A blocked cycle this pass; the engine may schedule another pass
            // if caches also grew.
            ctx.note_cycle(request.query());
            debug!(unit = %self.id, pattern = %self.description, "cyclic request served from cache");
            return Ok(slot);
        }
        if let UnitKind::Conclusion { deps, .. } = &self.kind {
            for (index, dep) in deps.iter().enumerate() {
                let downstream = Request::downstream(dep.unit, self.id, &request);
                slot.alt_by_stream.insert(key_of(&downstream), index);
                slot.producer
                    .add_downstream(downstream, &self.description)
                    .map_err(|err| {
                        error!(unit = %self.id, %err, "duplicate alternative registration");
                        QueryFailure {
                            pattern: self.description.to_string(),
                            reason: err.to_string(),
                        }
                    })?;
            }
        }
        Ok(slot)
    }

    fn on_downstream_answer(
        &mut self,
        downstream: &Request,
        answer: Arc<Answer>,
        ctx: &dyn UnitContext,
    ) -> Vec<Outbound> {
        let Some((upstream, correlation)) = self.upstream_of(downstream) else {
            return self.unroutable(downstream);
        };
        let Some(slot) = self.producers.get_mut(&correlation) else {
            return self.unroutable(downstream);
        };
        slot.producer.mark_idle(downstream);

        let mut out = Vec::new();
        match self.decide_on_answer(correlation, &upstream, downstream, answer, ctx) {
            Ok(Some(response)) => out.push(route_response(response)),
            Ok(None) => {}
            Err(failure) => {
                return vec![route_response(Response::Failed {
                    request: upstream,
                    failure,
                })];
            }
        }
        out.extend(self.advance(correlation, ctx));
        out
    }

    /// Kind-specific handling of a downstream answer. `Ok(Some(_))` is the
    /// response to emit; `Ok(None)` means the chain continues (a stage was
    /// spawned, or the answer was a duplicate).
    fn decide_on_answer(
        &mut self,
        correlation: RequestId,
        upstream: &Request,
        downstream: &Request,
        answer: Arc<Answer>,
        ctx: &dyn UnitContext,
    ) -> Result<Option<Response>, QueryFailure> {
        let key = key_of(downstream);
        match &self.kind {
            UnitKind::Retrieval { .. } => {
                warn!(unit = %self.id, "retrieval unit received a downstream answer");
                Ok(None)
            }
            UnitKind::Conclusion { atom, deps, .. } => {
                let slot = self.producers.get_mut(&correlation).expect("slot present");
                let Some(&alt_index) = slot.alt_by_stream.get(&key) else {
                    warn!(unit = %self.id, "answer from unknown alternative stream");
                    return Ok(None);
                };
                let alternative = &deps[alt_index].alternative;
                let Some(binding) = conclusion_tuple(atom, alternative, &answer) else {
                    debug!(unit = %self.id, "rule answer does not ground this conclusion");
                    return Ok(None);
                };
                let derivation = Derivation::empty()
                    .with(downstream.receiver(), answer)
                    .map_err(|err| QueryFailure {
                        pattern: self.description.to_string(),
                        reason: err.to_string(),
                    })?;
                if !slot.producer.record_returned(binding.clone()) {
                    // Reachable two ways: report once per upstream request.
                    return Ok(None);
                }
                let produced = Arc::new(Answer::new(
                    binding,
                    derivation,
                    self.id,
                    Arc::clone(&self.description),
                ));
                self.cache_push(upstream.query(), Arc::clone(&produced), ctx);
                let slot = self.producers.get_mut(&correlation).expect("slot present");
                if !slot.producer.pop_pull() {
                    warn!(unit = %self.id, "answer emitted without a pending pull");
                }
                Ok(Some(Response::Answer {
                    request: upstream.clone(),
                    answer: produced,
                }))
            }
            UnitKind::Conjunction {
                inferable,
                out_vars,
                ..
            } => {
                let slot = self.producers.get_mut(&correlation).expect("slot present");
                let Some(stage) = slot.stages.get(&key).cloned() else {
                    warn!(unit = %self.id, "answer from unknown join stage");
                    return Ok(None);
                };
                let atom = &inferable[stage.atom_index];
                let Some(extended) = stage.subst.unify_tuple(atom, answer.binding().concepts())
                else {
                    warn!(unit = %self.id, atom = %atom, "downstream answer failed to unify");
                    return Ok(None);
                };
                let derivation = match stage.derivation.with(downstream.receiver(), answer) {
                    Ok(d) => d,
                    Err(err) => {
                        // Self-join through the same unit: keep the first
                        // contribution rather than failing a correct answer.
                        warn!(unit = %self.id, %err, "duplicate derivation contributor elided");
                        stage.derivation.clone()
                    }
                };
                if stage.atom_index + 1 < inferable.len() {
                    let next = JoinStage {
                        subst: extended,
                        atom_index: stage.atom_index + 1,
                        derivation,
                    };
                    self.register_stage(correlation, next, ctx)?;
                    return Ok(None);
                }
                let Some(binding) = extended.project(out_vars) else {
                    warn!(unit = %self.id, "completed join left output variables unbound");
                    return Ok(None);
                };
                if !slot.producer.record_returned(binding.clone()) {
                    return Ok(None);
                }
                let produced = Arc::new(Answer::new(
                    binding,
                    derivation,
                    self.id,
                    Arc::clone(&self.description),
                ));
                if !slot.producer.pop_pull() {
                    warn!(unit = %self.id, "answer emitted without a pending pull");
                }
                Ok(Some(Response::Answer {
                    request: upstream.clone(),
                    answer: produced,
                }))
            }
        }
    }

    fn on_downstream_exhausted(
        &mut self,
        downstream: &Request,
        ctx: &dyn UnitContext,
    ) -> Vec<Outbound> {
        let Some((_, correlation)) = self.upstream_of(downstream) else {
            return self.unroutable(downstream);
        };
        let key = key_of(downstream);
        self.routing.remove(&key);
        if let Some(slot) = self.producers.get_mut(&correlation) {
            slot.producer.mark_idle(downstream);
            slot.producer.remove_downstream(downstream);
            slot.stages.remove(&key);
        }
        self.advance(correlation, ctx)
    }

    fn on_downstream_failed(
        &mut self,
        downstream: &Request,
        failure: QueryFailure,
    ) -> Vec<Outbound> {
        let Some((upstream, correlation)) = self.upstream_of(downstream) else {
            return self.unroutable(downstream);
        };
        warn!(unit = %self.id, pattern = %self.description, %failure, "downstream resolution failed");
        let key = key_of(downstream);
        self.routing.remove(&key);
        if let Some(slot) = self.producers.get_mut(&correlation) {
            slot.producer.mark_idle(downstream);
            slot.producer.remove_downstream(downstream);
            slot.stages.remove(&key);
            slot.producer.pop_pull();
        }
        vec![route_response(Response::Failed {
            request: upstream,
            failure,
        })]
    }

    /// Drops all state scoped to a finished query.
    fn cleanup(&mut self, query: QueryId) {
        self.producers
            .retain(|_, slot| slot.upstream.query() != query);
        self.routing.retain(|_, up| up.query() != query);
        self.caches.remove(&query);
    }

    /// Wires downstream dependencies; runs at most once.
    fn initialize(&mut self, ctx: &dyn UnitContext) -> LatticeResult<()> {
        if let UnitKind::Conclusion {
            alternatives, deps, ..
        } = &self.kind
        {
            let mut wired = Vec::with_capacity(alternatives.len());
            debug_assert!(deps.is_empty());
            for alternative in alternatives {
                let unit = ctx.resolve(UnitRole::Conjunctive, &alternative.body_pattern)?;
                wired.push(ConclusionDep {
                    unit,
                    alternative: alternative.clone(),
                });
            }
            if let UnitKind::Conclusion { deps, .. } = &mut self.kind {
                *deps = wired;
            }
        }
        Ok(())
    }

    /// Serves as many pending pulls as current state allows, issuing new
    /// downstream requests for the rest.
    fn advance(&mut self, correlation: RequestId, ctx: &dyn UnitContext) -> Vec<Outbound> {
        let mut out = Vec::new();
        loop {
            {
                let Some(slot) = self.producers.get(&correlation) else {
                    break;
                };
                if slot.producer.pending_pulls() <= slot.producer.in_flight_count() {
                    break;
                }
            }
            let step = match &self.kind {
                UnitKind::Retrieval { .. } => self.decide_retrieval(correlation),
                UnitKind::Conclusion { .. } => self.decide_conclusion(correlation, ctx),
                UnitKind::Conjunction { .. } => self.decide_conjunction(correlation, ctx),
            };
            match step {
                Step::Emit(response) => out.push(route_response(response)),
                Step::Send(downstream) => {
                    // Routing entry is written before dispatch so the
                    // response always finds its upstream request.
                    let upstream = self
                        .producers
                        .get(&correlation)
                        .expect("slot present")
                        .upstream
                        .clone();
                    self.routing
                        .entry(key_of(&downstream))
                        .or_insert(upstream);
                    out.push(Outbound::Unit(Envelope {
                        to: downstream.receiver(),
                        message: Message::Request(downstream),
                    }));
                }
                Step::Wait => break,
                Step::Continue => {}
            }
        }
        out
    }

    /// Fact-backed leaf: next fact, else Exhausted.
    fn decide_retrieval(&mut self, correlation: RequestId) -> Step {
        let UnitKind::Retrieval { pattern } = &self.kind else {
            unreachable!("decide_retrieval on a non-retrieval unit");
        };
        let slot = self.producers.get_mut(&correlation).expect("slot present");
        let upstream = slot.upstream.clone();
        if !slot.producer.fact_exhausted() {
            match self.facts.pull(pattern, slot.producer.returned()) {
                Ok(Some(binding)) => {
                    slot.producer.record_returned(binding.clone());
                    let answer = Arc::new(Answer::new(
                        binding,
                        Derivation::empty(),
                        self.id,
                        Arc::clone(&self.description),
                    ));
                    slot.producer.pop_pull();
                    return Step::Emit(Response::Answer {
                        request: upstream,
                        answer,
                    });
                }
                Ok(None) => {
                    slot.producer.set_fact_exhausted();
                    return Step::Continue;
                }
                Err(err) => {
                    slot.producer.pop_pull();
                    return Step::Emit(Response::Failed {
                        request: upstream,
                        failure: QueryFailure {
                            pattern: self.description.to_string(),
                            reason: err.to_string(),
                        },
                    });
                }
            }
        }
        slot.producer.pop_pull();
        Step::Emit(Response::Exhausted { request: upstream })
    }

    /// Disjunctive conclusion: cache rows for cyclic requests; otherwise the
    /// fact stream first, then fair rotation over rule alternatives.
    fn decide_conclusion(&mut self, correlation: RequestId, ctx: &dyn UnitContext) -> Step {
        let UnitKind::Conclusion { atom, .. } = &self.kind else {
            unreachable!("decide_conclusion on a non-conclusion unit");
        };
        let slot = self.producers.get_mut(&correlation).expect("slot present");
        let upstream = slot.upstream.clone();

        if slot.cyclic {
            let cache = self.caches.entry(upstream.query()).or_default();
            while slot.cache_pos < cache.rows.len() {
                let row = Arc::clone(&cache.rows[slot.cache_pos]);
                slot.cache_pos += 1;
                if slot.producer.record_returned(row.binding().clone()) {
                    slot.producer.pop_pull();
                    return Step::Emit(Response::Answer {
                        request: upstream,
                        answer: row,
                    });
                }
            }
            slot.producer.pop_pull();
            return Step::Emit(Response::Exhausted { request: upstream });
        }

        if !slot.producer.fact_exhausted() {
            let pattern = match Pattern::atom(atom.clone()) {
                Ok(p) => p,
                Err(err) => {
                    slot.producer.pop_pull();
                    return Step::Emit(Response::Failed {
                        request: upstream,
                        failure: QueryFailure {
                            pattern: self.description.to_string(),
                            reason: err.to_string(),
                        },
                    });
                }
            };
            match self.facts.pull(&pattern, &slot.fact_returned) {
                Ok(Some(var_binding)) => {
                    slot.fact_returned.insert(var_binding.clone());
                    let Some(binding) = fact_tuple(atom, &pattern, &var_binding) else {
                        warn!(unit = %self.id, "fact solution left the atom unground");
                        return Step::Continue;
                    };
                    if !slot.producer.record_returned(binding.clone()) {
                        return Step::Continue;
                    }
                    let answer = Arc::new(Answer::new(
                        binding,
                        Derivation::empty(),
                        self.id,
                        Arc::clone(&self.description),
                    ));
                    // Fact answers enter the memo cache too: cyclic readers
                    // see the full answer set, not just the inferred part.
                    self.cache_push(upstream.query(), Arc::clone(&answer), ctx);
                    let slot = self.producers.get_mut(&correlation).expect("slot present");
                    slot.producer.pop_pull();
                    return Step::Emit(Response::Answer {
                        request: upstream,
                        answer,
                    });
                }
                Ok(None) => {
                    slot.producer.set_fact_exhausted();
                    return Step::Continue;
                }
                Err(err) => {
                    slot.producer.pop_pull();
                    return Step::Emit(Response::Failed {
                        request: upstream,
                        failure: QueryFailure {
                            pattern: self.description.to_string(),
                            reason: err.to_string(),
                        },
                    });
                }
            }
        }

        if let Some(downstream) = slot.producer.next_idle() {
            return Step::Send(downstream);
        }
        if slot.producer.in_flight_count() > 0 {
            return Step::Wait;
        }
        // No facts left and no productive alternatives left.
        slot.producer.pop_pull();
        Step::Emit(Response::Exhausted { request: upstream })
    }

    /// Conjunction: resume registered join stages fairly, else start a new
    /// one from the next base solution, else Exhausted.
    fn decide_conjunction(&mut self, correlation: RequestId, ctx: &dyn UnitContext) -> Step {
        {
            let slot = self.producers.get_mut(&correlation).expect("slot present");
            if let Some(downstream) = slot.producer.next_idle() {
                return Step::Send(downstream);
            }
        }

        let UnitKind::Conjunction {
            base, inferable, ..
        } = &self.kind
        else {
            unreachable!("decide_conjunction on a non-conjunction unit");
        };
        let slot = self.producers.get_mut(&correlation).expect("slot present");
        let upstream = slot.upstream.clone();

        if !slot.base_exhausted {
            let seed = match base {
                Some(base_pattern) => match self.facts.pull(base_pattern, &slot.base_returned) {
                    Ok(Some(binding)) => {
                        slot.base_returned.insert(binding.clone());
                        let Some(subst) = Substitution::from_vars(&base_pattern.vars(), &binding)
                        else {
                            warn!(unit = %self.id, "base solution shape mismatch");
                            return Step::Continue;
                        };
                        subst
                    }
                    Ok(None) => {
                        slot.base_exhausted = true;
                        return Step::Continue;
                    }
                    Err(err) => {
                        slot.producer.pop_pull();
                        return Step::Emit(Response::Failed {
                            request: upstream,
                            failure: QueryFailure {
                                pattern: self.description.to_string(),
                                reason: err.to_string(),
                            },
                        });
                    }
                },
                None => {
                    if slot.base_seeded {
                        slot.base_exhausted = true;
                        return Step::Continue;
                    }
                    slot.base_seeded = true;
                    Substitution::new()
                }
            };
            debug_assert!(!inferable.is_empty(), "conjunction kind implies inferable atoms");
            let stage = JoinStage {
                subst: seed,
                atom_index: 0,
                derivation: Derivation::empty(),
            };
            return match self.register_stage(correlation, stage, ctx) {
                Ok(()) => Step::Continue,
                Err(failure) => {
                    let slot = self.producers.get_mut(&correlation).expect("slot present");
                    slot.producer.pop_pull();
                    Step::Emit(Response::Failed {
                        request: upstream,
                        failure,
                    })
                }
            };
        }

        if slot.producer.in_flight_count() > 0 {
            return Step::Wait;
        }
        if slot.producer.downstream_count() > 0 {
            // Registered but unselectable streams cannot happen: next_idle
            // above would have taken one.
            return Step::Wait;
        }
        slot.producer.pop_pull();
        Step::Emit(Response::Exhausted { request: upstream })
    }

    /// Resolves and registers a new join-stage stream for a conjunction. The
    /// stream is dispatched by the advance loop once selected.
    fn register_stage(
        &mut self,
        correlation: RequestId,
        stage: JoinStage,
        ctx: &dyn UnitContext,
    ) -> Result<(), QueryFailure> {
        let UnitKind::Conjunction { inferable, .. } = &self.kind else {
            unreachable!("register_stage outside a conjunction");
        };
        let atom = inferable[stage.atom_index].bound(&stage.subst);
        let unit = Pattern::atom(atom)
            .map_err(|e| e.to_string())
            .and_then(|p| {
                ctx.resolve(UnitRole::Concludable, &p)
                    .map_err(|e| e.to_string())
            })
            .map_err(|reason| QueryFailure {
                pattern: self.description.to_string(),
                reason,
            })?;

        let slot = self.producers.get_mut(&correlation).expect("slot present");
        let downstream = Request::downstream(unit, self.id, &slot.upstream);
        let key = key_of(&downstream);
        slot.producer
            .add_downstream(downstream, &self.description)
            .map_err(|err| {
                error!(unit = %self.id, %err, "duplicate join-stage registration");
                QueryFailure {
                    pattern: self.description.to_string(),
                    reason: err.to_string(),
                }
            })?;
        slot.stages.insert(key, stage);
        Ok(())
    }

    /// Appends an answer to the per-query memo cache (conclusion units).
    fn cache_push(&mut self, query: QueryId, answer: Arc<Answer>, ctx: &dyn UnitContext) {
        let cache = self.caches.entry(query).or_default();
        if cache.seen.insert(answer.binding().clone()) {
            cache.rows.push(answer);
            ctx.note_fresh_answer(query);
        }
    }

    fn upstream_of(&self, downstream: &Request) -> Option<(Request, RequestId)> {
        let upstream = self.routing.get(&key_of(downstream))?.clone();
        let correlation = upstream.correlation();
        Some((upstream, correlation))
    }

    /// A response arrived with no routing entry: corrupted routing. Abort the
    /// owning query with a diagnostic instead of dropping it silently.
    fn unroutable(&self, downstream: &Request) -> Vec<Outbound> {
        error!(
            unit = %self.id,
            pattern = %self.description,
            correlation = %downstream.correlation(),
            "response without routing entry"
        );
        vec![Outbound::Query {
            query: downstream.query(),
            event: QueryEvent::Failed(QueryFailure {
                pattern: self.description.to_string(),
                reason: format!(
                    "response for request {} has no routing entry",
                    downstream.correlation()
                ),
            }),
        }]
    }
}

/// Translates a rule-body answer into a full-position tuple of the conclusion
/// atom, validating constants and repeated variables. `None` when the body
/// answer cannot ground this conclusion.
fn conclusion_tuple(
    atom: &Atom,
    alternative: &RuleAlternative,
    answer: &Answer,
) -> Option<Binding> {
    let body_subst = Substitution::from_vars(&alternative.body_vars, answer.binding())?;
    let tuple = alternative.head.ground(&body_subst)?;
    Substitution::new().unify_tuple(atom, &tuple)?;
    Some(Binding::new(tuple))
}

/// Expands a fact solution (variable space) into the conclusion atom's
/// full-position tuple.
fn fact_tuple(atom: &Atom, pattern: &Pattern, var_binding: &Binding) -> Option<Binding> {
    let subst = Substitution::from_vars(&pattern.vars(), var_binding)?;
    atom.ground(&subst).map(Binding::new)
}

/// Routes a response per the protocol: to the upstream sender's mailbox, or
/// to the query output channel for root requests.
fn route_response(response: Response) -> Outbound {
    let request = response.request().clone();
    match request.sender() {
        Some(sender) => Outbound::Unit(Envelope {
            to: sender,
            message: Message::Response(response),
        }),
        None => {
            let event = match response {
                Response::Answer { answer, .. } => QueryEvent::Answer(answer),
                Response::Exhausted { .. } => QueryEvent::Exhausted,
                Response::Failed { failure, .. } => QueryEvent::Failed(failure),
            };
            Outbound::Query {
                query: request.query(),
                event,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::ConceptId;
    use crate::error::LatticeError;
    use crate::pattern::Term;
    use crate::storage::MemoryFactStore;

    struct NoResolve;

    impl UnitContext for NoResolve {
        fn resolve(&self, _role: UnitRole, _pattern: &Pattern) -> LatticeResult<UnitId> {
            Err(LatticeError::internal("no registry in this test"))
        }
        fn note_fresh_answer(&self, _query: QueryId) {}
        fn note_cycle(&self, _query: QueryId) {}
    }

    fn c(n: u64) -> ConceptId {
        ConceptId::new(n)
    }

    fn retrieval_unit(store: Arc<MemoryFactStore>) -> ResolutionUnit {
        let pattern = Pattern::atom(Atom::new("p", vec![Term::var("x")]).unwrap()).unwrap();
        let description: Arc<str> = Arc::from(pattern.to_string());
        ResolutionUnit::new(
            UnitId::new(0),
            description,
            UnitKind::Retrieval { pattern },
            store,
        )
    }

    fn pull_root(unit: &mut ResolutionUnit, request: &Request) -> QueryEvent {
        let mut out = unit.handle(Message::Request(request.clone()), &NoResolve);
        assert_eq!(out.len(), 1, "one response per processed request");
        match out.pop().unwrap() {
            Outbound::Query { event, .. } => event,
            Outbound::Unit(_) => panic!("root response must go to the output channel"),
        }
    }

    #[test]
    fn retrieval_unit_drains_facts_then_exhausts() {
        let store = Arc::new(MemoryFactStore::new());
        store.insert("p", vec![c(1)]).unwrap();
        store.insert("p", vec![c(2)]).unwrap();
        let mut unit = retrieval_unit(store);

        let request = Request::root(UnitId::new(0), QueryId::new());
        let mut bindings = Vec::new();
        for _ in 0..2 {
            match pull_root(&mut unit, &request) {
                QueryEvent::Answer(answer) => {
                    assert!(!answer.is_inferred());
                    bindings.push(answer.binding().clone());
                }
                other => panic!("expected answer, got {other:?}"),
            }
        }
        assert_eq!(bindings.len(), 2);
        assert_ne!(bindings[0], bindings[1]);

        assert!(matches!(pull_root(&mut unit, &request), QueryEvent::Exhausted));
        // Idempotent re-request after exhaustion.
        assert!(matches!(pull_root(&mut unit, &request), QueryEvent::Exhausted));
    }

    #[test]
    fn separate_requests_get_separate_producers() {
        let store = Arc::new(MemoryFactStore::new());
        store.insert("p", vec![c(1)]).unwrap();
        let mut unit = retrieval_unit(store);

        let query = QueryId::new();
        let first = Request::root(UnitId::new(0), query);
        let second = Request::root(UnitId::new(0), query);

        assert!(matches!(pull_root(&mut unit, &first), QueryEvent::Answer(_)));
        // A distinct request re-derives from scratch: same binding again.
        assert!(matches!(pull_root(&mut unit, &second), QueryEvent::Answer(_)));
        assert!(matches!(pull_root(&mut unit, &first), QueryEvent::Exhausted));
    }

    #[test]
    fn cleanup_releases_request_state() {
        let store = Arc::new(MemoryFactStore::new());
        store.insert("p", vec![c(1)]).unwrap();
        let mut unit = retrieval_unit(store);

        let query = QueryId::new();
        let request = Request::root(UnitId::new(0), query);
        assert!(matches!(pull_root(&mut unit, &request), QueryEvent::Answer(_)));
        assert_eq!(unit.producers.len(), 1);

        unit.handle(Message::Cleanup { query }, &NoResolve);
        assert!(unit.producers.is_empty());
    }

    #[test]
    fn unroutable_response_fails_the_query() {
        let store = Arc::new(MemoryFactStore::new());
        let mut unit = retrieval_unit(store);

        let query = QueryId::new();
        let root = Request::root(UnitId::new(9), query);
        let stray = Request::downstream(UnitId::new(0), UnitId::new(9), &root);
        let out = unit.handle(
            Message::Response(Response::Exhausted { request: stray }),
            &NoResolve,
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outbound::Query {
                event: QueryEvent::Failed(failure),
                ..
            } => assert!(failure.reason.contains("routing")),
            other => panic!("expected failure event, got {other:?}"),
        }
    }
}
