//! Resolution runtime.
//!
//! A small thread-based executor for the unit network. Each unit has a
//! mailbox and a `scheduled` flag in its arena cell; senders enqueue the unit
//! handle on a shared ready queue only when they win the flag, and exactly
//! one worker drains a unit's mailbox at a time. Workers never block on
//! anything but the ready queue, so answer production is driven entirely by
//! message arrival.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::LatticeResult;
use crate::pattern::Pattern;
use crate::resolution::message::{Message, QueryEvent, QueryId, UnitId};
use crate::resolution::registry::Registry;
use crate::resolution::unit::{Outbound, UnitContext, UnitRole};

/// Per-query output channel and pass counters.
struct QueryChannel {
    tx: Sender<QueryEvent>,
    /// New bindings that entered memo caches (monotone).
    fresh_answers: AtomicU64,
    /// Cyclic requests served from cache (monotone).
    cycles: AtomicU64,
}

/// State shared between workers, senders, and the engine.
struct Shared {
    registry: Arc<Registry>,
    queries: Mutex<HashMap<QueryId, Arc<QueryChannel>>>,
    /// Taken on shutdown so the ready queue disconnects and workers exit.
    ready_tx: Mutex<Option<Sender<UnitId>>>,
}

impl Shared {
    fn schedule(&self, unit: UnitId) {
        if let Ok(guard) = self.ready_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(unit);
            }
        }
    }

    /// Delivers a message to a unit's mailbox and schedules the unit if it
    /// is not already scheduled.
    fn send(&self, to: UnitId, message: Message) {
        let cell = match self.registry.cell(to) {
            Ok(cell) => cell,
            Err(err) => {
                warn!(unit = %to, %err, "message for unknown unit dropped");
                return;
            }
        };
        match cell.mailbox.lock() {
            Ok(mut mailbox) => mailbox.push_back(message),
            Err(_) => {
                warn!(unit = %to, "mailbox lock poisoned; message dropped");
                return;
            }
        }
        if !cell.scheduled.swap(true, Ordering::AcqRel) {
            self.schedule(to);
        }
    }

    /// Surfaces an event on a query's output channel. Events for queries that
    /// were already closed are dropped.
    fn publish(&self, query: QueryId, event: QueryEvent) {
        let channel = match self.queries.lock() {
            Ok(queries) => queries.get(&query).cloned(),
            Err(_) => None,
        };
        let Some(channel) = channel else {
            debug!(%query, "event for closed query dropped");
            return;
        };
        match channel.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // The caller pulls sequentially, so the channel only fills if
                // the query was abandoned mid-drain.
                warn!(%query, "output channel full; event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(%query, "output channel disconnected");
            }
        }
    }

    fn channel(&self, query: QueryId) -> Option<Arc<QueryChannel>> {
        self.queries.lock().ok()?.get(&query).cloned()
    }
}

impl UnitContext for Shared {
    fn resolve(&self, role: UnitRole, pattern: &Pattern) -> LatticeResult<UnitId> {
        self.registry.resolve(role, pattern)
    }

    fn note_fresh_answer(&self, query: QueryId) {
        if let Some(channel) = self.channel(query) {
            channel.fresh_answers.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn note_cycle(&self, query: QueryId) {
        if let Some(channel) = self.channel(query) {
            channel.cycles.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Snapshot of a query's pass counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassCounters {
    /// New bindings that entered memo caches.
    pub fresh_answers: u64,
    /// Cyclic requests served from cache.
    pub cycles: u64,
}

/// The worker pool driving the unit network.
pub struct Runtime {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Starts `workers` resolver threads over the registry's unit arena.
    #[must_use]
    pub fn start(registry: Arc<Registry>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (ready_tx, ready_rx) = unbounded::<UnitId>();
        let shared = Arc::new(Shared {
            registry,
            queries: Mutex::new(HashMap::new()),
            ready_tx: Mutex::new(Some(ready_tx)),
        });

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let shared = Arc::clone(&shared);
            let ready_rx: Receiver<UnitId> = ready_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("latticeql-resolver-{idx}"))
                .spawn(move || worker_loop(&shared, &ready_rx))
                .expect("failed to spawn latticeql resolver worker");
            handles.push(handle);
        }

        Self {
            shared,
            workers: handles,
        }
    }

    /// Delivers a message to a unit.
    pub fn send(&self, to: UnitId, message: Message) {
        self.shared.send(to, message);
    }

    /// Opens the output channel for a query.
    pub fn register_query(&self, query: QueryId, capacity: usize) -> Receiver<QueryEvent> {
        let (tx, rx) = bounded::<QueryEvent>(capacity.max(1));
        if let Ok(mut queries) = self.shared.queries.lock() {
            queries.insert(
                query,
                Arc::new(QueryChannel {
                    tx,
                    fresh_answers: AtomicU64::new(0),
                    cycles: AtomicU64::new(0),
                }),
            );
        }
        rx
    }

    /// Closes a query's output channel.
    pub fn unregister_query(&self, query: QueryId) {
        if let Ok(mut queries) = self.shared.queries.lock() {
            queries.remove(&query);
        }
    }

    /// Current pass counters for a query, if it is still open.
    #[must_use]
    pub fn pass_counters(&self, query: QueryId) -> PassCounters {
        match self.shared.channel(query) {
            Some(channel) => PassCounters {
                fresh_answers: channel.fresh_answers.load(Ordering::Relaxed),
                cycles: channel.cycles.load(Ordering::Relaxed),
            },
            None => PassCounters::default(),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Take the only sender so the ready queue disconnects; workers drain
        // what they already dequeued and exit, then join.
        if let Ok(mut guard) = self.shared.ready_tx.lock() {
            guard.take();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Shared, ready_rx: &Receiver<UnitId>) {
    while let Ok(unit_id) = ready_rx.recv() {
        let cell = match shared.registry.cell(unit_id) {
            Ok(cell) => cell,
            Err(err) => {
                warn!(unit = %unit_id, %err, "scheduled unit vanished");
                continue;
            }
        };

        loop {
            let batch: Vec<Message> = match cell.mailbox.lock() {
                Ok(mut mailbox) => mailbox.drain(..).collect(),
                Err(_) => {
                    warn!(unit = %unit_id, "mailbox lock poisoned");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let outbound: Vec<Outbound> = match cell.state.lock() {
                Ok(mut unit) => batch
                    .into_iter()
                    .flat_map(|message| unit.handle(message, shared))
                    .collect(),
                Err(_) => {
                    warn!(unit = %unit_id, "unit state lock poisoned");
                    break;
                }
            };

            // Dispatch outside the state lock: sends may schedule other
            // units, and publishing must never hold unit state.
            for effect in outbound {
                match effect {
                    Outbound::Unit(envelope) => shared.send(envelope.to, envelope.message),
                    Outbound::Query { query, event } => shared.publish(query, event),
                }
            }
        }

        cell.scheduled.store(false, Ordering::Release);
        // A message may have landed between the final drain and the flag
        // reset; reschedule if so, racing senders tolerated by the flag.
        let pending = cell
            .mailbox
            .lock()
            .map(|mailbox| !mailbox.is_empty())
            .unwrap_or(false);
        if pending && !cell.scheduled.swap(true, Ordering::AcqRel) {
            shared.schedule(unit_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::binding::Binding;
    use crate::concept::ConceptId;
    use crate::pattern::{Atom, Term};
    use crate::resolution::message::Request;
    use crate::rule::RuleSet;
    use crate::storage::MemoryFactStore;

    fn c(n: u64) -> ConceptId {
        ConceptId::new(n)
    }

    fn start_runtime(store: Arc<MemoryFactStore>) -> (Runtime, Arc<Registry>) {
        let registry = Arc::new(Registry::new(
            Arc::new(RuleSet::empty()),
            store,
        ));
        (Runtime::start(Arc::clone(&registry), 2), registry)
    }

    #[test]
    fn runtime_resolves_a_retrieval_pattern_end_to_end() {
        let store = Arc::new(MemoryFactStore::new());
        store.insert("p", vec![c(1)]).unwrap();
        store.insert("p", vec![c(2)]).unwrap();
        let (runtime, registry) = start_runtime(store);

        let pattern =
            Pattern::atom(Atom::new("p", vec![Term::var("x")]).unwrap()).unwrap();
        let root = registry.resolve(UnitRole::Conjunctive, &pattern).unwrap();

        let query = QueryId::new();
        let rx = runtime.register_query(query, 16);
        let request = Request::root(root, query);

        let mut bindings = HashSet::new();
        loop {
            runtime.send(root, Message::Request(request.clone()));
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                QueryEvent::Answer(answer) => {
                    bindings.insert(answer.binding().clone());
                }
                QueryEvent::Exhausted => break,
                QueryEvent::Failed(failure) => panic!("query failed: {failure}"),
            }
        }
        assert_eq!(
            bindings,
            HashSet::from([Binding::new(vec![c(1)]), Binding::new(vec![c(2)])])
        );
        runtime.unregister_query(query);
    }

    #[test]
    fn pass_counters_default_for_unknown_queries() {
        let (runtime, _) = start_runtime(Arc::new(MemoryFactStore::new()));
        assert_eq!(runtime.pass_counters(QueryId::new()), PassCounters::default());
    }

    #[test]
    fn shutdown_joins_workers() {
        let (runtime, _) = start_runtime(Arc::new(MemoryFactStore::new()));
        drop(runtime);
    }
}
