//! Per-request answer production state.
//!
//! One `AnswerProducer` exists per (unit, upstream request): it remembers
//! which bindings were already returned to that request, whether the fact
//! stream still has answers, and which downstream streams remain productive.
//! Downstream selection is round-robin over an insertion-ordered list with an
//! explicit cursor, so no sibling stream is starved. Pull accounting
//! (`pending`/in-flight) keeps concurrent upstream pulls from double-sending
//! a stream that is still awaiting its response.

use std::collections::HashSet;

use crate::binding::Binding;
use crate::error::ProtocolError;
use crate::resolution::message::{Request, RequestId, UnitId};

type StreamKey = (UnitId, RequestId);

fn key_of(request: &Request) -> StreamKey {
    (request.receiver(), request.correlation())
}

/// Memoization and fairness state for one upstream request.
#[derive(Debug, Default)]
pub struct AnswerProducer {
    returned: HashSet<Binding>,
    fact_exhausted: bool,
    downstreams: Vec<Request>,
    registered: HashSet<StreamKey>,
    in_flight: HashSet<StreamKey>,
    cursor: usize,
    pending_pulls: usize,
}

impl AnswerProducer {
    /// Creates a fresh producer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a binding as returned. `true` when it was new.
    pub fn record_returned(&mut self, binding: Binding) -> bool {
        self.returned.insert(binding)
    }

    /// The bindings already returned to this request.
    #[must_use]
    pub fn returned(&self) -> &HashSet<Binding> {
        &self.returned
    }

    /// Whether the fact stream has reported end-of-stream.
    #[must_use]
    pub fn fact_exhausted(&self) -> bool {
        self.fact_exhausted
    }

    /// Marks the fact stream exhausted.
    pub fn set_fact_exhausted(&mut self) {
        self.fact_exhausted = true;
    }

    /// Registers a downstream stream as productive.
    ///
    /// Registering the same stream twice without an intervening removal is a
    /// bug in a decide hook, reported as a fatal protocol error.
    pub fn add_downstream(&mut self, request: Request, unit: &str) -> Result<(), ProtocolError> {
        let key = key_of(&request);
        if !self.registered.insert(key) {
            return Err(ProtocolError::DuplicateDownstream {
                unit: unit.to_string(),
                correlation: request.correlation(),
            });
        }
        self.downstreams.push(request);
        Ok(())
    }

    /// Removes a stream that reported Exhausted. `true` on real removal.
    pub fn remove_downstream(&mut self, request: &Request) -> bool {
        let key = key_of(request);
        if !self.registered.remove(&key) {
            return false;
        }
        self.in_flight.remove(&key);
        if let Some(pos) = self.downstreams.iter().position(|r| key_of(r) == key) {
            self.downstreams.remove(pos);
            // Keep the cursor on the element it was about to visit.
            if pos < self.cursor {
                self.cursor -= 1;
            }
            if !self.downstreams.is_empty() {
                self.cursor %= self.downstreams.len();
            } else {
                self.cursor = 0;
            }
        }
        true
    }

    /// Fairly selects the next registered stream that is not awaiting a
    /// response, marks it in flight, and returns it for dispatch.
    pub fn next_idle(&mut self) -> Option<Request> {
        let len = self.downstreams.len();
        if len == 0 {
            return None;
        }
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            let key = key_of(&self.downstreams[idx]);
            if !self.in_flight.contains(&key) {
                self.cursor = (idx + 1) % len;
                self.in_flight.insert(key);
                return Some(self.downstreams[idx].clone());
            }
        }
        None
    }

    /// Marks a stream idle again after its response arrived.
    pub fn mark_idle(&mut self, request: &Request) {
        self.in_flight.remove(&key_of(request));
    }

    /// Number of registered downstream streams.
    #[must_use]
    pub fn downstream_count(&self) -> usize {
        self.downstreams.len()
    }

    /// Number of streams currently awaiting a response.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Records one unanswered upstream pull.
    pub fn push_pull(&mut self) {
        self.pending_pulls += 1;
    }

    /// Consumes one unanswered pull, if any. `true` when one was consumed.
    pub fn pop_pull(&mut self) -> bool {
        if self.pending_pulls == 0 {
            return false;
        }
        self.pending_pulls -= 1;
        true
    }

    /// Unanswered upstream pulls.
    #[must_use]
    pub fn pending_pulls(&self) -> usize {
        self.pending_pulls
    }
}
