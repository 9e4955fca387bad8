//! Protocol messages.
//!
//! Requests flow down the dependency graph, Responses flow back along the
//! recorded route. All message types are immutable values; sharing across
//! units is by cloning (answers are `Arc`-shared, request paths are `Arc`
//! slices), never by reference into another unit's state.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::resolution::answer::Answer;

/// Stable handle of a resolution unit in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(u32);

impl UnitId {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Identifier of one top-level query evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(uuid::Uuid);

impl QueryId {
    /// Creates a fresh query identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Path-correlation token: identifies one logical answer stream between an
/// upstream and a downstream unit. Re-pulling the stream reuses the token;
/// distinct streams always get distinct tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    /// Creates a fresh correlation token.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pull for the next answer of one stream.
///
/// `sender == None` marks a root request from the top-level caller; its
/// Response is delivered to the query's output channel instead of another
/// unit. `path` lists the units on the logical call stack that led here, used
/// to detect cyclic re-entry into a unit.
#[derive(Debug, Clone)]
pub struct Request {
    receiver: UnitId,
    sender: Option<UnitId>,
    query: QueryId,
    correlation: RequestId,
    path: Arc<[UnitId]>,
}

impl Request {
    /// Creates a root request for a query's root unit.
    #[must_use]
    pub fn root(receiver: UnitId, query: QueryId) -> Self {
        Self {
            receiver,
            sender: None,
            query,
            correlation: RequestId::new(),
            path: Arc::from(Vec::new()),
        }
    }

    /// Creates a downstream request issued by `sender` while serving
    /// `upstream`, extending the call path with the sender itself.
    #[must_use]
    pub fn downstream(receiver: UnitId, sender: UnitId, upstream: &Request) -> Self {
        let mut path = Vec::with_capacity(upstream.path.len() + 1);
        path.extend_from_slice(&upstream.path);
        path.push(sender);
        Self {
            receiver,
            sender: Some(sender),
            query: upstream.query,
            correlation: RequestId::new(),
            path: Arc::from(path),
        }
    }

    /// The unit this request is addressed to.
    #[must_use]
    pub fn receiver(&self) -> UnitId {
        self.receiver
    }

    /// The issuing unit, or `None` for a root request.
    #[must_use]
    pub fn sender(&self) -> Option<UnitId> {
        self.sender
    }

    /// The owning top-level query.
    #[must_use]
    pub fn query(&self) -> QueryId {
        self.query
    }

    /// The stream's correlation token.
    #[must_use]
    pub fn correlation(&self) -> RequestId {
        self.correlation
    }

    /// True for a root request from the top-level caller.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.sender.is_none()
    }

    /// True when `unit` is already on the logical call stack of this request.
    #[must_use]
    pub fn on_path(&self, unit: UnitId) -> bool {
        self.path.contains(&unit)
    }
}

// Structural identity is (receiver, correlation): re-pulls of the same stream
// compare equal, everything else does not.
impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.receiver == other.receiver && self.correlation == other.correlation
    }
}

impl Eq for Request {}

impl Hash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.receiver.hash(state);
        self.correlation.hash(state);
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<-{}", self.receiver, self.correlation)
    }
}

/// Diagnostic payload of a failed query: the originating pattern and reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFailure {
    /// Label of the pattern whose resolution failed.
    pub pattern: String,
    /// Failure description.
    pub reason: String,
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.pattern, self.reason)
    }
}

/// The single Response produced for a processed Request.
#[derive(Debug, Clone)]
pub enum Response {
    /// A resolved answer for the stream.
    Answer {
        /// The request being answered.
        request: Request,
        /// The produced answer.
        answer: Arc<Answer>,
    },
    /// No further answers available right now along this stream.
    Exhausted {
        /// The request being answered.
        request: Request,
    },
    /// Resolution failed; the owning query must be aborted.
    Failed {
        /// The request being answered.
        request: Request,
        /// What went wrong.
        failure: QueryFailure,
    },
}

impl Response {
    /// The request this response answers.
    #[must_use]
    pub fn request(&self) -> &Request {
        match self {
            Self::Answer { request, .. }
            | Self::Exhausted { request }
            | Self::Failed { request, .. } => request,
        }
    }
}

/// Inbound message for a resolution unit's mailbox.
#[derive(Debug, Clone)]
pub enum Message {
    /// A pull from upstream.
    Request(Request),
    /// A response from a downstream unit.
    Response(Response),
    /// Release all state scoped to a finished query.
    Cleanup {
        /// The finished query.
        query: QueryId,
    },
}

/// A routed message.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Destination unit.
    pub to: UnitId,
    /// The message.
    pub message: Message,
}

/// Event surfaced on a query's top-level output channel.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// A final answer for the root pattern.
    Answer(Arc<Answer>),
    /// The current pass found no further answers.
    Exhausted,
    /// The query failed.
    Failed(QueryFailure),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_identity_is_receiver_plus_correlation() {
        let query = QueryId::new();
        let a = Request::root(UnitId::new(1), query);
        let b = a.clone();
        assert_eq!(a, b);

        let c = Request::root(UnitId::new(1), query);
        assert_ne!(a, c, "fresh correlation must not compare equal");
    }

    #[test]
    fn downstream_extends_path_with_sender() {
        let query = QueryId::new();
        let root = Request::root(UnitId::new(0), query);
        assert!(!root.on_path(UnitId::new(0)));

        let down = Request::downstream(UnitId::new(1), UnitId::new(0), &root);
        assert_eq!(down.sender(), Some(UnitId::new(0)));
        assert!(down.on_path(UnitId::new(0)));
        assert!(!down.on_path(UnitId::new(1)));

        let deeper = Request::downstream(UnitId::new(0), UnitId::new(1), &down);
        assert!(deeper.on_path(UnitId::new(0)));
        assert!(deeper.on_path(UnitId::new(1)));
    }

    #[test]
    fn response_reports_its_request() {
        let query = QueryId::new();
        let req = Request::root(UnitId::new(3), query);
        let resp = Response::Exhausted {
            request: req.clone(),
        };
        assert_eq!(*resp.request(), req);
    }
}
