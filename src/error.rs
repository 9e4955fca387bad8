//! Error types for LatticeQL.
//!
//! All errors are strongly typed using thiserror. The taxonomy separates
//! validation of caller-supplied configuration, fatal protocol violations
//! inside the resolution network, and execution failures that abort a single
//! query. Errors surfacing inside a resolution unit fail only the query that
//! reached them, never the engine.

use thiserror::Error;

use crate::resolution::message::RequestId;

/// Validation errors for caller-supplied patterns and rules.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Predicate cannot be empty")]
    EmptyPredicate,

    #[error("Rule name cannot be empty")]
    EmptyRuleName,

    #[error("Rule '{rule}' has an empty body")]
    EmptyRuleBody {
        rule: String,
    },

    #[error("Pattern has no atoms")]
    EmptyPattern,

    #[error("Atom '{predicate}' has no terms")]
    EmptyAtom {
        predicate: String,
    },

    #[error("Rule '{rule}' binds head variable '{variable}' nowhere in its body")]
    UnboundHeadVariable {
        rule: String,
        variable: String,
    },

    #[error("Predicate '{predicate}' used with arity {actual}, previously {expected}")]
    ArityMismatch {
        predicate: String,
        expected: usize,
        actual: usize,
    },
}

/// Fatal protocol violations inside the resolution network.
///
/// Any of these indicates a bug in a decide hook or corrupted routing state;
/// the owning query is aborted with a diagnostic rather than silently dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Response for request {correlation} arrived at '{unit}' with no routing entry")]
    UnroutableResponse {
        unit: String,
        correlation: RequestId,
    },

    #[error("Downstream request {correlation} registered twice at '{unit}'")]
    DuplicateDownstream {
        unit: String,
        correlation: RequestId,
    },

    #[error("Derivation already contains an entry for unit '{unit}'")]
    DuplicateDerivationEntry {
        unit: String,
    },

    #[error("Resolution channel '{path}' disconnected")]
    Disconnected {
        path: String,
    },
}

/// Execution errors that abort a single query.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Fact source failed for pattern '{pattern}': {reason}")]
    FactSource {
        pattern: String,
        reason: String,
    },

    #[error("Query exceeded the reiteration limit of {limit} passes")]
    ReiterationLimitExceeded {
        limit: u32,
    },

    #[error("No response within {duration_ms}ms (a resolution unit failed to respond)")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Query over pattern '{pattern}' failed: {reason}")]
    QueryFailed {
        pattern: String,
        reason: String,
    },
}

/// Top-level error type for LatticeQL.
#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl LatticeError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a protocol violation.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for LatticeQL operations.
pub type LatticeResult<T> = Result<T, LatticeError>;
