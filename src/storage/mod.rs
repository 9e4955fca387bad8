//! Fact storage.
//!
//! The resolution engine consumes base facts through the `FactSource` trait;
//! production deployments back it with the graph-traversal engine, while
//! `MemoryFactStore` is the thread-safe in-memory reference implementation
//! used for embedded mode and tests.

mod memory;

use std::collections::HashSet;

use thiserror::Error;

use crate::binding::Binding;
use crate::pattern::Pattern;

pub use memory::MemoryFactStore;

/// Errors that can occur while pulling base facts.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Predicate used with inconsistent arity.
    #[error("Predicate '{predicate}' used with arity {actual}, previously {expected}")]
    ArityMismatch {
        /// The offending predicate.
        predicate: String,
        /// Arity recorded on first use.
        expected: usize,
        /// Arity of the rejected tuple.
        actual: usize,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// Supplier of concrete base-fact answers for rule-free patterns.
///
/// `pull` returns the next solution of `pattern` that is not already in
/// `returned`, or `None` when the pattern has no further solutions. Calls must
/// be safe to repeat: the caller (an Answer Producer) owns the returned-set
/// and filters centrally, so implementations stay stateless per pull. Answer
/// tuples are ordered by the pattern's canonical variable sequence
/// ([`Pattern::vars`]).
pub trait FactSource: Send + Sync {
    /// Pulls the next not-yet-returned solution for a base pattern.
    fn pull(
        &self,
        pattern: &Pattern,
        returned: &HashSet<Binding>,
    ) -> Result<Option<Binding>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: the fact source must stay object-safe, units hold it
    // as a trait object.
    fn _assert_fact_source_object_safe(_: &dyn FactSource) {}

    #[test]
    fn storage_error_display() {
        let err = StorageError::ArityMismatch {
            predicate: "parent".to_string(),
            expected: 2,
            actual: 3,
        };
        assert!(err.to_string().contains("parent"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }
}
