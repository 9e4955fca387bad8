//! # LatticeQL - Pull-Driven Rule Resolution for Knowledge Graphs
//!
//! LatticeQL answers queries that may require chaining user-defined inference
//! rules (a Datalog-style recursive logic program) over a base fact graph.
//! Resolution is lazy and pull-driven: a network of long-lived resolution
//! units, one per distinct pattern, produces deduplicated answers on demand,
//! records derivation provenance for explanations, and converges on the same
//! answer set as a bottom-up fixpoint evaluator even for recursive and
//! mutually-recursive rules.
//!
//! ## Core Concepts
//!
//! - **Pattern**: a conjunction of atoms over variables and concepts
//! - **Rule**: `body => head`, the caller-supplied inference configuration
//! - **FactSource**: supplier of concrete base-fact answers (the graph)
//! - **Answer**: a resolved binding plus its derivation provenance
//! - **QueryHandle**: sequential pulls over one query, up to exhaustion
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use latticeql::{
//!     Atom, ConceptId, LatticeEngine, MemoryFactStore, Pattern, Rule, RuleSet, Term,
//! };
//!
//! # fn main() -> latticeql::LatticeResult<()> {
//! let store = Arc::new(MemoryFactStore::new());
//! let (a, b) = (ConceptId::from_name("a"), ConceptId::from_name("b"));
//! store.insert("parent", vec![a, b]).map_err(|e| latticeql::LatticeError::internal(e.to_string()))?;
//!
//! let rule = Rule::new(
//!     "ancestors",
//!     Atom::new("ancestor", vec![Term::var("x"), Term::var("y")])?,
//!     Pattern::atom(Atom::new("parent", vec![Term::var("x"), Term::var("y")])?)?,
//! )?;
//! let engine = LatticeEngine::new(RuleSet::new(vec![rule])?, store);
//!
//! let query = Pattern::atom(Atom::new("ancestor", vec![Term::var("x"), Term::var("y")])?)?;
//! let answers = engine.resolve_all(query)?;
//! assert_eq!(answers.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core model
pub mod binding;
pub mod concept;
pub mod error;
pub mod pattern;
pub mod rule;
pub mod storage;

// Resolution framework and engine
pub mod engine;
pub mod resolution;

// Re-export primary types at crate root for convenience
pub use binding::{Binding, Substitution};
pub use concept::ConceptId;
pub use engine::{EngineConfig, LatticeEngine, QueryHandle, QueryStats};
pub use error::{ExecutionError, LatticeError, LatticeResult, ProtocolError, ValidationError};
pub use pattern::{Atom, Pattern, Term};
pub use resolution::answer::{Answer, Derivation, ProofKind, ProofNode};
pub use resolution::message::{QueryFailure, QueryId};
pub use resolution::oracle::{oracle_answers, saturate};
pub use rule::{Rule, RuleSet};
pub use storage::{FactSource, MemoryFactStore, StorageError};
