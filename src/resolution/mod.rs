//! The resolution framework.
//!
//! A network of long-lived resolution units, one per distinct pattern
//! identity, lazily produces deduplicated answers on demand. Units exchange
//! immutable Request/Response values through per-unit mailboxes driven by a
//! worker pool; no unit's state is ever touched by two execution contexts at
//! once. The registry owns the unit arena and maps pattern identities to unit
//! handles so that recursive rules resolve to the same unit instead of
//! unrolling without bound.

pub mod answer;
pub mod message;
pub mod oracle;
pub mod producer;
pub mod registry;
pub mod runtime;
pub mod unit;
