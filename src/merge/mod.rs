//! Conflict resolver.
//!
//! Stateless merge rules shared by the document store, snapshot recovery,
//! and tests. Conflicts are never errors.

mod resolver;

pub use resolver::*;
