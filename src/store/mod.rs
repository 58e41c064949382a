//! Document store.
//!
//! Folds causally delivered operations into a [`Document`] and publishes
//! immutable views of it to readers.

mod document;
#[allow(clippy::module_inception)]
mod store;

pub use document::*;
pub use store::*;
