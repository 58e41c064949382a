//! Core identifiers, operations, causal metadata, and error types.
//!
//! This module has no I/O and no dependencies on the other layers. Every
//! other module builds on the types defined here.

mod clock;
mod constants;
mod error;
mod ids;
mod op;
mod traits;

pub use clock::*;
pub use constants::*;
pub use error::*;
pub use ids::*;
pub use op::*;
pub use traits::*;
