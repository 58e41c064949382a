//! Patch codec.
//!
//! Compact binary encoding for batches of operations exchanged between peers
//! and stored in the operation log. Every frame is self-validating: decoding
//! either yields exactly the encoded operations or a [`MalformedPatchError`].
//!
//! [`MalformedPatchError`]: crate::core::MalformedPatchError

mod compression;
mod patch;
pub(crate) mod wire;

pub use compression::*;
pub use patch::*;
