//! Sync layer.
//!
//! Implements:
//! - The framed wire protocol (HELLO, VECTOR, PATCH_BATCH, ACK, ERROR)
//! - A sans-IO per-peer session state machine with delta catch-up
//! - Acknowledgment tracking, backpressure and peer fencing
//! - A tokio driver with reconnect backoff (feature `runtime`)

mod ack;
mod backoff;
#[cfg(feature = "runtime")]
mod driver;
mod message;
mod peer;
mod session;

pub use ack::*;
pub use backoff::*;
#[cfg(feature = "runtime")]
pub use driver::*;
pub use message::*;
pub use peer::*;
pub use session::*;
