//! # inksync
//!
//! Offline-first synchronization core for collaborative ink documents.
//!
//! Every device keeps a full [`Replica`] of a page: strokes, tombstones and
//! metadata. Edits are captured as operations with Lamport ids, written to a
//! durable append-only log, and folded into a conflict-free document. Peers
//! exchange only what the other side lacks, so any two replicas that have
//! seen the same operations hold identical documents.
//!
//! ## Feature Flags
//!
//! - `compression` (default): zstd compression of patch bodies and snapshots
//! - `runtime` (default): tokio session driver and replica change feed
//!
//! ## Modules
//!
//! - [`core`]: ids, version vectors, operations, errors and constants
//! - [`codec`]: binary patch encoding
//! - [`log`]: segmented, checksummed operation log
//! - [`store`]: causal delivery and the published document view
//! - [`merge`]: conflict resolution rules
//! - [`snapshot`]: background snapshots and recovery
//! - [`sync`]: sans-IO sync sessions and the async driver
//! - [`replica`]: everything above wired together for one device
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use inksync::prelude::*;
//!
//! # fn main() -> Result<(), InkError> {
//! let (replica, report) = Replica::open("/tmp/page-1", AuthorId(7), CoreConfig::default())?;
//! assert!(report.is_clean());
//!
//! let stroke = StrokeData::new(vec![SamplePoint::new(1.0, 2.0, 0, 0.5)], 1);
//! let op = replica.capture(OpKind::InsertStroke(stroke))?;
//! assert!(replica.snapshot_view().stroke(op.id).is_some());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
pub mod config;
pub mod core;
pub mod log;
pub mod merge;
pub mod replica;
pub mod snapshot;
pub mod store;
pub mod sync;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{CoreConfig, CoreConfigBuilder, Durability};
    pub use crate::core::*;
    pub use crate::replica::{RecoveryReport, Replica};
    pub use crate::store::{Document, Stroke};

    #[cfg(feature = "runtime")]
    pub use crate::sync::{SessionDriver, Transport, serve_inbound};
    pub use crate::sync::{PeerRegistry, SessionAction, SessionPhase, SyncSession};
}

// Re-export commonly used items at crate root
pub use config::CoreConfig;
pub use core::{AuthorId, InkError, OpId, OpKind, Operation, VersionVector};
pub use replica::{RecoveryReport, Replica};
pub use store::Document;
