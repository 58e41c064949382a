//! Operation log.
//!
//! Durable, append-only, segmented record of every operation the replica has
//! observed, in the order it was applied. The log is the source of truth on
//! restart: the document is rebuilt from the latest snapshot plus the records
//! after it.
//!
//! - [`OperationLog`]: single-writer append, flush, read, and compaction
//! - [`LogReader`]: lazy iterator from any retained position
//! - [`LogRecovery`]: what opening found (corrupt segments, torn tails)

mod oplog;
mod reader;
mod segment;

pub use oplog::*;
pub use reader::LogReader;
pub use segment::{SegmentHeader, segment_file_name};
