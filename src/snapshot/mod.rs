//! Snapshot manager.
//!
//! Periodically materializes the document to disk so recovery replays only
//! the log tail, and so the log below a snapshot can be compacted.

mod format;
mod manager;

pub use format::{
    Snapshot, decode_document, encode_document, read_snapshot_file, snapshot_file_name,
    write_snapshot_file,
};
pub use manager::*;
