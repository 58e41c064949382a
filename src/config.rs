//! Tunables for every layer of the core.
//!
//! Each section has sensible defaults; thresholds and timeouts are
//! configuration, not constants. Use [`CoreConfigBuilder`] to override a
//! handful of fields and [`CoreConfig::validate`] before opening a replica.

use std::time::Duration;

use crate::core::{
    ConfigError, DEFAULT_BACKOFF_MAX, DEFAULT_BACKOFF_MIN, DEFAULT_BACKOFF_MULTIPLIER,
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_PENDING_OPS, DEFAULT_SNAPSHOT_SIZE_THRESHOLD, DEFAULT_SNAPSHOT_TIME_THRESHOLD,
    MIN_COMPRESS_SIZE, RECORD_HEADER_SIZE, SEGMENT_HEADER_SIZE,
};

/// When appended log records reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// fsync before every `append` returns.
    #[default]
    PerAppend,
    /// Buffer appends until `flush()` is called.
    Explicit,
}

/// Operation log settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Segment size that triggers rotation.
    pub max_segment_bytes: u64,

    /// Durability policy.
    pub durability: Durability,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: 4 * 1024 * 1024,
            durability: Durability::PerAppend,
        }
    }
}

/// Patch codec settings.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Bodies smaller than this are never compressed.
    pub min_compress_size: usize,

    /// zstd level (1-22).
    pub compression_level: i32,

    /// Ceiling on a decompressed body.
    pub max_decompressed_size: usize,

    /// Allow compressing outgoing bodies.
    pub compress: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            min_compress_size: MIN_COMPRESS_SIZE,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_decompressed_size: 16 * 1024 * 1024,
            compress: cfg!(feature = "compression"),
        }
    }
}

/// Snapshot trigger and retention settings.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Logged bytes since the last snapshot that trigger a new one.
    pub size_threshold: u64,

    /// Elapsed time (with new data) that triggers a new snapshot.
    pub time_threshold: Duration,

    /// Snapshots kept on disk after GC.
    pub retain: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            size_threshold: DEFAULT_SNAPSHOT_SIZE_THRESHOLD,
            time_threshold: DEFAULT_SNAPSHOT_TIME_THRESHOLD,
            retain: 2,
        }
    }
}

/// Sync session settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Time allowed from connect to receiving the peer's HELLO.
    pub handshake_timeout: Duration,

    /// Silence after which an established session is dropped.
    pub idle_timeout: Duration,

    /// First reconnect delay.
    pub backoff_min: Duration,

    /// Reconnect delay ceiling.
    pub backoff_max: Duration,

    /// Reconnect delay growth factor.
    pub backoff_multiplier: u32,

    /// Unacknowledged ops in flight to one peer before pushes pause.
    pub max_outstanding: usize,

    /// Operations per PATCH_BATCH frame.
    pub max_batch_ops: usize,

    /// Malformed inputs tolerated before a peer is fenced.
    pub max_peer_faults: u32,

    /// How long peer state survives without contact.
    pub peer_retention: Duration,

    /// Remote ops buffered for missing dependencies before further
    /// unready ops are refused and the sender is faulted.
    pub max_pending_ops: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            backoff_min: DEFAULT_BACKOFF_MIN,
            backoff_max: DEFAULT_BACKOFF_MAX,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_outstanding: 1024,
            max_batch_ops: 256,
            max_peer_faults: 3,
            peer_retention: Duration::from_secs(24 * 60 * 60),
            max_pending_ops: DEFAULT_MAX_PENDING_OPS,
        }
    }
}

/// Complete configuration for one replica.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Operation log.
    pub log: LogConfig,
    /// Patch codec.
    pub codec: CodecConfig,
    /// Snapshots.
    pub snapshot: SnapshotConfig,
    /// Sync sessions.
    pub sync: SyncConfig,
}

impl CoreConfig {
    /// Check every section for values the core cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min_segment = (SEGMENT_HEADER_SIZE + RECORD_HEADER_SIZE) as u64 * 2;
        if self.log.max_segment_bytes < min_segment {
            return Err(invalid(
                "log.max_segment_bytes",
                format!("must be at least {min_segment}"),
            ));
        }
        if !(1..=22).contains(&self.codec.compression_level) {
            return Err(invalid("codec.compression_level", "must be within 1..=22"));
        }
        if self.codec.max_decompressed_size == 0 {
            return Err(invalid("codec.max_decompressed_size", "must be non-zero"));
        }
        if self.snapshot.size_threshold == 0 {
            return Err(invalid("snapshot.size_threshold", "must be non-zero"));
        }
        if self.snapshot.retain == 0 {
            return Err(invalid("snapshot.retain", "must keep at least one snapshot"));
        }
        let sync = &self.sync;
        if sync.handshake_timeout.is_zero() {
            return Err(invalid("sync.handshake_timeout", "must be non-zero"));
        }
        if sync.idle_timeout.is_zero() {
            return Err(invalid("sync.idle_timeout", "must be non-zero"));
        }
        if sync.backoff_min.is_zero() || sync.backoff_min > sync.backoff_max {
            return Err(invalid(
                "sync.backoff_min",
                "must be non-zero and not exceed backoff_max",
            ));
        }
        if sync.backoff_multiplier < 1 {
            return Err(invalid("sync.backoff_multiplier", "must be at least 1"));
        }
        if sync.max_outstanding == 0 {
            return Err(invalid("sync.max_outstanding", "must be non-zero"));
        }
        if sync.max_batch_ops == 0 {
            return Err(invalid("sync.max_batch_ops", "must be non-zero"));
        }
        if sync.max_peer_faults == 0 {
            return Err(invalid("sync.max_peer_faults", "must be non-zero"));
        }
        if sync.max_pending_ops == 0 {
            return Err(invalid("sync.max_pending_ops", "must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError {
        field,
        reason: reason.into(),
    }
}

/// Builder for [`CoreConfig`].
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the segment rotation size.
    pub fn max_segment_bytes(mut self, bytes: u64) -> Self {
        self.config.log.max_segment_bytes = bytes;
        self
    }

    /// Set the log durability policy.
    pub fn durability(mut self, durability: Durability) -> Self {
        self.config.log.durability = durability;
        self
    }

    /// Enable or disable outgoing compression.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.codec.compress = enabled;
        self
    }

    /// Set the zstd level.
    pub fn compression_level(mut self, level: i32) -> Self {
        self.config.codec.compression_level = level;
        self
    }

    /// Set the snapshot byte threshold.
    pub fn snapshot_size_threshold(mut self, bytes: u64) -> Self {
        self.config.snapshot.size_threshold = bytes;
        self
    }

    /// Set the snapshot time threshold.
    pub fn snapshot_time_threshold(mut self, threshold: Duration) -> Self {
        self.config.snapshot.time_threshold = threshold;
        self
    }

    /// Set how many snapshots survive GC.
    pub fn snapshot_retain(mut self, retain: usize) -> Self {
        self.config.snapshot.retain = retain;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync.handshake_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync.idle_timeout = timeout;
        self
    }

    /// Set reconnect backoff bounds.
    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.config.sync.backoff_min = min;
        self.config.sync.backoff_max = max;
        self
    }

    /// Set the in-flight ceiling per peer.
    pub fn max_outstanding(mut self, ops: usize) -> Self {
        self.config.sync.max_outstanding = ops;
        self
    }

    /// Set the operations per batch frame.
    pub fn max_batch_ops(mut self, ops: usize) -> Self {
        self.config.sync.max_batch_ops = ops;
        self
    }

    /// Set faults tolerated before fencing a peer.
    pub fn max_peer_faults(mut self, faults: u32) -> Self {
        self.config.sync.max_peer_faults = faults;
        self
    }

    /// Set how long idle peer state is kept.
    pub fn peer_retention(mut self, retention: Duration) -> Self {
        self.config.sync.peer_retention = retention;
        self
    }

    /// Set the causal buffer cap.
    pub fn max_pending_ops(mut self, ops: usize) -> Self {
        self.config.sync.max_pending_ops = ops;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> CoreConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.snapshot.size_threshold, 2 * 1024 * 1024);
        assert_eq!(config.snapshot.time_threshold, Duration::from_secs(300));
        assert_eq!(config.sync.max_outstanding, 1024);
        assert_eq!(config.log.durability, Durability::PerAppend);
    }

    #[test]
    fn test_builder_overrides() {
        let config = CoreConfigBuilder::new()
            .durability(Durability::Explicit)
            .snapshot_size_threshold(1024)
            .max_outstanding(8)
            .backoff(Duration::from_millis(10), Duration::from_secs(1))
            .build();

        assert_eq!(config.log.durability, Durability::Explicit);
        assert_eq!(config.snapshot.size_threshold, 1024);
        assert_eq!(config.sync.max_outstanding, 8);
        assert_eq!(config.sync.backoff_min, Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = CoreConfigBuilder::new()
            .backoff(Duration::from_secs(5), Duration::from_secs(1))
            .build();
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "sync.backoff_min");
    }

    #[test]
    fn test_validate_rejects_zero_retain() {
        let config = CoreConfigBuilder::new().snapshot_retain(0).build();
        assert_eq!(config.validate().unwrap_err().field, "snapshot.retain");
    }

    #[test]
    fn test_validate_rejects_tiny_segments() {
        let config = CoreConfigBuilder::new().max_segment_bytes(16).build();
        assert_eq!(config.validate().unwrap_err().field, "log.max_segment_bytes");
    }
}
