//! Crate-wide error types: one small `thiserror` enum per failure domain,
//! composed via `#[from]` into a top-level enum per consuming module.

use thiserror::Error;

/// Caller misuse of [`crate::buffer::DiskBuffer`].
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("iov is {got} bytes, expected {expected} bytes for {sectors} sector(s)")]
    IovLengthMismatch {
        expected: usize,
        got: usize,
        sectors: u32,
    },
}

/// A failed operation against the backing block device.
#[derive(Debug, Error)]
#[error("backing device I/O failed: {0}")]
pub struct BackingIoError(#[from] pub std::io::Error);

/// A `CheckpointChannel` framing violation. Always fatal: the channel is
/// not resynchronizable after one of these.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected tag: expected {expected:?}, got {got:#x}")]
    UnexpectedTag { expected: Option<u64>, got: u64 },
    #[error("unknown tag value {0:#x}")]
    UnknownTag(u64),
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `DriverConfig` validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("mode=secondary requires an `export` name")]
    MissingExport,
    #[error("sector_size and cluster_sectors must both be non-zero")]
    InvalidGeometry,
}

/// Top-level error returned by `ReplicationDriver` operations.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    BackingIo(#[from] BackingIoError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("illegal mode transition: {0}")]
    ModeTransition(&'static str),
    #[error("backing device is read-only")]
    ReadOnly,
    #[error("checkpoint refused: a prior COW operation failed and is latched")]
    Latched,
}

/// Error surfaced by the checkpoint coordinator loops.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("VM state serialization failed: {0}")]
    Serialize(#[source] std::io::Error),
    #[error("VM state deserialization failed: {0}")]
    Deserialize(#[source] std::io::Error),
    #[error("nic proxy operation failed: {0}")]
    Proxy(#[source] std::io::Error),
}
