//! Error types for paneflow.

use thiserror::Error;

/// Result type alias using paneflow's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for paneflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Memory allocation failed (heap or dma-heap).
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// A buffer failed validation or does not belong to the pool.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// No buffer available, or an injection was refused at capacity.
    #[error("pool exhausted: no buffer available")]
    PoolExhausted,

    /// An API was used outside its contract (caller bug, not pool state).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The operation is not supported by this backend.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A frame index past the end of a bounded source.
    #[error("frame {frame} out of range (total {total})")]
    OutOfRange {
        /// Requested frame index.
        frame: u64,
        /// Total frames in the source.
        total: u64,
    },

    /// A bounded wait elapsed without the condition becoming true.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// Display device error (open, ioctl, mmap of the framebuffer).
    #[error("display device error: {0}")]
    Device(String),

    /// Network stream error (RTSP session, decode).
    #[error("stream error: {0}")]
    Stream(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
