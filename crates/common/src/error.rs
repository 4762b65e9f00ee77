//! Device-level error types (thiserror-based).

use thiserror::Error;

/// Errors from the device memory allocator and submission queues.
///
/// `Clone` because command stream builders record the first failure and hand
/// it back from every later call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("GPU memory allocation failed: {size} bytes")]
    AllocFailed { size: u64 },

    #[error("Out of device memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("Invalid allocation alignment: {0}")]
    InvalidAlignment(u64),

    #[error("Buffer object has no host mapping")]
    NotMapped,

    #[error("Mapping access out of bounds: offset {offset} + {len} bytes exceeds {size}")]
    MappingOutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Submission to {queue} failed: {reason}")]
    Submit { queue: String, reason: String },
}

/// Convenience Result type for device operations.
pub type GpuResult<T> = Result<T, GpuError>;

/// Configuration rejected before any device work is done.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Too many reference frames: requested {requested}, hardware maximum {max}")]
    TooManyReferences { requested: u32, max: u32 },
}
