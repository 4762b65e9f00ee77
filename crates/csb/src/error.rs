//! Control stream errors.

use gx_common::{ConfigError, GpuError};
use thiserror::Error;

use crate::stream::StreamType;

/// Errors recorded by a [`ControlStream`](crate::ControlStream).
///
/// A stream keeps the first error it hits and returns it from every later
/// call, so the type is `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Stream buffer allocation failed: {0}")]
    OutOfMemory(#[from] GpuError),

    #[error("Deferred stream of {size} bytes exceeds the {limit}-byte single buffer copy limit")]
    DeferredTooLarge { size: u64, limit: u64 },

    #[error("Marked emission of {needed} bytes cannot fit a {capacity}-byte stream buffer")]
    EmissionTooLarge { needed: u64, capacity: u64 },

    #[error("{op} is not valid on a {stream_type} stream")]
    WrongStreamType {
        op: &'static str,
        stream_type: StreamType,
    },

    #[error("Relocation mark misuse: {0}")]
    RelocationMark(&'static str),

    #[error("Control stream already finished")]
    Finished,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
