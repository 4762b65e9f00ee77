//! Decoder error types (thiserror-based).

use gx_common::{ConfigError, GpuError, VideoCodec};
use gx_csb::StreamError;
use thiserror::Error;

use crate::queue::Engine;

/// Errors returned by a [`DecoderSession`](crate::DecoderSession).
///
/// Reference slot mismatches are not errors: they are logged, counted and
/// the frame continues with a null reference.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame {open} is still open; end it before beginning another")]
    InvalidSequence { open: u64 },

    #[error("No frame is open")]
    NoFrameOpen,

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Picture is {got} but the session decodes {expected}")]
    CodecMismatch { expected: VideoCodec, got: VideoCodec },

    #[error("Too many reference frames: requested {requested}, maximum {max}")]
    TooManyReferences { requested: u32, max: u32 },

    #[error("No reference slot free for frame {sequence}")]
    NoReferenceSlot { sequence: u64 },

    #[error("Bitstream overrun: {needed} bytes needed, {capacity} available")]
    Overrun { needed: u64, capacity: u64 },

    #[error("Plane layout of {required} bytes overshoots reference stride {stride}")]
    StrideOverflow { required: u64, stride: u64 },

    #[error("Timed out waiting for {engine} to complete frame {sequence}")]
    FenceTimeout { engine: Engine, sequence: u64 },

    #[error("Device resource exhausted: {0}")]
    ResourceExhausted(#[from] GpuError),

    #[error("Command stream error: {0}")]
    Stream(#[from] StreamError),
}

impl DecodeError {
    /// Caller errors: surfaced synchronously and not worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidSequence { .. }
                | Self::NoFrameOpen
                | Self::Configuration(_)
                | Self::CodecMismatch { .. }
                | Self::TooManyReferences { .. }
        )
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<ConfigError> for DecodeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid(message) => Self::Configuration(message),
            ConfigError::TooManyReferences { requested, max } => {
                Self::TooManyReferences { requested, max }
            }
        }
    }
}

/// Convenience Result type for decoder operations.
pub type DecodeResult<T> = Result<T, DecodeError>;
