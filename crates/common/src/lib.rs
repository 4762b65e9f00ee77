//! `gx-common`: Shared types for the gx driver core.
//!
//! This crate is the foundation the command stream builder and the video
//! decoder both depend on:
//!
//! - **Memory**: `DeviceMemory`, `BufferObject`, `HostMapping`, `SystemMemory`
//! - **Types**: `DeviceAddress`, `MemoryDomain`
//! - **Codecs**: `VideoCodec`, `VideoProfile`
//! - **Errors**: `GpuError`, `ConfigError` (thiserror-based)
//! - **Config**: `DecoderConfig`, `CsbConfig`

pub mod codec;
pub mod config;
pub mod error;
pub mod memory;
pub mod types;

pub use codec::{VideoCodec, VideoProfile};
pub use config::{CsbConfig, DecoderConfig, DEFAULT_RING_DEPTH, MAX_REFERENCES};
pub use error::{ConfigError, GpuError, GpuResult};
pub use memory::{AddressSpace, BufferObject, DeviceMemory, HostMapping, RawAllocation, SystemMemory};
pub use types::{align_up, DeviceAddress, MemoryDomain};
