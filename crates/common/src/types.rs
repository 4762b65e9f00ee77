//! Newtypes shared by every driver crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A GPU virtual address.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub const NULL: Self = Self(0);

    /// Address `bytes` past this one.
    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Upper 32 bits.
    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Lower 32 bits.
    pub fn low(self) -> u32 {
        self.0 as u32
    }

    /// Address in 256-byte units, the granularity the video engines take.
    pub fn shr8(self) -> u32 {
        (self.0 >> 8) as u32
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:010x}", self.0)
    }
}

/// Memory placement for a buffer object.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryDomain {
    /// Device-local memory.
    #[default]
    Vram,
    /// System memory visible to the GPU through the aperture; CPU mapped.
    Gart,
}

/// Align `value` up to `align`, which must be a power of two.
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
