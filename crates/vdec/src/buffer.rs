//! Decoded picture containers.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use gx_common::{BufferObject, DeviceAddress, DeviceMemory, GpuResult, MemoryDomain};
use serde::Serialize;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`VideoBuffer`]; never reused within a process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vb#{}", self.0)
    }
}

const NO_SLOT: u32 = u32::MAX;

/// A decoded picture: per-plane surfaces plus the reference slot the decoder
/// last assigned to it.
///
/// Shared between the decoder and whoever displays the picture, so the slot
/// index is interior-mutable.
pub struct VideoBuffer {
    id: BufferId,
    width: u32,
    height: u32,
    planes: Vec<BufferObject>,
    valid_ref: AtomicU32,
}

impl VideoBuffer {
    /// Wrap existing plane surfaces.
    pub fn from_planes(width: u32, height: u32, planes: Vec<BufferObject>) -> Arc<Self> {
        Arc::new(Self {
            id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
            width,
            height,
            planes,
            valid_ref: AtomicU32::new(NO_SLOT),
        })
    }

    /// Allocate NV12 surfaces: a luma plane and an interleaved chroma plane.
    pub fn nv12(memory: &Arc<dyn DeviceMemory>, width: u32, height: u32) -> GpuResult<Arc<Self>> {
        let luma = u64::from(width) * u64::from(height);
        let planes = vec![
            BufferObject::new(memory, luma, 0x100, MemoryDomain::Vram)?,
            BufferObject::new(memory, luma.div_ceil(2), 0x100, MemoryDomain::Vram)?,
        ];
        Ok(Self::from_planes(width, height, planes))
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn planes(&self) -> &[BufferObject] {
        &self.planes
    }

    pub fn plane_addresses(&self) -> Vec<DeviceAddress> {
        self.planes.iter().map(BufferObject::address).collect()
    }

    /// Reference slot last assigned by a decoder, if any.
    pub fn valid_ref(&self) -> Option<u32> {
        match self.valid_ref.load(Ordering::Relaxed) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }

    pub(crate) fn set_valid_ref(&self, slot: u32) {
        self.valid_ref.store(slot, Ordering::Relaxed);
    }
}

impl fmt::Debug for VideoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoBuffer")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("planes", &self.planes.len())
            .field("valid_ref", &self.valid_ref())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gx_common::SystemMemory;

    #[test]
    fn ids_are_unique_and_slot_starts_unassigned() {
        let a = VideoBuffer::from_planes(16, 16, Vec::new());
        let b = VideoBuffer::from_planes(16, 16, Vec::new());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.valid_ref(), None);
        a.set_valid_ref(3);
        assert_eq!(a.valid_ref(), Some(3));
    }

    #[test]
    fn nv12_planes() {
        let system = Arc::new(SystemMemory::new());
        let memory: Arc<dyn DeviceMemory> = system.clone();
        let buffer = VideoBuffer::nv12(&memory, 63, 33).unwrap();
        assert_eq!(buffer.planes().len(), 2);
        assert_eq!(buffer.planes()[0].size(), 63 * 33);
        assert_eq!(buffer.planes()[1].size(), 63 * 33 / 2 + 1);
        drop(buffer);
        assert_eq!(system.live_allocations(), 0);
    }
}
