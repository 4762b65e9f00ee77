//! Device memory: buffer objects, host mappings and a system-memory backed
//! allocator.
//!
//! Every consumer allocates through the [`DeviceMemory`] trait and holds the
//! result as a [`BufferObject`], which releases its allocation on drop.
//! [`SystemMemory`] backs each allocation with host memory and hands out a
//! fake GPU virtual address range. It also implements [`AddressSpace`] so a
//! software device model can follow GPU addresses written into command
//! streams.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::error::{GpuError, GpuResult};
use crate::types::{align_up, DeviceAddress, MemoryDomain};

// ---------------------------------------------------------------------------
// Host mapping
// ---------------------------------------------------------------------------

/// CPU view of a buffer object's memory.
///
/// Cheap to clone; clones alias the same bytes. All accessors are bounds
/// checked and return [`GpuError::MappingOutOfBounds`] instead of panicking.
#[derive(Clone)]
pub struct HostMapping {
    bytes: Arc<Mutex<Box<[u8]>>>,
    len: u64,
}

impl HostMapping {
    /// Zero-filled mapping of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; len].into_boxed_slice())),
            len: len as u64,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether both mappings alias the same memory.
    pub fn ptr_eq(&self, other: &HostMapping) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    fn range(&self, offset: u64, len: u64) -> GpuResult<Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(offset as usize..end as usize),
            _ => Err(GpuError::MappingOutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }

    /// Lock the whole mapping for direct access.
    pub fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.bytes.lock()
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> GpuResult<()> {
        let range = self.range(offset, out.len() as u64)?;
        out.copy_from_slice(&self.bytes.lock()[range]);
        Ok(())
    }

    pub fn read_vec(&self, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        let range = self.range(offset, len)?;
        Ok(self.bytes.lock()[range].to_vec())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> GpuResult<()> {
        let range = self.range(offset, data.len() as u64)?;
        self.bytes.lock()[range].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&self, offset: u64, len: u64, value: u8) -> GpuResult<()> {
        let range = self.range(offset, len)?;
        self.bytes.lock()[range].fill(value);
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst` inside this mapping.
    pub fn copy_within(&self, src: u64, len: u64, dst: u64) -> GpuResult<()> {
        let from = self.range(src, len)?;
        self.range(dst, len)?;
        self.bytes.lock().copy_within(from, dst as usize);
        Ok(())
    }

    pub fn read_u32(&self, offset: u64) -> GpuResult<u32> {
        let range = self.range(offset, 4)?;
        Ok(LittleEndian::read_u32(&self.bytes.lock()[range]))
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> GpuResult<()> {
        let range = self.range(offset, 4)?;
        LittleEndian::write_u32(&mut self.bytes.lock()[range], value);
        Ok(())
    }

    pub fn read_u32s(&self, offset: u64, count: usize) -> GpuResult<Vec<u32>> {
        let range = self.range(offset, count as u64 * 4)?;
        let bytes = self.bytes.lock();
        let mut words = vec![0u32; count];
        LittleEndian::read_u32_into(&bytes[range], &mut words);
        Ok(words)
    }

    pub fn write_u32s(&self, offset: u64, words: &[u32]) -> GpuResult<()> {
        let range = self.range(offset, words.len() as u64 * 4)?;
        LittleEndian::write_u32_into(words, &mut self.bytes.lock()[range]);
        Ok(())
    }
}

impl fmt::Debug for HostMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMapping").field("len", &self.len).finish()
    }
}

// ---------------------------------------------------------------------------
// Allocator traits
// ---------------------------------------------------------------------------

/// One allocation as returned by a [`DeviceMemory`] implementation.
#[derive(Clone, Debug)]
pub struct RawAllocation {
    /// Allocator-specific handle, unique among live allocations.
    pub handle: u64,
    pub address: DeviceAddress,
    pub size: u64,
    pub mapping: Option<HostMapping>,
}

/// Device memory allocator.
pub trait DeviceMemory: Send + Sync {
    /// Allocate `size` bytes aligned to `alignment` in `domain`.
    fn allocate(&self, size: u64, alignment: u64, domain: MemoryDomain) -> GpuResult<RawAllocation>;

    /// Return an allocation. Called exactly once per allocation.
    fn release(&self, allocation: &RawAllocation);
}

/// Resolves GPU virtual addresses to host memory, the way a device model or
/// a command stream dumper would.
pub trait AddressSpace: Send + Sync {
    /// Mapping containing `address` and the offset of `address` within it.
    fn resolve(&self, address: DeviceAddress) -> Option<(HostMapping, u64)>;
}

// ---------------------------------------------------------------------------
// Buffer object
// ---------------------------------------------------------------------------

/// An owned allocation of device memory, released on drop.
pub struct BufferObject {
    raw: RawAllocation,
    domain: MemoryDomain,
    memory: Arc<dyn DeviceMemory>,
}

impl BufferObject {
    /// Allocate a new buffer object from `memory`.
    pub fn new(
        memory: &Arc<dyn DeviceMemory>,
        size: u64,
        alignment: u64,
        domain: MemoryDomain,
    ) -> GpuResult<Self> {
        let raw = memory.allocate(size, alignment, domain)?;
        trace!(
            handle = raw.handle,
            address = %raw.address,
            size,
            ?domain,
            "Allocated buffer object"
        );
        Ok(Self {
            raw,
            domain,
            memory: Arc::clone(memory),
        })
    }

    pub fn address(&self) -> DeviceAddress {
        self.raw.address
    }

    pub fn size(&self) -> u64 {
        self.raw.size
    }

    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }

    pub fn handle(&self) -> u64 {
        self.raw.handle
    }

    /// CPU mapping, if the allocator provided one.
    pub fn map(&self) -> GpuResult<&HostMapping> {
        self.raw.mapping.as_ref().ok_or(GpuError::NotMapped)
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.raw.handle)
            .field("address", &format_args!("{}", self.raw.address))
            .field("size", &self.raw.size)
            .field("domain", &self.domain)
            .field("mapped", &self.raw.mapping.is_some())
            .finish()
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        trace!(handle = self.raw.handle, "Releasing buffer object");
        self.memory.release(&self.raw);
    }
}

// ---------------------------------------------------------------------------
// System memory allocator
// ---------------------------------------------------------------------------

struct LiveAllocation {
    handle: u64,
    size: u64,
    mapping: HostMapping,
}

#[derive(Default)]
struct SystemState {
    next_address: u64,
    next_handle: u64,
    /// Live allocations keyed by base address.
    live: BTreeMap<u64, LiveAllocation>,
    live_bytes: u64,
    peak_bytes: u64,
    total_allocations: u64,
    budget: Option<u64>,
}

/// Host-memory backed [`DeviceMemory`] with a fake GPU address space.
///
/// Every allocation is CPU mapped regardless of domain. An optional byte
/// budget makes allocations fail once exceeded, which is how tests inject
/// out-of-memory conditions.
pub struct SystemMemory {
    state: Mutex<SystemState>,
}

impl SystemMemory {
    /// First address handed out; keeps zero free as the null address.
    pub const BASE_ADDRESS: u64 = 0x1_0000_0000;

    /// Granularity of the fake address space.
    const PAGE_SIZE: u64 = 0x1000;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(SystemState {
                next_address: Self::BASE_ADDRESS,
                next_handle: 1,
                ..SystemState::default()
            }),
        }
    }

    /// Allocator that fails once `budget` live bytes would be exceeded.
    pub fn with_budget(budget: u64) -> Self {
        let memory = Self::new();
        memory.set_budget(Some(budget));
        memory
    }

    pub fn set_budget(&self, budget: Option<u64>) {
        self.state.lock().budget = budget;
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_bytes(&self) -> u64 {
        self.state.lock().live_bytes
    }

    pub fn peak_bytes(&self) -> u64 {
        self.state.lock().peak_bytes
    }

    pub fn total_allocations(&self) -> u64 {
        self.state.lock().total_allocations
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SystemMemory")
            .field("live", &state.live.len())
            .field("live_bytes", &state.live_bytes)
            .field("budget", &state.budget)
            .finish()
    }
}

impl DeviceMemory for SystemMemory {
    fn allocate(&self, size: u64, alignment: u64, domain: MemoryDomain) -> GpuResult<RawAllocation> {
        if size == 0 {
            return Err(GpuError::AllocFailed { size });
        }
        if !alignment.is_power_of_two() {
            return Err(GpuError::InvalidAlignment(alignment));
        }

        let mut state = self.state.lock();
        if let Some(budget) = state.budget {
            if state.live_bytes + size > budget {
                warn!(
                    requested = size,
                    live = state.live_bytes,
                    budget,
                    "System memory budget exhausted"
                );
                return Err(GpuError::OutOfMemory {
                    requested: size,
                    available: budget.saturating_sub(state.live_bytes),
                });
            }
        }

        let address = align_up(state.next_address, alignment.max(Self::PAGE_SIZE));
        state.next_address = address + align_up(size, Self::PAGE_SIZE);
        let handle = state.next_handle;
        state.next_handle += 1;

        let mapping = HostMapping::zeroed(size as usize);
        state.live.insert(
            address,
            LiveAllocation {
                handle,
                size,
                mapping: mapping.clone(),
            },
        );
        state.live_bytes += size;
        state.peak_bytes = state.peak_bytes.max(state.live_bytes);
        state.total_allocations += 1;

        debug!(handle, address = format_args!("0x{:x}", address), size, ?domain, "System allocation");

        Ok(RawAllocation {
            handle,
            address: DeviceAddress(address),
            size,
            mapping: Some(mapping),
        })
    }

    fn release(&self, allocation: &RawAllocation) {
        let mut state = self.state.lock();
        match state.live.remove(&allocation.address.0) {
            Some(live) if live.handle == allocation.handle => {
                state.live_bytes -= live.size;
            }
            Some(live) => {
                warn!(
                    handle = allocation.handle,
                    found = live.handle,
                    "Release of mismatched allocation handle"
                );
                state.live.insert(allocation.address.0, live);
            }
            None => warn!(handle = allocation.handle, "Release of unknown allocation"),
        }
    }
}

impl AddressSpace for SystemMemory {
    fn resolve(&self, address: DeviceAddress) -> Option<(HostMapping, u64)> {
        let state = self.state.lock();
        let (base, live) = state.live.range(..=address.0).next_back()?;
        let offset = address.0 - base;
        (offset < live.size).then(|| (live.mapping.clone(), offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> (Arc<SystemMemory>, Arc<dyn DeviceMemory>) {
        let system = Arc::new(SystemMemory::new());
        let dyn_memory: Arc<dyn DeviceMemory> = system.clone();
        (system, dyn_memory)
    }

    #[test]
    fn buffer_object_released_on_drop() {
        let (system, memory) = memory();
        {
            let bo = BufferObject::new(&memory, 4096, 64, MemoryDomain::Gart).unwrap();
            assert_eq!(bo.size(), 4096);
            assert!(bo.address().0 >= SystemMemory::BASE_ADDRESS);
            assert_eq!(system.live_allocations(), 1);
        }
        assert_eq!(system.live_allocations(), 0);
        assert_eq!(system.live_bytes(), 0);
        assert_eq!(system.total_allocations(), 1);
    }

    #[test]
    fn allocations_respect_alignment_and_do_not_overlap() {
        let (_system, memory) = memory();
        let a = BufferObject::new(&memory, 100, 0x10000, MemoryDomain::Vram).unwrap();
        let b = BufferObject::new(&memory, 100, 64, MemoryDomain::Vram).unwrap();
        assert_eq!(a.address().0 % 0x10000, 0);
        assert!(b.address().0 >= a.address().0 + a.size());
    }

    #[test]
    fn budget_exhaustion_reports_out_of_memory() {
        let system = Arc::new(SystemMemory::with_budget(8192));
        let memory: Arc<dyn DeviceMemory> = system.clone();
        let _a = BufferObject::new(&memory, 8000, 64, MemoryDomain::Gart).unwrap();
        let err = BufferObject::new(&memory, 1000, 64, MemoryDomain::Gart).unwrap_err();
        assert_eq!(
            err,
            GpuError::OutOfMemory {
                requested: 1000,
                available: 192
            }
        );
    }

    #[test]
    fn rejects_zero_size_and_bad_alignment() {
        let (_system, memory) = memory();
        assert!(matches!(
            BufferObject::new(&memory, 0, 64, MemoryDomain::Gart),
            Err(GpuError::AllocFailed { size: 0 })
        ));
        assert!(matches!(
            BufferObject::new(&memory, 64, 48, MemoryDomain::Gart),
            Err(GpuError::InvalidAlignment(48))
        ));
    }

    #[test]
    fn mapping_accessors_are_bounds_checked() {
        let mapping = HostMapping::zeroed(16);
        mapping.write_u32(12, 0xdead_beef).unwrap();
        assert_eq!(mapping.read_u32(12).unwrap(), 0xdead_beef);
        assert!(mapping.write_u32(13, 1).is_err());
        assert!(mapping.read_vec(8, 9).is_err());

        mapping.write_u32s(0, &[1, 2, 3]).unwrap();
        assert_eq!(mapping.read_u32s(0, 3).unwrap(), vec![1, 2, 3]);

        mapping.copy_within(0, 8, 8).unwrap();
        assert_eq!(mapping.read_u32s(8, 2).unwrap(), vec![1, 2]);

        mapping.fill(0, 16, 0).unwrap();
        assert_eq!(mapping.read_vec(0, 16).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn resolve_finds_containing_allocation() {
        let (system, memory) = memory();
        let bo = BufferObject::new(&memory, 256, 64, MemoryDomain::Gart).unwrap();
        bo.map().unwrap().write_u32(0x40, 7).unwrap();

        let (mapping, offset) = system.resolve(bo.address().offset(0x40)).unwrap();
        assert_eq!(offset, 0x40);
        assert_eq!(mapping.read_u32(offset).unwrap(), 7);
        assert!(mapping.ptr_eq(bo.map().unwrap()));

        assert!(system.resolve(bo.address().offset(256)).is_none());
        assert!(system.resolve(DeviceAddress(0x10)).is_none());
    }
}
