//! The control stream builder.
//!
//! A [`ControlStream`] hands out word regions from a chain of fixed-size
//! buffer objects. When a region does not fit before the reserved tail of
//! the current buffer, a new buffer is allocated and the old one is closed
//! with a link to it. Words emitted since the last relocation mark are
//! moved to the start of the new buffer so one state update never straddles
//! two buffers.
//!
//! Deferred streams are built in host memory with no links and are later
//! copied into a graphics stream with [`ControlStream::copy_deferred_into`].
//!
//! ## Error handling
//!
//! The first error a stream hits is recorded and returned from every later
//! call, so callers can emit a whole sequence and check the status once.

use std::fmt;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use gx_common::{BufferObject, CsbConfig, DeviceAddress, DeviceMemory, HostMapping, MemoryDomain};
use parking_lot::{MappedMutexGuard, MutexGuard};
use tracing::{debug, trace, warn};

use crate::error::StreamError;
use crate::words::{ControlWord, LINK_BYTES, MAX_PACKET_WORDS, WORD_SIZE};

// ---------------------------------------------------------------------------
// Stream type and states
// ---------------------------------------------------------------------------

/// Which parser consumes the stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Geometry (VDM) stream; supports returning links.
    Graphics,
    /// Compute (CDM) stream.
    Compute,
    /// Host-side graphics stream, copied into a device stream later.
    GraphicsDeferred,
}

impl StreamType {
    pub fn is_deferred(self) -> bool {
        self == Self::GraphicsDeferred
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Graphics => "graphics",
            Self::Compute => "compute",
            Self::GraphicsDeferred => "deferred graphics",
        })
    }
}

/// Relocation mark lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocationMarkState {
    /// No mark was ever set.
    Unset,
    /// Marked; nothing has been moved yet.
    Set,
    /// Marked, and the marked words were moved by at least one extend.
    SetAndConsumed,
    /// A mark was set and cleared since.
    Cleared,
}

impl RelocationMarkState {
    pub fn is_set(self) -> bool {
        matches!(self, Self::Set | Self::SetAndConsumed)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum StreamState {
    Active,
    Finished,
}

// ---------------------------------------------------------------------------
// Allocated region
// ---------------------------------------------------------------------------

enum Region<'a> {
    Device(MappedMutexGuard<'a, [u8]>),
    Host(&'a mut [u8]),
}

/// Words handed out by [`ControlStream::allocate`].
///
/// Holds the buffer lock of a device stream; drop it before the next call on
/// the stream.
pub struct StreamWords<'a> {
    region: Region<'a>,
}

impl StreamWords<'_> {
    fn bytes(&mut self) -> &mut [u8] {
        match &mut self.region {
            Region::Device(guard) => &mut **guard,
            Region::Host(slice) => &mut **slice,
        }
    }

    /// Length in words.
    pub fn len(&self) -> usize {
        let bytes = match &self.region {
            Region::Device(guard) => guard.len(),
            Region::Host(slice) => slice.len(),
        };
        bytes / WORD_SIZE as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store one word. Panics if `index` is out of range, like slice indexing.
    pub fn set(&mut self, index: usize, word: u32) {
        let at = index * WORD_SIZE as usize;
        LittleEndian::write_u32(&mut self.bytes()[at..at + 4], word);
    }

    /// Store `words` starting at word `index`.
    pub fn write_at(&mut self, index: usize, words: &[u32]) {
        let at = index * WORD_SIZE as usize;
        LittleEndian::write_u32_into(words, &mut self.bytes()[at..at + words.len() * 4]);
    }

    /// Store `words` from the start of the region.
    pub fn write(&mut self, words: &[u32]) {
        self.write_at(0, words);
    }

    fn copy_bytes(&mut self, bytes: &[u8]) {
        self.bytes()[..bytes.len()].copy_from_slice(bytes);
    }
}

// ---------------------------------------------------------------------------
// Control stream
// ---------------------------------------------------------------------------

/// Growable, self-linking command stream.
pub struct ControlStream {
    memory: Arc<dyn DeviceMemory>,
    config: CsbConfig,
    stream_type: StreamType,
    state: StreamState,
    status: Result<(), StreamError>,

    /// Owned buffers in chain order. Empty for deferred streams.
    buffers: Vec<BufferObject>,
    /// Mapping of the last buffer.
    current: Option<HostMapping>,
    /// Host storage of a deferred stream.
    host: Vec<u8>,

    /// Write cursor, byte offset in the current buffer (or host storage).
    next: u64,
    /// Last byte offset a region may reach in the current buffer.
    end: u64,
    relocation_mark: u64,
    mark_state: RelocationMarkState,

    unmarked_extends: u32,
    unmarked_logged: bool,
}

impl ControlStream {
    /// Create an empty stream. Device streams allocate their first buffer on
    /// the first [`allocate`](Self::allocate).
    pub fn new(
        memory: Arc<dyn DeviceMemory>,
        config: CsbConfig,
        stream_type: StreamType,
    ) -> Result<Self, StreamError> {
        config.validate(LINK_BYTES)?;
        trace!(%stream_type, bo_size = config.bo_size, "Created control stream");
        Ok(Self {
            memory,
            config,
            stream_type,
            state: StreamState::Active,
            status: Ok(()),
            buffers: Vec::new(),
            current: None,
            host: Vec::new(),
            next: 0,
            end: 0,
            relocation_mark: 0,
            mark_state: RelocationMarkState::Unset,
            unmarked_extends: 0,
            unmarked_logged: false,
        })
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// First recorded error, if any.
    pub fn status(&self) -> Result<(), StreamError> {
        self.status.clone()
    }

    pub fn relocation_mark_state(&self) -> RelocationMarkState {
        self.mark_state
    }

    /// Bytes a region may occupy in one buffer: the buffer minus the link
    /// and guard tail.
    pub fn buffer_capacity(&self) -> u64 {
        self.config.bo_size - LINK_BYTES - self.config.guard_size
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffers(&self) -> &[BufferObject] {
        &self.buffers
    }

    /// Extends that had no relocation mark to carry.
    pub fn unmarked_extends(&self) -> u32 {
        self.unmarked_extends
    }

    /// Write cursor within the current buffer, or the host length of a
    /// deferred stream.
    pub fn offset(&self) -> u64 {
        self.next
    }

    /// Device address the stream parser starts at.
    pub fn start_address(&self) -> DeviceAddress {
        self.buffers
            .first()
            .map(BufferObject::address)
            .unwrap_or(DeviceAddress::NULL)
    }

    pub fn is_empty(&self) -> bool {
        if self.stream_type.is_deferred() {
            self.host.is_empty()
        } else {
            self.buffers.is_empty() || (self.buffers.len() == 1 && self.next == 0)
        }
    }

    /// Host bytes of a deferred stream.
    pub fn deferred_bytes(&self) -> &[u8] {
        &self.host
    }

    fn check_active(&self) -> Result<(), StreamError> {
        self.status.clone()?;
        if self.state == StreamState::Finished {
            return Err(StreamError::Finished);
        }
        Ok(())
    }

    /// Record `err` unless an earlier error is already recorded; returns the
    /// recorded error.
    fn fail(&mut self, err: StreamError) -> StreamError {
        match &self.status {
            Err(first) => first.clone(),
            Ok(()) => {
                warn!(stream_type = %self.stream_type, error = %err, "Control stream failed");
                self.status = Err(err.clone());
                err
            }
        }
    }

    fn wrong_type(&mut self, op: &'static str) -> StreamError {
        self.fail(StreamError::WrongStreamType {
            op,
            stream_type: self.stream_type,
        })
    }

    // -----------------------------------------------------------------------
    // Relocation marks
    // -----------------------------------------------------------------------

    /// Start an atomic emission. Misuse is recorded in the stream status.
    pub fn set_relocation_mark(&mut self) {
        if self.mark_state.is_set() {
            self.fail(StreamError::RelocationMark("mark set twice without a clear"));
            return;
        }
        self.relocation_mark = self.next;
        self.mark_state = RelocationMarkState::Set;
    }

    /// End an atomic emission. Misuse is recorded in the stream status.
    pub fn clear_relocation_mark(&mut self) {
        if !self.mark_state.is_set() {
            self.fail(StreamError::RelocationMark("clear without a set mark"));
            return;
        }
        self.mark_state = RelocationMarkState::Cleared;
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Reserve `words` words at the write cursor, extending the stream when
    /// they do not fit the current buffer.
    pub fn allocate(&mut self, words: usize) -> Result<StreamWords<'_>, StreamError> {
        self.check_active()?;
        let bytes = words as u64 * WORD_SIZE;

        if self.stream_type.is_deferred() {
            let offset = self.host.len();
            self.host.resize(offset + bytes as usize, 0);
            self.next = self.host.len() as u64;
            return Ok(StreamWords {
                region: Region::Host(&mut self.host[offset..]),
            });
        }

        if self.mark_state == RelocationMarkState::Cleared && !self.unmarked_logged {
            self.unmarked_logged = true;
            debug!(stream_type = %self.stream_type, "CS memory without relocation mark detected");
        }

        if self.current.is_none() || self.next + bytes > self.end {
            if let Err(err) = self.extend(bytes) {
                return Err(self.fail(err));
            }
        }

        let start = self.next as usize;
        self.next += bytes;
        let range = start..start + bytes as usize;
        match &self.current {
            Some(mapping) => Ok(StreamWords {
                region: Region::Device(MutexGuard::map(mapping.lock(), move |b| &mut b[range])),
            }),
            None => Err(StreamError::Finished),
        }
    }

    /// Chain a new buffer after the current one, carrying the marked words.
    fn extend(&mut self, needed: u64) -> Result<(), StreamError> {
        let capacity = self.buffer_capacity();
        let marked = self.mark_state.is_set();
        let carry = match &self.current {
            Some(_) if marked => self.next - self.relocation_mark,
            _ => 0,
        };
        if carry + needed > capacity {
            return Err(StreamError::EmissionTooLarge {
                needed: carry + needed,
                capacity,
            });
        }

        let bo = BufferObject::new(
            &self.memory,
            self.config.bo_size,
            self.config.alignment,
            MemoryDomain::Gart,
        )?;
        let mapping = bo.map()?.clone();

        if let Some(old) = self.current.clone() {
            if marked {
                if carry > 0 {
                    let moved = old.read_vec(self.relocation_mark, carry)?;
                    mapping.write(0, &moved)?;
                    if self.config.zero_after_move || cfg!(debug_assertions) {
                        old.fill(self.relocation_mark, carry, 0)?;
                    }
                }
                self.next = self.relocation_mark;
                self.mark_state = RelocationMarkState::SetAndConsumed;
            } else {
                self.unmarked_extends += 1;
                warn!(
                    stream_type = %self.stream_type,
                    buffer = self.buffers.len(),
                    "Stream buffer extended outside a relocation mark"
                );
            }

            // The reserved tail always has room for the link.
            self.end += LINK_BYTES;
            let link = ControlWord::Link {
                target: bo.address(),
                with_return: false,
            }
            .encode();
            old.write_u32s(self.next, link.as_slice())?;
        }

        debug!(
            stream_type = %self.stream_type,
            buffer = self.buffers.len(),
            address = %bo.address(),
            carried = carry,
            "Extended control stream"
        );

        self.buffers.push(bo);
        self.current = Some(mapping);
        self.next = carry;
        self.end = capacity;
        if marked {
            self.relocation_mark = 0;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------------

    /// Append `words` at the write cursor.
    pub fn emit(&mut self, words: &[u32]) -> Result<(), StreamError> {
        self.allocate(words.len())?.write(words);
        Ok(())
    }

    /// Append `words` as one atomic emission bracketed by a relocation mark.
    pub fn emit_marked(&mut self, words: &[u32]) -> Result<(), StreamError> {
        self.set_relocation_mark();
        let result = self.emit(words);
        self.clear_relocation_mark();
        result.and(self.status())
    }

    /// Append a method packet: header plus payload, never split.
    pub fn emit_packet(&mut self, method: u16, payload: &[u32]) -> Result<(), StreamError> {
        if payload.len() > MAX_PACKET_WORDS {
            let err = StreamError::EmissionTooLarge {
                needed: payload.len() as u64 * WORD_SIZE,
                capacity: MAX_PACKET_WORDS as u64 * WORD_SIZE,
            };
            return Err(self.fail(err));
        }
        let header = ControlWord::packet(method, payload.len()).encode();

        self.set_relocation_mark();
        let result = self.allocate(1 + payload.len()).map(|mut region| {
            region.write(header.as_slice());
            region.write_at(1, payload);
        });
        self.clear_relocation_mark();
        result.and(self.status())
    }

    /// Jump to `target`; with `with_return` the parser comes back after the
    /// target stream returns. Returning links are graphics-only.
    pub fn emit_link(&mut self, target: DeviceAddress, with_return: bool) -> Result<(), StreamError> {
        self.check_active()?;
        match self.stream_type {
            StreamType::GraphicsDeferred => return Err(self.wrong_type("emit_link")),
            StreamType::Compute if with_return => return Err(self.wrong_type("emit_link with return")),
            _ => {}
        }
        let link = ControlWord::Link {
            target,
            with_return,
        }
        .encode();
        self.emit_marked(link.as_slice())
    }

    /// End a graphics sub-stream. Returns the stream status.
    pub fn emit_return(&mut self) -> Result<(), StreamError> {
        self.check_active()?;
        if self.stream_type == StreamType::Compute {
            return Err(self.wrong_type("emit_return"));
        }
        self.emit_marked(ControlWord::Return.encode().as_slice())
    }

    /// End the stream. Returns the stream status.
    pub fn emit_terminate(&mut self) -> Result<(), StreamError> {
        self.check_active()?;
        if self.stream_type.is_deferred() {
            return Err(self.wrong_type("emit_terminate"));
        }
        self.emit_marked(ControlWord::Terminate.encode().as_slice())
    }

    /// Copy this fully built deferred stream into the graphics stream `dst`.
    ///
    /// The copy must fit one empty buffer of `dst`; larger streams fail with
    /// [`StreamError::DeferredTooLarge`]. Errors are recorded in `dst`.
    pub fn copy_deferred_into(&self, dst: &mut ControlStream) -> Result<(), StreamError> {
        dst.check_active()?;
        if !self.stream_type.is_deferred() {
            return Err(dst.fail(StreamError::WrongStreamType {
                op: "copy_deferred_into source",
                stream_type: self.stream_type,
            }));
        }
        if dst.stream_type != StreamType::Graphics {
            return Err(dst.wrong_type("copy_deferred_into destination"));
        }
        if let Err(err) = self.status() {
            return Err(dst.fail(err));
        }

        let size = self.host.len() as u64;
        let limit = dst.buffer_capacity();
        if size >= limit {
            return Err(dst.fail(StreamError::DeferredTooLarge { size, limit }));
        }

        dst.set_relocation_mark();
        let result = dst
            .allocate((size / WORD_SIZE) as usize)
            .map(|mut region| region.copy_bytes(&self.host));
        dst.clear_relocation_mark();
        result.and(dst.status())
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Hand over the buffer chain and finish the stream.
    pub fn bake(&mut self) -> Result<Vec<BufferObject>, StreamError> {
        if self.state == StreamState::Finished {
            return Err(StreamError::Finished);
        }
        if self.stream_type.is_deferred() {
            return Err(self.wrong_type("bake"));
        }
        let status = self.status();
        let buffers = std::mem::take(&mut self.buffers);
        self.finish();
        status.map(|()| buffers)
    }

    /// Release every buffer and finish the stream.
    pub fn finish(&mut self) {
        if self.state == StreamState::Finished {
            return;
        }
        trace!(
            stream_type = %self.stream_type,
            buffers = self.buffers.len(),
            "Finished control stream"
        );
        self.buffers.clear();
        self.current = None;
        self.host = Vec::new();
        self.next = 0;
        self.end = 0;
        self.state = StreamState::Finished;
    }
}

impl fmt::Debug for ControlStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlStream")
            .field("stream_type", &self.stream_type)
            .field("state", &self.state)
            .field("status", &self.status)
            .field("buffers", &self.buffers.len())
            .field("next", &self.next)
            .field("end", &self.end)
            .field("mark_state", &self.mark_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gx_common::SystemMemory;

    fn stream(stream_type: StreamType, bo_size: u64) -> (Arc<SystemMemory>, ControlStream) {
        let system = Arc::new(SystemMemory::new());
        let memory: Arc<dyn DeviceMemory> = system.clone();
        let config = CsbConfig {
            bo_size,
            ..CsbConfig::default()
        };
        (system, ControlStream::new(memory, config, stream_type).unwrap())
    }

    #[test]
    fn first_allocation_creates_first_buffer_without_link() {
        let (system, mut csb) = stream(StreamType::Graphics, 256);
        assert!(csb.is_empty());
        assert_eq!(csb.start_address(), DeviceAddress::NULL);

        csb.emit_marked(&[1, 2, 3]).unwrap();
        assert_eq!(csb.buffer_count(), 1);
        assert_eq!(system.live_allocations(), 1);
        assert!(!csb.is_empty());
        assert_eq!(csb.start_address(), csb.buffers()[0].address());
        assert_eq!(csb.buffers()[0].map().unwrap().read_u32s(0, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn rejects_config_without_room_for_tail() {
        let memory: Arc<dyn DeviceMemory> = Arc::new(SystemMemory::new());
        let config = CsbConfig {
            bo_size: 64,
            guard_size: 64,
            ..CsbConfig::default()
        };
        assert!(matches!(
            ControlStream::new(memory, config, StreamType::Compute),
            Err(StreamError::Config(_))
        ));
    }

    #[test]
    fn mark_misuse_is_recorded() {
        let (_system, mut csb) = stream(StreamType::Compute, 256);
        csb.clear_relocation_mark();
        assert_eq!(
            csb.status(),
            Err(StreamError::RelocationMark("clear without a set mark"))
        );
        // Later calls replay the first error.
        assert_eq!(
            csb.emit(&[0]),
            Err(StreamError::RelocationMark("clear without a set mark"))
        );
    }

    #[test]
    fn double_set_is_recorded() {
        let (_system, mut csb) = stream(StreamType::Graphics, 256);
        csb.set_relocation_mark();
        csb.set_relocation_mark();
        assert!(matches!(csb.status(), Err(StreamError::RelocationMark(_))));
    }

    #[test]
    fn unmarked_overflow_carries_nothing() {
        let (_system, mut csb) = stream(StreamType::Compute, 256);
        let capacity_words = (csb.buffer_capacity() / WORD_SIZE) as usize;
        csb.emit(&vec![7; capacity_words]).unwrap();
        csb.emit(&[9]).unwrap();
        assert_eq!(csb.buffer_count(), 2);
        assert_eq!(csb.unmarked_extends(), 1);
        assert_eq!(csb.offset(), 4);
    }

    #[test]
    fn link_and_terminate_stream_type_rules() {
        let (_system, mut compute) = stream(StreamType::Compute, 256);
        assert!(matches!(
            compute.emit_link(DeviceAddress(0x1000), true),
            Err(StreamError::WrongStreamType { .. })
        ));

        let (_system, mut compute) = stream(StreamType::Compute, 256);
        compute.emit_link(DeviceAddress(0x1000), false).unwrap();
        assert!(matches!(
            compute.emit_return(),
            Err(StreamError::WrongStreamType { .. })
        ));

        let (_system, mut deferred) = stream(StreamType::GraphicsDeferred, 256);
        assert!(matches!(
            deferred.emit_terminate(),
            Err(StreamError::WrongStreamType { .. })
        ));

        let (_system, mut deferred) = stream(StreamType::GraphicsDeferred, 256);
        deferred.emit_return().unwrap();
        assert_eq!(deferred.deferred_bytes().len(), 4);
        assert!(matches!(
            deferred.bake(),
            Err(StreamError::WrongStreamType { op: "bake", .. })
        ));
    }

    #[test]
    fn finish_releases_buffers_and_blocks_emission() {
        let (system, mut csb) = stream(StreamType::Graphics, 256);
        csb.emit_marked(&[1]).unwrap();
        csb.finish();
        assert_eq!(system.live_allocations(), 0);
        assert_eq!(csb.emit(&[1]), Err(StreamError::Finished));
        assert_eq!(csb.bake().unwrap_err(), StreamError::Finished);
    }

    #[test]
    fn packet_larger_than_header_limit_fails() {
        let (_system, mut csb) = stream(StreamType::Compute, 64 * 1024);
        let payload = vec![0; MAX_PACKET_WORDS + 1];
        assert!(matches!(
            csb.emit_packet(1, &payload),
            Err(StreamError::EmissionTooLarge { .. })
        ));
    }
}
