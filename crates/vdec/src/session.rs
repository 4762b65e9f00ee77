//! Decoder session: the begin / append / end frame cycle that feeds the
//! BSP, VP and PPP engines.

use std::fmt;
use std::sync::Arc;

use gx_common::{
    BufferObject, CsbConfig, DecoderConfig, DeviceAddress, DeviceMemory, HostMapping, MemoryDomain,
    VideoCodec, VideoProfile,
};
use gx_csb::{ControlStream, StreamType};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::bsp::{
    self, BITSTREAM_OFFSET, BSP_PARAMS_OFFSET, DEFAULT_BSP_SIZE, END_MARKER_LEN,
    STREAM_LENGTH_OFFSET, STREAM_PARAMS_OFFSET, VP_PARAMS_OFFSET, VP_PARAMS_SIZE,
};
use crate::buffer::{BufferId, VideoBuffer};
use crate::comm::COMM_OFFSET;
use crate::error::{DecodeError, DecodeResult};
use crate::fence::{FenceStrategy, FenceTarget, NoFence, PollingFence, FENCE_BUFFER_SIZE};
use crate::geometry::{Geometry, InterSizes, PlaneOffsets};
use crate::methods::Method;
use crate::picture::PictureDesc;
use crate::ppp;
use crate::queue::{Engine, EngineQueues, Submission};
use crate::refs::{FieldCoding, RefResolution, RefTable};
use crate::ring::ScratchRing;
use crate::vp::{self, VpInput};

/// Default size of the BSP to VP intermediate buffer.
pub const DEFAULT_INTER_SIZE: u64 = 4 << 20;

/// Smallest intermediate buffer that leaves one ring unit.
const MIN_INTER_SIZE: u64 = 5 << 8;

/// Engine-visible buffers are addressed in 256-byte units.
const ENGINE_ALIGNMENT: u64 = 0x100;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Running counters of a session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_begun: u64,
    pub frames_ended: u64,
    /// Bitstream bytes appended, excluding end markers.
    pub bytes_appended: u64,
    /// References whose slot no longer held them.
    pub anomalies: u64,
    /// Reference slots taken from a previous picture.
    pub evictions: u64,
    /// Fence waits that were performed (not skipped).
    pub fence_waits: u64,
}

/// What [`DecoderSession::end`] submitted for one frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub sequence: u64,
    pub ring_index: usize,
    /// Bitstream length including the end marker.
    pub bitstream_length: u32,
    pub bsp_caps: u32,
    pub vp_mode: u32,
    pub ppp_mode: u32,
    pub is_reference: bool,
    pub target_slot: u32,
    /// Slot of every named reference; `None` where it resolved to the null
    /// slot.
    pub references: Vec<Option<u32>>,
    pub anomalies: u32,
    pub evicted: Option<BufferId>,
    pub second_field: bool,
}

// ---------------------------------------------------------------------------
// DecoderSession
// ---------------------------------------------------------------------------

/// Open append window of the current frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct WriteCursor {
    sequence: u64,
    /// Next free byte in the frame's bitstream buffer.
    offset: u64,
}

/// A fixed-function decode session for one video stream.
///
/// Owns every buffer object it allocates: a ring of bitstream buffers and a
/// ring of intermediate buffers (both indexed by `sequence % ring_depth`),
/// the reference image holding all decoded reference pictures plus a null
/// slot, and the fence buffer the engines report completion to. All of them
/// are released when the session is dropped.
///
/// A session is driven by a single thread. Engines run asynchronously: the
/// session only submits streams and, when configured, waits on fences.
///
/// # Example
///
/// ```ignore
/// let mut session = DecoderSession::new(config, memory, queues)?;
/// session.begin()?;
/// session.append(&[&slice_data])?;
/// let report = session.end(&picture, &target)?;
/// ```
pub struct DecoderSession {
    config: DecoderConfig,
    codec: VideoCodec,
    geometry: Geometry,
    offsets: PlaneOffsets,
    memory: Arc<dyn DeviceMemory>,
    queues: EngineQueues,
    fence: Box<dyn FenceStrategy>,
    csb_config: CsbConfig,
    /// Sequence number of the most recently begun frame. Starts at 0; the
    /// first frame is 1.
    sequence: u64,
    cursor: Option<WriteCursor>,
    bsp_ring: ScratchRing<BufferObject>,
    inter_ring: ScratchRing<BufferObject>,
    ref_bo: BufferObject,
    ref_stride: u64,
    scratch_size: u64,
    fence_bo: BufferObject,
    refs: RefTable,
    stats: SessionStats,
}

impl DecoderSession {
    /// Create a session with the fence strategy implied by the config:
    /// [`PollingFence`] in debug-fence mode, [`NoFence`] otherwise.
    pub fn new(
        config: DecoderConfig,
        memory: Arc<dyn DeviceMemory>,
        queues: EngineQueues,
    ) -> DecodeResult<Self> {
        let fence: Box<dyn FenceStrategy> = if config.debug_fence {
            Box::new(PollingFence::new(
                config.fence_poll_interval(),
                config.fence_timeout(),
            ))
        } else {
            Box::new(NoFence)
        };
        Self::with_fence(config, memory, queues, fence)
    }

    /// Create a session with an explicit fence strategy.
    ///
    /// # Errors
    /// Returns a configuration error for invalid dimensions, ring depth or
    /// buffer sizes, [`DecodeError::TooManyReferences`] if the profile's
    /// codec cannot track `max_references` pictures, and
    /// [`DecodeError::ResourceExhausted`] if any buffer cannot be allocated.
    pub fn with_fence(
        config: DecoderConfig,
        memory: Arc<dyn DeviceMemory>,
        queues: EngineQueues,
        fence: Box<dyn FenceStrategy>,
    ) -> DecodeResult<Self> {
        config.validate()?;
        let codec = config.profile.codec();
        if config.max_references > codec.max_references() {
            return Err(DecodeError::TooManyReferences {
                requested: config.max_references,
                max: codec.max_references(),
            });
        }

        let geometry = Geometry::new(config.width, config.height);
        let offsets = geometry.plane_offsets()?;

        let bsp_size = config.bsp_size.unwrap_or(DEFAULT_BSP_SIZE);
        if bsp_size <= BITSTREAM_OFFSET + END_MARKER_LEN {
            return Err(DecodeError::config(format!(
                "bitstream buffer of {bsp_size} bytes has no room after its 0x{BITSTREAM_OFFSET:x}-byte header"
            )));
        }
        let inter_size = config.inter_size.unwrap_or(DEFAULT_INTER_SIZE);
        if inter_size < MIN_INTER_SIZE {
            return Err(DecodeError::config(format!(
                "intermediate buffer of {inter_size} bytes is below the {MIN_INTER_SIZE}-byte minimum"
            )));
        }

        let depth = config.effective_ring_depth();
        let bsp_ring = ScratchRing::try_from_fn(depth, |_| {
            BufferObject::new(&memory, bsp_size, ENGINE_ALIGNMENT, MemoryDomain::Gart)
        })?;
        let inter_ring = ScratchRing::try_from_fn(depth, |_| {
            BufferObject::new(&memory, inter_size, ENGINE_ALIGNMENT, MemoryDomain::Vram)
        })?;

        let ref_stride = geometry.ref_stride();
        let scratch_size = if codec == VideoCodec::H264 {
            geometry.h264_scratch_size(config.max_references)
        } else {
            0
        };
        let ref_bo = BufferObject::new(
            &memory,
            geometry.ref_image_size(config.max_references, scratch_size),
            ENGINE_ALIGNMENT,
            MemoryDomain::Vram,
        )?;
        let fence_bo = BufferObject::new(&memory, FENCE_BUFFER_SIZE, ENGINE_ALIGNMENT, MemoryDomain::Gart)?;

        // The driver writes bitstream buffers and reads fences from the CPU.
        for bo in bsp_ring.iter() {
            bo.map()?;
        }
        fence_bo.map()?.fill(0, FENCE_BUFFER_SIZE, 0)?;

        info!(
            codec = codec.display_name(),
            profile = ?config.profile,
            width = config.width,
            height = config.height,
            max_references = config.max_references,
            ring_depth = depth,
            fence = fence.name(),
            ref_stride,
            ref_image = ref_bo.size(),
            "Decoder session created"
        );

        Ok(Self {
            refs: RefTable::new(config.max_references),
            config,
            codec,
            geometry,
            offsets,
            memory,
            queues,
            fence,
            csb_config: CsbConfig::default(),
            sequence: 0,
            cursor: None,
            bsp_ring,
            inter_ring,
            ref_bo,
            ref_stride,
            scratch_size,
            fence_bo,
            stats: SessionStats::default(),
        })
    }

    /// Use `csb_config` for the engine command streams of later frames.
    pub fn set_csb_config(&mut self, csb_config: CsbConfig) -> DecodeResult<()> {
        csb_config.validate(gx_csb::LINK_BYTES)?;
        self.csb_config = csb_config;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Frame cycle
    // -----------------------------------------------------------------------

    /// Open the append window of a new frame.
    ///
    /// Advances the sequence number, selects the ring entry for it, clears
    /// the entry's parameter headers and places the append cursor after
    /// them. If the ring entry was used `ring_depth` frames ago, first waits
    /// for the VP stage of that frame through the fence strategy.
    ///
    /// # Errors
    /// [`DecodeError::InvalidSequence`] if the previous frame was not ended.
    pub fn begin(&mut self) -> DecodeResult<()> {
        if let Some(cursor) = self.cursor {
            return Err(DecodeError::InvalidSequence {
                open: cursor.sequence,
            });
        }

        let sequence = self.sequence + 1;
        let depth = u64::from(self.bsp_ring.depth());
        if sequence > depth {
            self.wait(Engine::Vp, sequence - depth)?;
        }

        let mapping = self.bsp_ring.get(sequence).map()?;
        bsp::reset(mapping, self.config.debug_fence)?;

        self.sequence = sequence;
        self.cursor = Some(WriteCursor {
            sequence,
            offset: BITSTREAM_OFFSET,
        });
        self.stats.frames_begun += 1;
        debug!(sequence, ring_index = self.bsp_ring.index(sequence), "Began frame");
        Ok(())
    }

    /// Append bitstream chunks, in order, to the open frame.
    ///
    /// # Errors
    /// [`DecodeError::NoFrameOpen`] outside a begin/end pair, and
    /// [`DecodeError::Overrun`] if the chunks and the end marker would not
    /// fit the bitstream buffer. On overrun nothing is appended.
    pub fn append(&mut self, chunks: &[&[u8]]) -> DecodeResult<()> {
        let mut cursor = self.cursor.ok_or(DecodeError::NoFrameOpen)?;
        let bo = self.bsp_ring.get(cursor.sequence);

        let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        let needed = cursor.offset + total + END_MARKER_LEN;
        if needed > bo.size() {
            warn!(
                sequence = cursor.sequence,
                needed,
                capacity = bo.size(),
                "Bitstream buffer overrun"
            );
            return Err(DecodeError::Overrun {
                needed,
                capacity: bo.size(),
            });
        }

        let mapping = bo.map()?;
        let mut length = mapping.read_u32(STREAM_LENGTH_OFFSET)?;
        for chunk in chunks {
            mapping.write(cursor.offset, chunk)?;
            cursor.offset += chunk.len() as u64;
            length = length.wrapping_add(chunk.len() as u32);
        }
        mapping.write_u32(STREAM_LENGTH_OFFSET, length)?;

        self.cursor = Some(cursor);
        self.stats.bytes_appended += total;
        trace!(sequence = cursor.sequence, bytes = total, length, "Appended bitstream");
        Ok(())
    }

    /// Close the open frame and submit it to the three engines.
    ///
    /// Validation runs first and leaves the window open, so the caller can
    /// fix the picture and call `end` again. Once the window is closed the
    /// BSP, VP and PPP streams are built and submitted in order; an error
    /// there ends the frame without its remaining stages.
    ///
    /// # Errors
    /// [`DecodeError::NoFrameOpen`], [`DecodeError::CodecMismatch`],
    /// [`DecodeError::TooManyReferences`], [`DecodeError::Overrun`] when the
    /// slices do not fit the intermediate buffer, configuration errors for
    /// pictures the engines cannot take, and submission or stream errors.
    pub fn end(&mut self, picture: &PictureDesc, target: &VideoBuffer) -> DecodeResult<FrameReport> {
        let cursor = self.cursor.ok_or(DecodeError::NoFrameOpen)?;
        let inter = self.validate(picture)?;
        self.cursor = None;

        let sequence = cursor.sequence;
        let ring_index = self.bsp_ring.index(sequence);
        let profile = self.config.profile;
        let bsp_bo = self.bsp_ring.get(sequence);
        let bsp_base = bsp_bo.address();
        let inter_base = self.inter_ring.get(sequence).address();
        let mapping = bsp_bo.map()?.clone();

        // BSP
        let bsp_fence = self.fence_write(Engine::Bsp, sequence);
        let bsp_out = bsp::finish(&mapping, cursor.offset, picture, profile, self.geometry)?;
        let set_inter = Method::SetInter {
            address: inter_base,
            slice_size: inter.slice_size,
            bucket_size: inter.bucket_size,
            ring_size: inter.ring_size,
        };
        self.submit(
            Engine::Bsp,
            sequence,
            &[
                Method::SetComm {
                    address: bsp_base.offset(COMM_OFFSET),
                },
                Method::SetParams {
                    address: bsp_base.offset(BSP_PARAMS_OFFSET),
                },
                Method::SetBitstream {
                    params: bsp_base.offset(STREAM_PARAMS_OFFSET),
                    data: bsp_base.offset(BITSTREAM_OFFSET),
                    length: bsp_out.length,
                },
                set_inter,
                Method::Launch {
                    mode: bsp::mode(picture),
                    caps: bsp_out.caps,
                },
                bsp_fence,
            ],
        )?;

        // References
        let named = picture.references();
        let present: Vec<&VideoBuffer> = named.iter().copied().flatten().map(|b| &**b).collect();
        let assignment = self.refs.handle_references(&present, target, sequence)?;
        let anomalies = assignment.anomalies();
        self.stats.anomalies += u64::from(anomalies);
        if assignment.evicted.is_some() {
            self.stats.evictions += 1;
        }

        let null = self.slot_address(self.refs.null_slot());
        let mut resolved = assignment.references.iter();
        let mut addresses = Vec::with_capacity(named.len());
        let mut slots = Vec::with_capacity(named.len());
        for &entry in &named {
            let resolution = entry.and_then(|_| resolved.next().copied());
            let slot = resolution.and_then(RefResolution::slot);
            slots.push(slot);
            addresses.push(resolution.map(|r| r.slot().map_or(null, |s| self.slot_address(s))));
        }

        let second_field = match picture {
            PictureDesc::H264(p) => {
                let coding = match (p.field_pic_flag, p.bottom_field_flag) {
                    (false, _) => FieldCoding::Frame,
                    (true, false) => FieldCoding::Top,
                    (true, true) => FieldCoding::Bottom,
                };
                self.refs.mark_decoded(assignment.target_slot, coding)
            }
            _ => false,
        };

        // VP
        let target_address = self.slot_address(assignment.target_slot);
        let scratch = (self.scratch_size > 0).then(|| (self.scratch_address(), self.scratch_size));
        let vp_out = vp::build(
            picture,
            &VpInput {
                profile,
                geometry: self.geometry,
                offsets: self.offsets,
                target_slot: assignment.target_slot,
                target: target_address,
                references: &addresses,
                null,
                inter,
                scratch,
                second_field,
            },
        )?;
        vp_out.params.write(&mapping, VP_PARAMS_OFFSET, VP_PARAMS_SIZE)?;

        let mut methods = vec![
            Method::SetComm {
                address: bsp_base.offset(COMM_OFFSET),
            },
            Method::SetParams {
                address: bsp_base.offset(VP_PARAMS_OFFSET),
            },
            set_inter,
            Method::SetTarget {
                slot: assignment.target_slot,
                address: target_address,
            },
        ];
        methods.extend(vp_out.references.iter().enumerate().map(|(index, &address)| {
            Method::SetReference {
                index: index as u32,
                address,
            }
        }));
        if let Some((address, size)) = scratch {
            methods.push(Method::SetScratch {
                address,
                size: (size >> 8) as u32,
            });
        }
        methods.push(Method::Launch {
            mode: vp_out.mode,
            caps: u32::from(vp_out.is_reference),
        });
        methods.push(self.fence_write(Engine::Vp, sequence));
        self.submit(Engine::Vp, sequence, &methods)?;

        // PPP
        let ppp_mode = ppp::mode(picture, profile);
        let mut methods = vec![Method::SetSource {
            address: target_address,
            y2: self.offsets.y2,
            cbcr: self.offsets.cbcr,
            cbcr2: self.offsets.cbcr2,
        }];
        methods.extend(
            target
                .plane_addresses()
                .into_iter()
                .enumerate()
                .map(|(plane, address)| Method::SetDestination {
                    plane: plane as u32,
                    address,
                }),
        );
        methods.push(Method::Launch {
            mode: ppp_mode,
            caps: ppp::PPP_CAPS,
        });
        methods.push(self.fence_write(Engine::Ppp, sequence));
        self.submit(Engine::Ppp, sequence, &methods)?;

        self.stats.frames_ended += 1;
        debug!(
            sequence,
            ring_index,
            target = %target.id(),
            target_slot = assignment.target_slot,
            is_reference = vp_out.is_reference,
            anomalies,
            "Ended frame"
        );

        Ok(FrameReport {
            sequence,
            ring_index,
            bitstream_length: bsp_out.length,
            bsp_caps: bsp_out.caps,
            vp_mode: vp_out.mode,
            ppp_mode,
            is_reference: vp_out.is_reference,
            target_slot: assignment.target_slot,
            references: slots,
            anomalies,
            evicted: assignment.evicted,
            second_field,
        })
    }

    /// Checks that must pass before the append window closes.
    fn validate(&self, picture: &PictureDesc) -> DecodeResult<InterSizes> {
        let codec = picture.codec();
        if codec != self.codec {
            return Err(DecodeError::CodecMismatch {
                expected: self.codec,
                got: codec,
            });
        }

        let named = picture.references().into_iter().flatten().count() as u32;
        if named > self.config.max_references {
            return Err(DecodeError::TooManyReferences {
                requested: named,
                max: self.config.max_references,
            });
        }

        bsp::caps(picture, self.config.profile)?;
        bsp::params(picture, self.config.profile, self.geometry)?;
        vp::validate(picture, self.config.profile)?;
        ppp::validate(picture, self.geometry)?;

        let inter_size = self.inter_ring.get(self.sequence).size();
        let inter = self
            .geometry
            .inter_sizes(picture.slice_count(), codec != VideoCodec::Mpeg12, inter_size)?;
        let used = u64::from(inter.slice_size) + u64::from(inter.bucket_size);
        if used > u64::from(inter.ring_size) {
            return Err(DecodeError::Overrun {
                needed: used << 8,
                capacity: u64::from(inter.ring_size) << 8,
            });
        }
        Ok(inter)
    }

    // -----------------------------------------------------------------------
    // Engines
    // -----------------------------------------------------------------------

    fn fence_write(&self, engine: Engine, sequence: u64) -> Method {
        Method::FenceWrite {
            address: self.fence_bo.address().offset(engine.fence_offset()),
            value: sequence as u32,
        }
    }

    /// Build one engine stream, bake it and hand it to the engine's queue.
    fn submit(&mut self, engine: Engine, sequence: u64, methods: &[Method]) -> DecodeResult<()> {
        let mut stream = ControlStream::new(
            Arc::clone(&self.memory),
            self.csb_config.clone(),
            StreamType::Compute,
        )?;
        for method in methods {
            method.emit(&mut stream)?;
        }
        stream.emit_terminate()?;
        let start = stream.start_address();
        let buffers = stream.bake()?;

        trace!(%engine, sequence, %start, packets = methods.len(), "Submitting stream");
        self.queues.get(engine).submit(Submission {
            engine,
            sequence,
            start,
            buffers,
        })?;

        if self.config.debug_fence {
            self.wait(engine, sequence)?;
        }
        Ok(())
    }

    fn wait(&mut self, engine: Engine, sequence: u64) -> DecodeResult<()> {
        {
            let target = FenceTarget {
                engine,
                sequence,
                fences: self.fence_bo.map()?,
                bitstream: self.bsp_ring.get(sequence).map()?,
            };
            self.fence.wait(&target)?;
        }
        self.stats.fence_waits += 1;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn profile(&self) -> VideoProfile {
        self.config.profile
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn plane_offsets(&self) -> PlaneOffsets {
        self.offsets
    }

    /// Sequence number of the most recently begun frame.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_frame_open(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn ring_depth(&self) -> u32 {
        self.bsp_ring.depth()
    }

    /// Ring position used by frame `sequence`.
    pub fn ring_index(&self, sequence: u64) -> usize {
        self.bsp_ring.index(sequence)
    }

    pub fn ref_table(&self) -> &RefTable {
        &self.refs
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.clone()
    }

    pub fn ref_stride(&self) -> u64 {
        self.ref_stride
    }

    /// Device address of reference slot `slot` (the null slot included).
    pub fn slot_address(&self, slot: u32) -> DeviceAddress {
        self.ref_bo.address().offset(self.ref_stride * u64::from(slot))
    }

    /// Device address of the H.264 scratch region after the null slot.
    pub fn scratch_address(&self) -> DeviceAddress {
        self.slot_address(self.config.max_references + 2)
    }

    /// Bitstream buffer used by frame `sequence`.
    pub fn bitstream_buffer(&self, sequence: u64) -> &BufferObject {
        self.bsp_ring.get(sequence)
    }

    /// Host view of the engine fence buffer.
    pub fn fence_mapping(&self) -> DecodeResult<&HostMapping> {
        Ok(self.fence_bo.map()?)
    }

    pub fn fence_buffer(&self) -> &BufferObject {
        &self.fence_bo
    }

    pub fn reference_image(&self) -> &BufferObject {
        &self.ref_bo
    }
}

impl fmt::Debug for DecoderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderSession")
            .field("profile", &self.config.profile)
            .field("geometry", &self.geometry)
            .field("sequence", &self.sequence)
            .field("frame_open", &self.cursor.is_some())
            .field("ring_depth", &self.bsp_ring.depth())
            .field("fence", &self.fence.name())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        if let Some(cursor) = self.cursor {
            warn!(sequence = cursor.sequence, "Decoder session dropped with a frame open");
        }
        info!(
            codec = self.codec.display_name(),
            frames_begun = self.stats.frames_begun,
            frames_ended = self.stats.frames_ended,
            anomalies = self.stats.anomalies,
            evictions = self.stats.evictions,
            "Decoder session destroyed"
        );
    }
}
