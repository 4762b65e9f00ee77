//! End-to-end tests of the decode pipeline against host memory.
//!
//! No hardware needed: buffers come from `SystemMemory`, engine streams go
//! to a `RecordingQueue` (or the synchronous `SoftwareDevice`) and are read
//! back through the address space.

use std::sync::Arc;

use gx_common::{DecoderConfig, DeviceMemory, SystemMemory, VideoProfile};
use gx_csb::read_stream;
use gx_vdec::geometry::{align64, mb};
use gx_vdec::picture::mpeg12;
use gx_vdec::{
    CommStatus, DecodeError, DecodeResult, DecoderSession, Engine, EngineQueues, FenceStrategy,
    FenceTarget, Geometry, H264Picture, H264Reference, Method, Mpeg12Picture, PictureDesc,
    RecordingQueue, SoftwareDevice, VideoBuffer,
};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 64;

struct Harness {
    system: Arc<SystemMemory>,
    memory: Arc<dyn DeviceMemory>,
    queue: Arc<RecordingQueue>,
    session: DecoderSession,
}

fn config(profile: VideoProfile, max_references: u32, ring_depth: u32) -> DecoderConfig {
    let mut config = DecoderConfig::new(profile, WIDTH, HEIGHT, max_references);
    config.ring_depth = ring_depth;
    config.bsp_size = Some(0x2000);
    config.inter_size = Some(0x10000);
    config
}

fn harness(config: DecoderConfig) -> Harness {
    let system = Arc::new(SystemMemory::new());
    let memory: Arc<dyn DeviceMemory> = system.clone();
    let queue = Arc::new(RecordingQueue::new());
    let session = DecoderSession::new(config, memory.clone(), EngineQueues::shared(queue.clone()))
        .expect("session");
    Harness {
        system,
        memory,
        queue,
        session,
    }
}

impl Harness {
    fn target(&self) -> Arc<VideoBuffer> {
        VideoBuffer::nv12(&self.memory, WIDTH, HEIGHT).expect("target")
    }

    /// Methods of the stream submitted to `engine` for `sequence`.
    fn methods(&self, engine: Engine, sequence: u64) -> Vec<Method> {
        let start = self.queue.find(engine, sequence).expect("submission");
        read_stream(&*self.system, start)
            .expect("stream")
            .iter()
            .map(|packet| Method::parse(packet).expect("known method"))
            .collect()
    }
}

fn mpeg2_intra() -> PictureDesc {
    PictureDesc::Mpeg12(Mpeg12Picture {
        picture_coding_type: mpeg12::CODING_I,
        picture_structure: mpeg12::STRUCTURE_FRAME,
        num_slices: 4,
        ..Default::default()
    })
}

fn h264(frame_num: u32, refs: &[&Arc<VideoBuffer>]) -> PictureDesc {
    PictureDesc::H264(H264Picture {
        slice_count: 1,
        is_reference: true,
        frame_num,
        field_order_cnt: [frame_num as i32 * 2; 2],
        frame_mbs_only_flag: true,
        references: refs
            .iter()
            .enumerate()
            .map(|(i, buffer)| H264Reference::frame(Arc::clone(*buffer), i as u32, i as i32 * 2))
            .collect(),
        ..Default::default()
    })
}

/// Deterministic bitstream of frame `sequence`.
fn payload(sequence: u64) -> Vec<u8> {
    (0..64 + sequence as usize * 7)
        .map(|i| (i as u64 ^ sequence.wrapping_mul(31)) as u8)
        .collect()
}

fn decode(h: &mut Harness, picture: &PictureDesc, target: &VideoBuffer) -> gx_vdec::FrameReport {
    h.session.begin().expect("begin");
    let data = payload(h.session.sequence());
    h.session.append(&[data.as_slice()]).expect("append");
    h.session.end(picture, target).expect("end")
}

// ---------------------------------------------------------------------------
// Frame window
// ---------------------------------------------------------------------------

#[test]
fn second_begin_fails_for_every_ring_depth() {
    for depth in 1..=4 {
        let mut h = harness(config(VideoProfile::Mpeg2Main, 2, depth));
        h.session.begin().unwrap();
        let err = h.session.begin().unwrap_err();
        assert_eq!(err, DecodeError::InvalidSequence { open: 1 });
        assert!(err.is_configuration());

        // The open frame is still usable.
        let target = h.target();
        let report = h.session.end(&mpeg2_intra(), &target).unwrap();
        assert_eq!(report.sequence, 1);
        h.session.begin().unwrap();
        assert_eq!(h.session.sequence(), 2);
    }
}

#[test]
fn append_and_end_need_an_open_frame() {
    let mut h = harness(config(VideoProfile::Mpeg2Main, 2, 2));
    let target = h.target();
    assert_eq!(h.session.append(&[b"abc".as_slice()]).unwrap_err(), DecodeError::NoFrameOpen);
    assert_eq!(
        h.session.end(&mpeg2_intra(), &target).unwrap_err(),
        DecodeError::NoFrameOpen
    );
    assert!(h.queue.is_empty());
}

#[test]
fn ring_entry_follows_sequence() {
    let mut h = harness(config(VideoProfile::Mpeg2Main, 2, 3));
    let mut data_addresses = Vec::new();
    for _ in 0..7 {
        let target = h.target();
        let report = decode(&mut h, &mpeg2_intra(), &target);
        assert_eq!(report.ring_index, (report.sequence % 3) as usize);

        let data = h
            .methods(Engine::Bsp, report.sequence)
            .into_iter()
            .find_map(|m| match m {
                Method::SetBitstream { data, .. } => Some(data),
                _ => None,
            })
            .unwrap();
        data_addresses.push(data);
    }
    for i in 3..data_addresses.len() {
        assert_eq!(data_addresses[i], data_addresses[i - 3]);
    }
    assert_ne!(data_addresses[0], data_addresses[1]);
    assert_ne!(data_addresses[1], data_addresses[2]);
}

#[test]
fn append_accumulates_length_and_end_marker() {
    let mut h = harness(config(VideoProfile::Mpeg2Main, 2, 2));
    let target = h.target();
    h.session.begin().unwrap();
    h.session.append(&[&[1u8; 10][..], &[2u8; 6][..]]).unwrap();
    h.session.append(&[&[3u8; 4][..]]).unwrap();
    let report = h.session.end(&mpeg2_intra(), &target).unwrap();
    assert_eq!(report.bitstream_length, 20 + 16);
    assert_eq!(report.bsp_caps, (4 << 4 | 1) | 1 << 17);

    let mapping = h.session.bitstream_buffer(1).map().unwrap();
    let mut expected = vec![1u8; 10];
    expected.extend([2u8; 6]);
    expected.extend([3u8; 4]);
    assert_eq!(mapping.read_vec(0x700, 20).unwrap(), expected);
    assert_eq!(
        mapping.read_u32s(0x714, 4).unwrap(),
        vec![0xb701_0000, 0, 0xb701_0000, 0]
    );
    assert_eq!(h.session.stats().bytes_appended, 20);
}

#[test]
fn overrun_is_reported_and_appends_nothing() {
    let mut cfg = config(VideoProfile::Mpeg2Main, 2, 2);
    cfg.bsp_size = Some(0x800);
    let mut h = harness(cfg);
    let target = h.target();

    // 0x800 - 0x700 header - 16 marker bytes.
    h.session.begin().unwrap();
    h.session.append(&[&[0xaa; 240][..]]).unwrap();
    let err = h.session.append(&[&[0xbb; 1][..]]).unwrap_err();
    assert_eq!(
        err,
        DecodeError::Overrun {
            needed: 0x801,
            capacity: 0x800
        }
    );
    let report = h.session.end(&mpeg2_intra(), &target).unwrap();
    assert_eq!(report.bitstream_length, 240 + 16);

    // A multi-chunk append that does not fit leaves the frame untouched.
    h.session.begin().unwrap();
    assert!(h.session.append(&[&[0u8; 100][..], &[0u8; 141][..]]).is_err());
    let report = h.session.end(&mpeg2_intra(), &target).unwrap();
    assert_eq!(report.bitstream_length, 16);
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ConsumptionLog {
    consumed: Mutex<Vec<(u64, bool)>>,
}

/// Plays the VP engine consuming a frame at the moment the session waits
/// for it, checking the frame's bitstream is still the one submitted.
struct ConsumingFence {
    log: Arc<ConsumptionLog>,
    queue: Arc<RecordingQueue>,
}

impl FenceStrategy for ConsumingFence {
    fn name(&self) -> &'static str {
        "consuming"
    }

    fn wait(&self, target: &FenceTarget<'_>) -> DecodeResult<()> {
        assert_eq!(target.engine, Engine::Vp);
        let submitted = self.queue.find(Engine::Vp, target.sequence).is_some();
        let length = u64::from(target.bitstream.read_u32(0x100)?);
        let data = target.bitstream.read_vec(0x700, length - 16)?;
        let intact = submitted && data == payload(target.sequence);
        self.log.consumed.lock().push((target.sequence, intact));
        Ok(())
    }
}

#[test]
fn ring_entries_are_consumed_before_reuse() {
    for depth in 1..=3u32 {
        let system = Arc::new(SystemMemory::new());
        let memory: Arc<dyn DeviceMemory> = system.clone();
        let queue = Arc::new(RecordingQueue::new());
        let log = Arc::new(ConsumptionLog::default());
        let fence = ConsumingFence {
            log: Arc::clone(&log),
            queue: Arc::clone(&queue),
        };
        let mut session = DecoderSession::with_fence(
            config(VideoProfile::Mpeg2Main, 2, depth),
            memory.clone(),
            EngineQueues::shared(queue.clone()),
            Box::new(fence),
        )
        .unwrap();

        for _ in 0..6 {
            let target = VideoBuffer::nv12(&memory, WIDTH, HEIGHT).unwrap();
            session.begin().unwrap();
            let data = payload(session.sequence());
            session.append(&[data.as_slice()]).unwrap();
            session.end(&mpeg2_intra(), &target).unwrap();
        }

        let consumed = log.consumed.lock().clone();
        let expected: Vec<_> = (1..=6 - u64::from(depth)).map(|s| (s, true)).collect();
        assert_eq!(consumed, expected, "ring depth {depth}");
        assert_eq!(session.stats().fence_waits, 6 - u64::from(depth));
    }
}

// ---------------------------------------------------------------------------
// Reference slots
// ---------------------------------------------------------------------------

#[test]
fn targets_never_take_a_slot_used_by_the_same_frame() {
    let max = 2;
    let mut h = harness(config(VideoProfile::H264Main, max, 2));
    let mut previous: Vec<Arc<VideoBuffer>> = Vec::new();

    for frame in 0..(max + 2) * 2 {
        let target = h.target();
        let refs: Vec<&Arc<VideoBuffer>> = previous.iter().rev().take(max as usize).collect();
        let before: Vec<u64> = h.session.ref_table().slots().iter().map(|s| s.last_used).collect();

        let picture = h264(frame, &refs);
        let report = decode(&mut h, &picture, &target);

        assert!(before[report.target_slot as usize] < report.sequence);
        for slot in report.references.iter().flatten() {
            assert_ne!(*slot, report.target_slot);
        }
        previous.push(target);
    }
}

#[test]
fn resubmitted_target_keeps_its_slot() {
    let mut h = harness(config(VideoProfile::H264Main, 2, 2));
    let target = h.target();

    let top = PictureDesc::H264(H264Picture {
        slice_count: 1,
        is_reference: true,
        field_pic_flag: true,
        bottom_field_flag: false,
        ..Default::default()
    });
    let bottom = PictureDesc::H264(H264Picture {
        slice_count: 1,
        is_reference: true,
        field_pic_flag: true,
        bottom_field_flag: true,
        ..Default::default()
    });

    let first = decode(&mut h, &top, &target);
    let second = decode(&mut h, &bottom, &target);
    assert_eq!(first.target_slot, second.target_slot);
    assert_eq!(target.valid_ref(), Some(first.target_slot));
    assert!(!first.second_field);
    assert!(second.second_field);
    assert_eq!(second.evicted, None);
}

#[test]
fn h264_three_frame_reference_chain() {
    let max = 2;
    let mut h = harness(config(VideoProfile::H264Main, max, 2));
    let f1 = h.target();
    let f2 = h.target();
    let f3 = h.target();

    let r1 = decode(&mut h, &h264(0, &[]), &f1);
    let r2 = decode(&mut h, &h264(1, &[&f1]), &f2);
    let r3 = decode(&mut h, &h264(2, &[&f1, &f2]), &f3);

    for report in [&r1, &r2, &r3] {
        assert!(report.target_slot <= max);
        assert_eq!(report.anomalies, 0);
        assert!(report.is_reference);
    }
    let slots: Vec<u32> = [&f1, &f2, &f3].iter().map(|b| b.valid_ref().unwrap()).collect();
    assert!(slots.iter().all(|s| *s <= max));
    assert!(slots[0] != slots[1] && slots[1] != slots[2] && slots[0] != slots[2]);

    // Frame 3 reads exactly the two slots frames 1 and 2 were decoded into.
    assert_eq!(r2.references, vec![Some(slots[0])]);
    assert_eq!(r3.references, vec![Some(slots[0]), Some(slots[1])]);
    // Frame 3 may not evict slots stamped by this frame, so all three
    // pictures stay resident.
    let table = h.session.ref_table();
    assert_eq!(table.occupied(), 3);
    for (buffer, slot) in [&f1, &f2, &f3].iter().zip(&slots) {
        assert_eq!(table.slot(*slot).unwrap().owner, Some(buffer.id()));
    }

    let vp = h.methods(Engine::Vp, 3);
    let references: Vec<_> = vp
        .iter()
        .filter_map(|m| match m {
            Method::SetReference { index, address } => Some((*index, *address)),
            _ => None,
        })
        .collect();
    assert_eq!(
        references,
        vec![
            (0, h.session.slot_address(slots[0])),
            (1, h.session.slot_address(slots[1])),
        ]
    );
    assert!(vp.contains(&Method::SetTarget {
        slot: slots[2],
        address: h.session.slot_address(slots[2]),
    }));
    assert!(vp.contains(&Method::Launch { mode: 0x01013, caps: 1 }));
    assert!(vp.iter().any(|m| matches!(m, Method::SetScratch { address, .. }
        if *address == h.session.scratch_address())));

    let bsp = h.methods(Engine::Bsp, 3);
    assert!(bsp.contains(&Method::Launch {
        mode: 0x0113,
        caps: 0x13 | 1 << 17,
    }));
}

#[test]
fn evicted_reference_resolves_to_the_null_slot() {
    let mut h = harness(config(VideoProfile::H264Main, 2, 2));
    let f: Vec<Arc<VideoBuffer>> = (0..5).map(|_| h.target()).collect();

    decode(&mut h, &h264(0, &[]), &f[0]);
    decode(&mut h, &h264(1, &[&f[0]]), &f[1]);
    decode(&mut h, &h264(2, &[&f[0], &f[1]]), &f[2]);
    let r4 = decode(&mut h, &h264(3, &[&f[1], &f[2]]), &f[3]);
    assert_eq!(r4.evicted, Some(f[0].id()));
    assert_eq!(h.session.stats().evictions, 1);

    let r5 = decode(&mut h, &h264(4, &[&f[0]]), &f[4]);
    assert_eq!(r5.anomalies, 1);
    assert_eq!(r5.references, vec![None]);
    assert_eq!(h.session.stats().anomalies, 1);

    let null = h.session.slot_address(h.session.ref_table().null_slot());
    assert!(h
        .methods(Engine::Vp, 5)
        .contains(&Method::SetReference { index: 0, address: null }));
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn codec_mismatch_keeps_the_window_open() {
    let mut h = harness(config(VideoProfile::H264Main, 2, 2));
    let target = h.target();
    h.session.begin().unwrap();
    let err = h.session.end(&mpeg2_intra(), &target).unwrap_err();
    assert!(matches!(err, DecodeError::CodecMismatch { .. }));
    assert!(err.is_configuration());
    assert!(h.session.is_frame_open());
    assert!(h.queue.is_empty());

    h.session.end(&h264(0, &[]), &target).unwrap();
    assert!(!h.session.is_frame_open());
    assert_eq!(h.queue.len(), 3);
}

#[test]
fn oversized_slice_count_is_rejected_with_the_window_open() {
    let mut h = harness(config(VideoProfile::Mpeg2Main, 2, 2));
    let target = h.target();
    h.session.begin().unwrap();
    h.session.append(&[&[0u8; 32][..]]).unwrap();

    let picture = PictureDesc::Mpeg12(Mpeg12Picture {
        picture_coding_type: mpeg12::CODING_I,
        picture_structure: mpeg12::STRUCTURE_FRAME,
        num_slices: 0x0080_0000,
        ..Default::default()
    });
    let err = h.session.end(&picture, &target).unwrap_err();
    assert!(err.is_configuration(), "{err}");
    assert!(h.session.is_frame_open());
    assert!(h.queue.is_empty());

    h.session.end(&mpeg2_intra(), &target).unwrap();
    assert!(!h.session.is_frame_open());
}

#[test]
fn too_many_references_for_the_session() {
    let mut h = harness(config(VideoProfile::H264Main, 2, 2));
    let refs: Vec<Arc<VideoBuffer>> = (0..3).map(|_| h.target()).collect();
    let target = h.target();
    h.session.begin().unwrap();
    let picture = h264(0, &refs.iter().collect::<Vec<_>>());
    assert_eq!(
        h.session.end(&picture, &target).unwrap_err(),
        DecodeError::TooManyReferences {
            requested: 3,
            max: 2
        }
    );
    assert!(h.session.is_frame_open());
}

#[test]
fn session_limits_references_per_codec() {
    let system = Arc::new(SystemMemory::new());
    let queue = Arc::new(RecordingQueue::new());
    let err = DecoderSession::new(
        config(VideoProfile::Mpeg2Main, 3, 2),
        system,
        EngineQueues::shared(queue),
    )
    .unwrap_err();
    assert_eq!(
        err,
        DecodeError::TooManyReferences {
            requested: 3,
            max: 2
        }
    );
}

#[test]
fn allocation_failure_surfaces_as_resource_exhaustion() {
    let system = Arc::new(SystemMemory::with_budget(0x4000));
    let queue = Arc::new(RecordingQueue::new());
    let err = DecoderSession::new(
        config(VideoProfile::Mpeg2Main, 2, 2),
        system.clone(),
        EngineQueues::shared(queue),
    )
    .unwrap_err();
    assert!(matches!(err, DecodeError::ResourceExhausted(_)));
    assert!(!err.is_configuration());
    assert_eq!(system.live_allocations(), 0);
}

#[test]
fn dropping_the_session_releases_every_buffer() {
    let h = harness(config(VideoProfile::H264Main, 2, 2));
    let Harness {
        system,
        memory,
        queue,
        mut session,
    } = h;
    let target = VideoBuffer::nv12(&memory, WIDTH, HEIGHT).unwrap();
    session.begin().unwrap();
    session.end(&h264(0, &[]), &target).unwrap();
    assert!(system.live_allocations() > 0);

    drop(session);
    drop(queue);
    drop(target);
    drop(memory);
    assert_eq!(system.live_allocations(), 0);
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

#[test]
fn geometry_helpers_match_closed_forms() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..2000 {
        let w: u32 = rng.gen_range(1..=4096);
        let h: u32 = rng.gen_range(1..=4096);
        assert_eq!(mb(w), w.div_ceil(16));
        assert_eq!(align64(h), h.div_ceil(64) * 64);

        let geometry = Geometry::new(w, h);
        let offsets = geometry.plane_offsets().unwrap();
        assert!(offsets.y2 < offsets.cbcr && offsets.cbcr <= offsets.cbcr2);
        assert_eq!(geometry.ref_stride() % 0x100, 0);
    }
}

// ---------------------------------------------------------------------------
// Debug fence
// ---------------------------------------------------------------------------

#[test]
fn debug_fence_waits_on_every_stage() {
    let system = Arc::new(SystemMemory::new());
    let memory: Arc<dyn DeviceMemory> = system.clone();
    let device = Arc::new(SoftwareDevice::new(system.clone()));

    let mut cfg = config(VideoProfile::H264Main, 2, 2);
    cfg.debug_fence = true;
    cfg.fence_poll_interval_us = 100;
    cfg.fence_timeout_ms = 1000;
    let mut session = DecoderSession::new(cfg, memory.clone(), EngineQueues::shared(device.clone())).unwrap();
    assert_eq!(session.ring_depth(), 1);

    let targets: Vec<Arc<VideoBuffer>> = (0..3)
        .map(|_| VideoBuffer::nv12(&memory, WIDTH, HEIGHT).unwrap())
        .collect();
    for (i, target) in targets.iter().enumerate() {
        session.begin().unwrap();
        let data = payload(session.sequence());
        session.append(&[data.as_slice()]).unwrap();
        let refs: Vec<&Arc<VideoBuffer>> = targets[..i].iter().rev().take(2).collect();
        session.end(&h264(i as u32, &refs), target).unwrap();
    }

    // Three stage waits per frame plus one ring wait for frames 2 and 3.
    assert_eq!(session.stats().fence_waits, 3 * 3 + 2);
    assert_eq!(device.execution_count(), 9);

    let fences = session.fence_mapping().unwrap();
    for engine in Engine::ALL {
        assert_eq!(fences.read_u32(engine.fence_offset()).unwrap(), 3);
    }

    let comm = CommStatus::read(session.bitstream_buffer(3).map().unwrap(), 0x500).unwrap();
    assert_eq!(comm.bsp_cur_index, 3);
    assert_eq!(comm.pvp_cur_index, 3);
    assert_eq!(comm.byte_ofs, payload(3).len() as u32 + 16);
}

#[test]
fn frame_report_serializes() {
    let mut h = harness(config(VideoProfile::H264Main, 2, 2));
    let target = h.target();
    let report = decode(&mut h, &h264(0, &[]), &target);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["sequence"], 1);
    assert_eq!(json["target_slot"], report.target_slot);
}
