//! gx-trace
//!
//! Drives a decoder session or a control stream against the simulated
//! device and prints what happened as JSON. Useful for checking register
//! streams and reference slot behaviour without hardware.

mod device;
mod synth;

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use gx_common::{CsbConfig, DecoderConfig, DeviceMemory, SystemMemory, VideoProfile};
use gx_csb::{ControlStream, StreamReader, StreamType};
use gx_vdec::{DecoderSession, EngineQueues, PollingFence, VideoBuffer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::device::DeviceThread;

/// gx-trace - Simulated decode and control stream runs
#[derive(Parser, Debug)]
#[command(name = "gx-trace")]
#[command(about = "Run decoder sessions and control streams on a simulated device")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a synthetic stream
    Decode(DecodeArgs),
    /// Build a linked control stream and read it back
    Csb(CsbArgs),
}

#[derive(clap::Args, Debug)]
struct DecodeArgs {
    /// Decode profile
    #[arg(long, value_enum, default_value = "h264-main")]
    profile: Profile,

    #[arg(long, default_value = "320")]
    width: u32,

    #[arg(long, default_value = "240")]
    height: u32,

    /// Number of frames to decode
    #[arg(short, long, default_value = "30")]
    frames: u32,

    /// Intra period (0 = every frame is intra)
    #[arg(long, default_value = "10")]
    gop: u32,

    /// Slices per picture
    #[arg(long, default_value = "1")]
    slices: u32,

    /// Maximum reference frames per picture
    #[arg(long, default_value = "2")]
    max_refs: u32,

    /// Bitstream ring depth
    #[arg(long, default_value = "2")]
    ring_depth: u32,

    /// Wait on every engine fence after each submission
    #[arg(long)]
    debug_fence: bool,

    /// Approximate slice payload per frame in bytes
    #[arg(long, default_value = "4096")]
    frame_bytes: usize,

    /// RNG seed for payloads
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Decoder config JSON; command line values override the file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print a report per frame
    #[arg(long)]
    reports: bool,
}

#[derive(clap::Args, Debug)]
struct CsbArgs {
    /// Packets emitted into the main stream
    #[arg(short, long, default_value = "200")]
    packets: usize,

    /// Payload words per packet
    #[arg(long, default_value = "6")]
    words: usize,

    /// Packets recorded in the deferred stream
    #[arg(long, default_value = "8")]
    deferred: usize,

    /// Stream buffer size in bytes
    #[arg(long)]
    bo_size: Option<u64>,

    /// Control stream config JSON
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Profile {
    Mpeg1,
    Mpeg2Simple,
    Mpeg2Main,
    Mpeg4Simple,
    Mpeg4AdvancedSimple,
    Vc1Simple,
    Vc1Main,
    Vc1Advanced,
    H264Baseline,
    H264Main,
    H264High,
}

impl From<Profile> for VideoProfile {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::Mpeg1 => Self::Mpeg1,
            Profile::Mpeg2Simple => Self::Mpeg2Simple,
            Profile::Mpeg2Main => Self::Mpeg2Main,
            Profile::Mpeg4Simple => Self::Mpeg4Simple,
            Profile::Mpeg4AdvancedSimple => Self::Mpeg4AdvancedSimple,
            Profile::Vc1Simple => Self::Vc1Simple,
            Profile::Vc1Main => Self::Vc1Main,
            Profile::Vc1Advanced => Self::Vc1Advanced,
            Profile::H264Baseline => Self::H264Baseline,
            Profile::H264Main => Self::H264Main,
            Profile::H264High => Self::H264High,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Decode(decode) => run_decode(decode),
        Command::Csb(csb) => run_csb(csb),
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

fn run_decode(args: DecodeArgs) -> anyhow::Result<()> {
    let mut config: DecoderConfig = match &args.config {
        Some(path) => load_json(path)?,
        None => DecoderConfig::default(),
    };
    config.profile = args.profile.into();
    config.width = args.width;
    config.height = args.height;
    config.max_references = args.max_refs;
    config.ring_depth = args.ring_depth;
    config.debug_fence |= args.debug_fence;

    let profile = config.profile;
    let keep = args.max_refs.min(profile.codec().max_references()) as usize;

    let system = Arc::new(SystemMemory::new());
    let memory: Arc<dyn DeviceMemory> = system.clone();
    let (device, queue) = DeviceThread::spawn(system.clone())?;

    info!(
        profile = ?profile,
        width = config.width,
        height = config.height,
        frames = args.frames,
        "Starting synthetic decode"
    );

    // The device runs on its own thread, so ring reuse has to wait for it.
    let fence = Box::new(PollingFence::new(
        config.fence_poll_interval(),
        config.fence_timeout(),
    ));
    let mut session =
        DecoderSession::with_fence(config, memory.clone(), EngineQueues::shared(queue), fence)?;

    // Enough targets that a new frame never lands on a live reference.
    let pool = (0..keep + 2)
        .map(|_| VideoBuffer::nv12(&memory, args.width, args.height))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut decoded: VecDeque<Arc<VideoBuffer>> = VecDeque::with_capacity(keep + 1);
    let mut evictions = 0u64;

    for index in 0..args.frames {
        let target = &pool[index as usize % pool.len()];
        let refs: Vec<Arc<VideoBuffer>> = decoded.iter().cloned().collect();
        let picture = synth::picture(profile, index, args.gop, args.slices, &refs);

        session.begin()?;
        for _ in 0..args.slices.max(1) {
            let data = synth::slice_data(&mut rng, args.frame_bytes / args.slices.max(1) as usize);
            let header = [0u8, 0, 1, rng.gen_range(0x01..=0xaf)];
            session.append(&[&header[..], data.as_slice()])?;
        }
        let report = session
            .end(&picture, target)
            .with_context(|| format!("frame {index} failed"))?;

        if report.evicted.is_some() {
            evictions += 1;
        }
        if args.reports {
            println!("{}", serde_json::to_string(&report)?);
        }

        decoded.push_front(Arc::clone(target));
        decoded.truncate(keep);
    }

    let stats = session.stats();
    drop(session);
    let summary = device.join()?;

    let output = json!({
        "profile": format!("{profile:?}"),
        "frames": args.frames,
        "session": stats,
        "evictions_seen": evictions,
        "device": summary,
        "memory": {
            "peak_bytes": system.peak_bytes(),
            "total_allocations": system.total_allocations(),
            "live_allocations": system.live_allocations(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// csb
// ---------------------------------------------------------------------------

/// Method used for the filler packets.
const FILLER_METHOD: u16 = 0x0100;

fn run_csb(args: CsbArgs) -> anyhow::Result<()> {
    let mut config: CsbConfig = match &args.config {
        Some(path) => load_json(path)?,
        None => CsbConfig::default(),
    };
    if let Some(bo_size) = args.bo_size {
        config.bo_size = bo_size;
    }

    let system = Arc::new(SystemMemory::new());
    let memory: Arc<dyn DeviceMemory> = system.clone();
    let payload: Vec<u32> = (0..args.words as u32).collect();

    // Sub stream reached through a returning link.
    let mut sub = ControlStream::new(memory.clone(), config.clone(), StreamType::Graphics)?;
    for i in 0..4u32 {
        sub.emit_packet(FILLER_METHOD + 1, &[i])?;
    }
    sub.emit_return()?;
    let sub_start = sub.start_address();
    let sub_buffers = sub.bake()?;

    let mut deferred = ControlStream::new(memory.clone(), config.clone(), StreamType::GraphicsDeferred)?;
    for i in 0..args.deferred as u32 {
        deferred.emit_packet(FILLER_METHOD + 2, &[i, !i])?;
    }

    let mut main = ControlStream::new(memory, config.clone(), StreamType::Graphics)?;
    for _ in 0..args.packets {
        main.emit_packet(FILLER_METHOD, &payload)?;
    }
    deferred.copy_deferred_into(&mut main)?;
    main.emit_link(sub_start, true)?;
    main.emit_packet(FILLER_METHOD + 3, &[])?;
    main.emit_terminate()?;

    let start = main.start_address();
    let unmarked_extends = main.unmarked_extends();
    let buffers = main.bake()?;

    let mut reader = StreamReader::new(&*system, start)?;
    let mut packets = 0usize;
    let mut words = 0usize;
    while let Some(packet) = reader.next_packet()? {
        packets += 1;
        words += 1 + packet.payload.len();
    }

    let expected = args.packets + args.deferred + 4 + 1;
    anyhow::ensure!(
        packets == expected,
        "read back {packets} packets, expected {expected}"
    );

    let output = json!({
        "bo_size": config.bo_size,
        "buffer_capacity": config.bo_size - gx_csb::LINK_BYTES - config.guard_size,
        "buffers": buffers.len(),
        "sub_buffers": sub_buffers.len(),
        "packets": packets,
        "words": words,
        "links_followed": reader.links_followed(),
        "unmarked_extends": unmarked_extends,
        "peak_bytes": system.peak_bytes(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
