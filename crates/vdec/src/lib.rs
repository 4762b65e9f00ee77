//! `gx-vdec`: Fixed-function video decode pipeline.
//!
//! Drives three engines per frame through a [`DecoderSession`]:
//!
//! - **BSP** parses the bitstream appended between `begin` and `end`
//! - **VP** reconstructs the picture into a slot of the reference image
//! - **PPP** copies the decoded slot into the caller's [`VideoBuffer`]
//!
//! Each stage is a compute control stream built with `gx-csb` and handed to
//! a [`SubmitQueue`]. Bitstream and intermediate buffers cycle through a
//! [`ScratchRing`]; reference pictures are placed by a [`RefTable`].
//!
//! Supported codecs: MPEG-1/2, MPEG-4 part 2, VC-1, H.264.

pub mod bsp;
pub mod buffer;
pub mod comm;
pub mod device;
pub mod error;
pub mod fence;
pub mod geometry;
pub mod methods;
pub mod params;
pub mod picture;
pub mod ppp;
pub mod queue;
pub mod refs;
pub mod ring;
pub mod session;
pub mod vp;

pub use buffer::{BufferId, VideoBuffer};
pub use comm::CommStatus;
pub use device::{DeviceError, Execution, SoftwareDevice};
pub use error::{DecodeError, DecodeResult};
pub use fence::{FenceStrategy, FenceTarget, NoFence, PollingFence};
pub use geometry::{Geometry, InterSizes, PlaneOffsets};
pub use methods::Method;
pub use picture::{
    H264Picture, H264Reference, Mpeg12Picture, Mpeg4Picture, PictureDesc, QuantMatrix, Vc1Picture,
};
pub use queue::{Engine, EngineQueues, RecordingQueue, Submission, SubmitQueue};
pub use refs::{FieldCoding, RefAssignment, RefResolution, RefSlot, RefTable};
pub use ring::ScratchRing;
pub use session::{DecoderSession, FrameReport, SessionStats, DEFAULT_INTER_SIZE};
