//! Per-frame picture descriptors supplied by the caller.
//!
//! The decoder only reads these. Reference pictures are named by the
//! [`VideoBuffer`] they were decoded into.

use std::sync::Arc;

use gx_common::VideoCodec;

use crate::buffer::VideoBuffer;

/// A 64-entry quantiser matrix in zig-zag order.
pub type QuantMatrix = [u8; 64];

/// Picture description for one frame, tagged by codec.
#[derive(Clone, Debug)]
pub enum PictureDesc {
    Mpeg12(Mpeg12Picture),
    Mpeg4(Mpeg4Picture),
    Vc1(Vc1Picture),
    H264(H264Picture),
}

impl PictureDesc {
    pub fn codec(&self) -> VideoCodec {
        match self {
            Self::Mpeg12(_) => VideoCodec::Mpeg12,
            Self::Mpeg4(_) => VideoCodec::Mpeg4,
            Self::Vc1(_) => VideoCodec::Vc1,
            Self::H264(_) => VideoCodec::H264,
        }
    }

    /// Reference pictures in logical order. Empty positions are `None`.
    pub fn references(&self) -> Vec<Option<&Arc<VideoBuffer>>> {
        match self {
            Self::Mpeg12(p) => p.refs.iter().map(Option::as_ref).collect(),
            Self::Mpeg4(p) => p.refs.iter().map(Option::as_ref).collect(),
            Self::Vc1(p) => p.refs.iter().map(Option::as_ref).collect(),
            Self::H264(p) => p.references.iter().map(|r| Some(&r.buffer)).collect(),
        }
    }

    /// Slices in this frame, as the intermediate buffer layout counts them.
    pub fn slice_count(&self) -> u32 {
        match self {
            Self::Mpeg12(p) => p.num_slices,
            Self::Mpeg4(_) => 1,
            Self::Vc1(p) => p.slice_count,
            Self::H264(p) => p.slice_count,
        }
    }
}

// ---------------------------------------------------------------------------
// MPEG-1/2
// ---------------------------------------------------------------------------

pub mod mpeg12 {
    pub const CODING_I: u8 = 1;
    pub const CODING_P: u8 = 2;
    pub const CODING_B: u8 = 3;

    pub const STRUCTURE_TOP: u8 = 1;
    pub const STRUCTURE_BOTTOM: u8 = 2;
    pub const STRUCTURE_FRAME: u8 = 3;
}

#[derive(Clone, Debug, Default)]
pub struct Mpeg12Picture {
    pub picture_coding_type: u8,
    pub picture_structure: u8,
    pub frame_pred_frame_dct: bool,
    pub concealment_motion_vectors: bool,
    pub q_scale_type: bool,
    pub intra_vlc_format: bool,
    pub alternate_scan: bool,
    pub top_field_first: bool,
    pub full_pel_forward_vector: bool,
    pub full_pel_backward_vector: bool,
    pub intra_dc_precision: u8,
    /// `f_code[direction][component]`.
    pub f_code: [[u8; 2]; 2],
    pub intra_matrix: Option<QuantMatrix>,
    pub non_intra_matrix: Option<QuantMatrix>,
    pub num_slices: u32,
    /// Forward and backward references.
    pub refs: [Option<Arc<VideoBuffer>>; 2],
}

// ---------------------------------------------------------------------------
// MPEG-4 part 2
// ---------------------------------------------------------------------------

pub mod mpeg4 {
    pub const VOP_I: u8 = 0;
    pub const VOP_P: u8 = 1;
    pub const VOP_B: u8 = 2;
}

#[derive(Clone, Debug, Default)]
pub struct Mpeg4Picture {
    pub vop_coding_type: u8,
    pub vop_time_increment_resolution: u32,
    pub vop_fcode_forward: u8,
    pub vop_fcode_backward: u8,
    pub interlaced: bool,
    pub top_field_first: bool,
    pub alternate_vertical_scan: bool,
    pub quant_type: bool,
    pub quarter_sample: bool,
    pub short_video_header: bool,
    pub rounding_control: bool,
    pub resync_marker_disable: bool,
    /// Temporal distances for direct mode, per field.
    pub trd: [i32; 2],
    pub trb: [i32; 2],
    pub intra_matrix: Option<QuantMatrix>,
    pub non_intra_matrix: Option<QuantMatrix>,
    pub refs: [Option<Arc<VideoBuffer>>; 2],
}

// ---------------------------------------------------------------------------
// VC-1
// ---------------------------------------------------------------------------

pub mod vc1 {
    pub const PICTURE_I: u8 = 0;
    pub const PICTURE_P: u8 = 1;
    pub const PICTURE_B: u8 = 2;
    pub const PICTURE_BI: u8 = 3;
}

#[derive(Clone, Debug, Default)]
pub struct Vc1Picture {
    pub picture_type: u8,
    pub frame_coding_mode: u8,
    pub postprocflag: bool,
    pub pulldown: bool,
    pub interlace: bool,
    pub tfcntrflag: bool,
    pub finterpflag: bool,
    pub psf: bool,
    pub dquant: u8,
    pub panscan_flag: bool,
    pub refdist_flag: bool,
    pub quantizer: u8,
    pub extended_mv: bool,
    pub extended_dmv: bool,
    pub overlap: bool,
    pub vstransform: bool,
    pub loopfilter: bool,
    pub fastuvmc: bool,
    pub range_mapy_flag: bool,
    pub range_mapy: u8,
    pub range_mapuv_flag: bool,
    pub range_mapuv: u8,
    pub multires: bool,
    pub syncmarker: bool,
    pub rangered: bool,
    pub maxbframes: u8,
    pub deblock_enable: bool,
    pub pquant: u8,
    pub slice_count: u32,
    pub refs: [Option<Arc<VideoBuffer>>; 2],
}

// ---------------------------------------------------------------------------
// H.264
// ---------------------------------------------------------------------------

/// One entry of the H.264 decoded picture buffer.
#[derive(Clone, Debug)]
pub struct H264Reference {
    pub buffer: Arc<VideoBuffer>,
    pub frame_num: u32,
    /// Top and bottom picture order counts.
    pub field_order_cnt: [i32; 2],
    pub is_long_term: bool,
    pub top_is_reference: bool,
    pub bottom_is_reference: bool,
}

impl H264Reference {
    /// Frame reference with both fields in use.
    pub fn frame(buffer: Arc<VideoBuffer>, frame_num: u32, poc: i32) -> Self {
        Self {
            buffer,
            frame_num,
            field_order_cnt: [poc, poc],
            is_long_term: false,
            top_is_reference: true,
            bottom_is_reference: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct H264Picture {
    pub slice_count: u32,
    pub is_reference: bool,
    pub frame_num: u32,
    pub field_order_cnt: [i32; 2],
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,

    // Sequence parameters.
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub num_ref_frames: u8,

    // Picture parameters.
    pub entropy_coding_mode_flag: bool,
    pub pic_order_present_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub scaling_lists_4x4: Option<[[u8; 16]; 6]>,
    pub scaling_lists_8x8: Option<[[u8; 64]; 2]>,

    /// Decoded picture buffer entries, at most 16.
    pub references: Vec<H264Reference>,
}
