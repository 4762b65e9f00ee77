//! Bitstream parser (BSP) stage.
//!
//! Layout of every bitstream buffer:
//!
//! ```text
//! 0x000  BSP picture parameters
//! 0x100  stream parameters (w0[0] running length, w1[0] = 1)
//! 0x200  VP picture parameters, filled by the VP stage
//! 0x500  comm block
//! 0x700  raw bitstream, closed by the codec's end marker
//! ```

use gx_common::{HostMapping, VideoCodec, VideoProfile};

use crate::comm::{COMM_OFFSET, COMM_SIZE};
use crate::error::{DecodeError, DecodeResult};
use crate::geometry::Geometry;
use crate::params::ParamBlock;
use crate::picture::{mpeg4, vc1, H264Picture, Mpeg12Picture, Mpeg4Picture, PictureDesc, Vc1Picture};

pub const BSP_PARAMS_OFFSET: u64 = 0x000;
pub const BSP_PARAMS_SIZE: u64 = 0x100;
pub const STREAM_PARAMS_OFFSET: u64 = 0x100;
pub const STREAM_PARAMS_SIZE: u64 = 0x80;
/// `w0[0]`: bitstream length including the end marker.
pub const STREAM_LENGTH_OFFSET: u64 = STREAM_PARAMS_OFFSET;
/// `w1[0]`.
pub const STREAM_COUNT_OFFSET: u64 = STREAM_PARAMS_OFFSET + 0x40;
pub const VP_PARAMS_OFFSET: u64 = 0x200;
pub const VP_PARAMS_SIZE: u64 = 0x300;
pub const BITSTREAM_OFFSET: u64 = 0x700;
/// Two marker/zero pairs.
pub const END_MARKER_LEN: u64 = 16;

/// Default bitstream buffer size.
pub const DEFAULT_BSP_SIZE: u64 = 1 << 20;

/// Watchdog enable. Bit 16 (reset comm), bit 18 (report errors to the VP)
/// and bit 19 (crypto) stay clear.
const CAPS_WATCHDOG: u32 = 1 << 17;

/// Policy bits OR'd into every BSP launch.
pub const CAPS_POLICY: u32 = CAPS_WATCHDOG;

/// Marker word appended twice after the bitstream.
pub fn end_marker(codec: VideoCodec) -> u32 {
    match codec {
        VideoCodec::Mpeg12 => 0xb701_0000,
        VideoCodec::Mpeg4 => 0xb101_0000,
        VideoCodec::Vc1 => 0x0a01_0000,
        VideoCodec::H264 => 0x0b01_0000,
    }
}

/// BSP launch mode word.
pub fn mode(picture: &PictureDesc) -> u32 {
    match picture.codec() {
        VideoCodec::Mpeg12 => 0x0110,
        VideoCodec::Mpeg4 => 0x0114,
        VideoCodec::Vc1 => 0x0112,
        VideoCodec::H264 => 0x0113,
    }
}

/// Bits needed to code a VOP time increment for `resolution` ticks.
pub fn vop_time_increment_size(resolution: u32) -> DecodeResult<u32> {
    if resolution == 0 {
        return Err(DecodeError::config("vop_time_increment_resolution must be non-zero"));
    }
    Ok((32 - (resolution - 1).leading_zeros()).max(1))
}

/// Reset the header regions of `mapping` for a new frame.
///
/// The comm block is kept in debug-fence mode so diagnostics can follow it
/// across frames.
pub fn reset(mapping: &HostMapping, keep_comm: bool) -> DecodeResult<()> {
    mapping.fill(BSP_PARAMS_OFFSET, BSP_PARAMS_SIZE + STREAM_PARAMS_SIZE, 0)?;
    mapping.fill(VP_PARAMS_OFFSET, VP_PARAMS_SIZE, 0)?;
    if !keep_comm {
        mapping.fill(COMM_OFFSET, COMM_SIZE, 0)?;
    }
    mapping.write_u32(STREAM_LENGTH_OFFSET, END_MARKER_LEN as u32)?;
    mapping.write_u32(STREAM_COUNT_OFFSET, 1)?;
    Ok(())
}

/// Output of the BSP stage for one frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BspOutput {
    pub caps: u32,
    /// Bitstream length including the end marker.
    pub length: u32,
}

/// Close the bitstream at `cursor`, write the BSP picture parameters and
/// compute the launch caps.
pub fn finish(
    mapping: &HostMapping,
    cursor: u64,
    picture: &PictureDesc,
    profile: VideoProfile,
    geometry: Geometry,
) -> DecodeResult<BspOutput> {
    let caps = caps(picture, profile)? | CAPS_POLICY;
    params(picture, profile, geometry)?.write(mapping, BSP_PARAMS_OFFSET, BSP_PARAMS_SIZE)?;

    let marker = end_marker(picture.codec());
    mapping.write_u32s(cursor, &[marker, 0, marker, 0])?;

    let length = mapping.read_u32(STREAM_LENGTH_OFFSET)?;
    Ok(BspOutput { caps, length })
}

/// Largest slice count the caps field can carry.
pub const MAX_SLICES: u32 = 0xfff;

/// Codec part of the launch caps: slice count and codec id.
///
/// # Errors
/// A configuration error if the slice count does not fit the caps field.
pub fn caps(picture: &PictureDesc, profile: VideoProfile) -> DecodeResult<u32> {
    match picture {
        PictureDesc::Mpeg12(p) => {
            Ok(slice_field(picture, p.num_slices)? | u32::from(!profile.is_mpeg1()))
        }
        PictureDesc::Mpeg4(_) => Ok(4),
        PictureDesc::Vc1(p) => Ok(slice_field(picture, p.slice_count)? | 2),
        PictureDesc::H264(p) => Ok(slice_field(picture, p.slice_count)? | 3),
    }
}

fn slice_field(picture: &PictureDesc, slices: u32) -> DecodeResult<u32> {
    if slices > MAX_SLICES {
        return Err(DecodeError::config(format!(
            "{} slice count {slices} exceeds {MAX_SLICES}",
            picture.codec()
        )));
    }
    Ok(slices << 4)
}

/// BSP picture parameter block.
pub fn params(picture: &PictureDesc, profile: VideoProfile, geometry: Geometry) -> DecodeResult<ParamBlock> {
    let mut block = ParamBlock::new();
    block.word(geometry.width).word(geometry.height);
    match picture {
        PictureDesc::Mpeg12(p) => mpeg12_params(&mut block, p, profile),
        PictureDesc::Mpeg4(p) => mpeg4_params(&mut block, p)?,
        PictureDesc::Vc1(p) => vc1_params(&mut block, p, profile)?,
        PictureDesc::H264(p) => h264_params(&mut block, p),
    }
    Ok(block)
}

fn mpeg12_params(block: &mut ParamBlock, p: &Mpeg12Picture, profile: VideoProfile) {
    let structure = if profile.is_mpeg1() {
        u32::from(crate::picture::mpeg12::STRUCTURE_FRAME)
    } else {
        u32::from(p.picture_structure)
    };
    block
        .word(structure)
        .word(u32::from(p.picture_coding_type))
        .word(u32::from(p.intra_dc_precision))
        .flag(p.frame_pred_frame_dct)
        .flag(p.concealment_motion_vectors)
        .flag(p.intra_vlc_format)
        .flag(p.alternate_scan)
        .flag(p.q_scale_type)
        .word(u32::from(p.f_code[0][0]))
        .word(u32::from(p.f_code[0][1]))
        .word(u32::from(p.f_code[1][0]))
        .word(u32::from(p.f_code[1][1]));
}

fn mpeg4_params(block: &mut ParamBlock, p: &Mpeg4Picture) -> DecodeResult<()> {
    if p.vop_coding_type > mpeg4::VOP_B {
        return Err(DecodeError::config(format!(
            "unsupported MPEG-4 VOP coding type {}",
            p.vop_coding_type
        )));
    }
    block
        .word(vop_time_increment_size(p.vop_time_increment_resolution)?)
        .flag(p.interlaced)
        .flag(p.resync_marker_disable)
        .flag(p.quant_type)
        .flag(p.quarter_sample)
        .flag(p.short_video_header)
        .word(u32::from(p.vop_coding_type))
        .flag(p.rounding_control)
        .word(u32::from(p.vop_fcode_forward))
        .word(u32::from(p.vop_fcode_backward))
        .flag(p.top_field_first)
        .flag(p.alternate_vertical_scan);
    Ok(())
}

fn vc1_params(block: &mut ParamBlock, p: &Vc1Picture, profile: VideoProfile) -> DecodeResult<()> {
    let index = profile
        .vc1_index()
        .ok_or_else(|| DecodeError::config(format!("{profile:?} is not a VC-1 profile")))?;
    if p.picture_type > vc1::PICTURE_BI {
        return Err(DecodeError::config(format!(
            "unsupported VC-1 picture type {}",
            p.picture_type
        )));
    }
    block
        .word(u32::from(index))
        .bits(&[
            p.postprocflag,
            p.pulldown,
            p.interlace,
            p.tfcntrflag,
            p.finterpflag,
            p.psf,
            p.panscan_flag,
            p.refdist_flag,
            p.extended_mv,
            p.extended_dmv,
            p.overlap,
            p.vstransform,
            p.loopfilter,
            p.fastuvmc,
            p.multires,
            p.syncmarker,
            p.rangered,
        ])
        .word(u32::from(p.dquant))
        .word(u32::from(p.quantizer))
        .word(u32::from(p.maxbframes))
        .flag(p.range_mapy_flag)
        .word(u32::from(p.range_mapy))
        .flag(p.range_mapuv_flag)
        .word(u32::from(p.range_mapuv))
        .word(u32::from(p.frame_coding_mode))
        .word(u32::from(p.picture_type));
    Ok(())
}

fn h264_params(block: &mut ParamBlock, p: &H264Picture) {
    block
        .word(u32::from(p.log2_max_frame_num_minus4))
        .word(u32::from(p.pic_order_cnt_type))
        .word(u32::from(p.log2_max_pic_order_cnt_lsb_minus4))
        .flag(p.delta_pic_order_always_zero_flag)
        .flag(p.frame_mbs_only_flag)
        .flag(p.mb_adaptive_frame_field_flag)
        .flag(p.direct_8x8_inference_flag)
        .flag(p.entropy_coding_mode_flag)
        .flag(p.pic_order_present_flag)
        .word(u32::from(p.num_ref_idx_l0_active_minus1))
        .word(u32::from(p.num_ref_idx_l1_active_minus1))
        .flag(p.weighted_pred_flag)
        .word(u32::from(p.weighted_bipred_idc))
        .signed(i32::from(p.pic_init_qp_minus26))
        .flag(p.redundant_pic_cnt_present_flag)
        .flag(p.deblocking_filter_control_present_flag)
        .flag(p.transform_8x8_mode_flag)
        .flag(p.field_pic_flag)
        .flag(p.bottom_field_flag)
        .word(u32::from(p.num_ref_frames))
        .word(p.frame_num)
        .flag(p.is_reference);
}
