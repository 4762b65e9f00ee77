//! Video processor (VP) stage.
//!
//! The VP picture parameters live at `0x200` of the frame's bitstream
//! buffer. References are passed as device addresses inside the session's
//! reference image; unresolved ones point at the null slot.

use gx_common::{DeviceAddress, VideoProfile};

use crate::error::{DecodeError, DecodeResult};
use crate::geometry::{Geometry, InterSizes, PlaneOffsets};
use crate::params::ParamBlock;
use crate::picture::{
    mpeg12, mpeg4, vc1, H264Picture, Mpeg12Picture, Mpeg4Picture, PictureDesc, QuantMatrix,
    Vc1Picture,
};

/// Default MPEG intra quantiser matrix, zig-zag order.
pub const DEFAULT_INTRA_MATRIX: QuantMatrix = [
    8, 16, 16, 19, 16, 19, 22, 22, 22, 22, 22, 22, 26, 24, 26, 27, 27, 27, 26, 26, 26, 26, 27, 27,
    27, 29, 29, 29, 34, 34, 34, 29, 29, 29, 27, 27, 29, 29, 32, 32, 34, 34, 37, 38, 37, 35, 35, 34,
    35, 38, 38, 40, 40, 40, 48, 48, 46, 46, 56, 56, 58, 69, 69, 83,
];

/// Default non-intra matrix (flat).
pub const DEFAULT_NON_INTRA_MATRIX: QuantMatrix = [16; 64];

/// Reference entries in the H.264 parameter block.
pub const H264_REFERENCE_ENTRIES: usize = 16;

const H264_FLAT_4X4: [[u8; 16]; 6] = [[16; 16]; 6];
const H264_FLAT_8X8: [[u8; 64]; 2] = [[16; 64]; 2];

/// Everything the VP stage needs besides the picture itself.
#[derive(Clone, Debug)]
pub struct VpInput<'a> {
    pub profile: VideoProfile,
    pub geometry: Geometry,
    pub offsets: PlaneOffsets,
    pub target_slot: u32,
    pub target: DeviceAddress,
    /// One entry per position of [`PictureDesc::references`]. `None` where
    /// the picture names no reference.
    pub references: &'a [Option<DeviceAddress>],
    /// Null slot, used for empty and unresolved references.
    pub null: DeviceAddress,
    pub inter: InterSizes,
    /// H.264 scratch region and its size.
    pub scratch: Option<(DeviceAddress, u64)>,
    /// The frame decodes the second field of a pair.
    pub second_field: bool,
}

impl VpInput<'_> {
    fn reference(&self, index: usize) -> DeviceAddress {
        self.references
            .get(index)
            .copied()
            .flatten()
            .unwrap_or(self.null)
    }
}

/// Output of the VP stage for one frame.
#[derive(Clone, Debug)]
pub struct VpOutput {
    pub params: ParamBlock,
    pub mode: u32,
    /// The decoded picture may be referenced by later frames.
    pub is_reference: bool,
    /// Reference addresses in the order the engine is given them.
    pub references: Vec<DeviceAddress>,
}

/// VP launch mode word.
pub fn mode(picture: &PictureDesc, profile: VideoProfile) -> u32 {
    match picture {
        PictureDesc::Mpeg12(_) => 0x01010 | u32::from(!profile.is_mpeg1()),
        PictureDesc::Mpeg4(_) => 0x01014,
        PictureDesc::Vc1(_) => 0x01012,
        PictureDesc::H264(_) => 0x01013,
    }
}

/// Whether the decoded picture can serve as a reference.
pub fn is_reference(picture: &PictureDesc) -> bool {
    match picture {
        PictureDesc::Mpeg12(p) => p.picture_coding_type <= mpeg12::CODING_P,
        PictureDesc::Mpeg4(p) => p.vop_coding_type < mpeg4::VOP_B,
        PictureDesc::Vc1(p) => p.picture_type < vc1::PICTURE_B,
        PictureDesc::H264(p) => p.is_reference,
    }
}

/// Fill the VP parameter block for `picture`.
pub fn build(picture: &PictureDesc, input: &VpInput<'_>) -> DecodeResult<VpOutput> {
    validate(picture, input.profile)?;
    let mut params = ParamBlock::new();
    params
        .word(input.geometry.mb_width())
        .word(input.geometry.mb_height())
        .word(input.offsets.y2)
        .word(input.offsets.cbcr)
        .word(input.offsets.cbcr2)
        .word(input.target_slot)
        .address(input.target)
        .word(input.inter.bucket_size)
        .word(input.inter.ring_size);

    let references = match picture {
        PictureDesc::Mpeg12(p) => mpeg12_params(&mut params, p, input)?,
        PictureDesc::Mpeg4(p) => mpeg4_params(&mut params, p, input),
        PictureDesc::Vc1(p) => vc1_params(&mut params, p, input),
        PictureDesc::H264(p) => h264_params(&mut params, p, input),
    };

    Ok(VpOutput {
        params,
        mode: mode(picture, input.profile),
        is_reference: is_reference(picture),
        references,
    })
}

/// Reject pictures the VP stage cannot describe. Runs before any state
/// changes so a failing frame can be corrected and ended again.
pub fn validate(picture: &PictureDesc, profile: VideoProfile) -> DecodeResult<()> {
    match picture {
        PictureDesc::Mpeg12(p) => mpeg12_structure(p, profile).map(|_| ()),
        PictureDesc::H264(p) if p.references.len() > H264_REFERENCE_ENTRIES => {
            Err(DecodeError::TooManyReferences {
                requested: p.references.len() as u32,
                max: H264_REFERENCE_ENTRIES as u32,
            })
        }
        _ => Ok(()),
    }
}

/// Picture structure the VP is given. MPEG-1 only has frames.
fn mpeg12_structure(p: &Mpeg12Picture, profile: VideoProfile) -> DecodeResult<u8> {
    if profile.is_mpeg1() {
        return Ok(mpeg12::STRUCTURE_FRAME);
    }
    if !(mpeg12::STRUCTURE_TOP..=mpeg12::STRUCTURE_FRAME).contains(&p.picture_structure) {
        return Err(DecodeError::config(format!(
            "invalid MPEG-2 picture structure {}",
            p.picture_structure
        )));
    }
    Ok(p.picture_structure)
}

fn mpeg12_params(
    params: &mut ParamBlock,
    p: &Mpeg12Picture,
    input: &VpInput<'_>,
) -> DecodeResult<Vec<DeviceAddress>> {
    let structure = mpeg12_structure(p, input.profile)?;

    // A lone backward reference moves to the first position.
    let first = input.references.first().copied().flatten();
    let second = input.references.get(1).copied().flatten();
    let mut compact = [None, None];
    compact[0] = first;
    compact[usize::from(first.is_some())] = second;
    let references: Vec<_> = compact.iter().map(|r| r.unwrap_or(input.null)).collect();

    params
        .word(u32::from(structure))
        .word(u32::from(p.picture_coding_type))
        .flag(p.top_field_first)
        .flag(p.full_pel_forward_vector)
        .flag(p.full_pel_backward_vector)
        .flag(p.alternate_scan)
        .address(references[0])
        .address(references[1])
        .bytes(p.intra_matrix.as_ref().unwrap_or(&DEFAULT_INTRA_MATRIX))
        .bytes(p.non_intra_matrix.as_ref().unwrap_or(&DEFAULT_NON_INTRA_MATRIX));
    Ok(references)
}

fn mpeg4_params(params: &mut ParamBlock, p: &Mpeg4Picture, input: &VpInput<'_>) -> Vec<DeviceAddress> {
    let references = vec![input.reference(0), input.reference(1)];
    params
        .word(u32::from(p.vop_coding_type))
        .flag(p.interlaced)
        .flag(p.top_field_first)
        .flag(p.alternate_vertical_scan)
        .flag(p.quant_type)
        .flag(p.quarter_sample)
        .flag(p.rounding_control)
        .signed(p.trd[0])
        .signed(p.trd[1])
        .signed(p.trb[0])
        .signed(p.trb[1])
        .address(references[0])
        .address(references[1])
        .bytes(p.intra_matrix.as_ref().unwrap_or(&DEFAULT_INTRA_MATRIX))
        .bytes(p.non_intra_matrix.as_ref().unwrap_or(&DEFAULT_NON_INTRA_MATRIX));
    references
}

fn vc1_params(params: &mut ParamBlock, p: &Vc1Picture, input: &VpInput<'_>) -> Vec<DeviceAddress> {
    let references = vec![input.reference(0), input.reference(1)];
    params
        .word(u32::from(input.profile.vc1_index().unwrap_or_default()))
        .word(u32::from(p.picture_type))
        .word(u32::from(p.frame_coding_mode))
        .word(u32::from(p.pquant))
        .bits(&[
            p.overlap,
            p.loopfilter,
            p.fastuvmc,
            p.rangered,
            p.range_mapy_flag,
            p.range_mapuv_flag,
            p.deblock_enable,
        ])
        .word(u32::from(p.range_mapy))
        .word(u32::from(p.range_mapuv))
        .address(references[0])
        .address(references[1]);
    references
}

fn h264_params(
    params: &mut ParamBlock,
    p: &H264Picture,
    input: &VpInput<'_>,
) -> Vec<DeviceAddress> {
    let (scratch, scratch_size) = input.scratch.unwrap_or((DeviceAddress::NULL, 0));
    params
        .flag(input.second_field)
        .flag(p.field_pic_flag)
        .flag(p.bottom_field_flag)
        .flag(p.is_reference)
        .word(p.frame_num)
        .signed(p.field_order_cnt[0])
        .signed(p.field_order_cnt[1])
        .flag(p.frame_mbs_only_flag)
        .flag(p.mb_adaptive_frame_field_flag)
        .flag(p.direct_8x8_inference_flag)
        .flag(p.transform_8x8_mode_flag)
        .flag(p.constrained_intra_pred_flag)
        .signed(i32::from(p.chroma_qp_index_offset))
        .signed(i32::from(p.second_chroma_qp_index_offset))
        .word(u32::from(p.weighted_bipred_idc))
        .word(p.references.len() as u32)
        .address(scratch)
        .word((scratch_size >> 8) as u32);

    let mut references = Vec::with_capacity(p.references.len());
    for index in 0..H264_REFERENCE_ENTRIES {
        match p.references.get(index) {
            Some(r) => {
                let address = input.reference(index);
                references.push(address);
                let flags = u32::from(r.is_long_term)
                    | u32::from(r.top_is_reference) << 1
                    | u32::from(r.bottom_is_reference) << 2
                    | (index as u32 + 1) << 8;
                params
                    .address(address)
                    .word(r.frame_num)
                    .signed(r.field_order_cnt[0])
                    .signed(r.field_order_cnt[1])
                    .word(flags);
            }
            None => {
                params.address(input.null).word(0).word(0).word(0).word(0);
            }
        }
    }

    for list in p.scaling_lists_4x4.as_ref().unwrap_or(&H264_FLAT_4X4) {
        params.bytes(list);
    }
    for list in p.scaling_lists_8x8.as_ref().unwrap_or(&H264_FLAT_8X8) {
        params.bytes(list);
    }
    references
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsp::VP_PARAMS_SIZE;

    fn input<'a>(profile: VideoProfile, references: &'a [Option<DeviceAddress>]) -> VpInput<'a> {
        let geometry = Geometry::new(1920, 1080);
        VpInput {
            profile,
            geometry,
            offsets: geometry.plane_offsets().unwrap(),
            target_slot: 0,
            target: DeviceAddress(0x2_0000_0000),
            references,
            null: DeviceAddress(0x2_00ff_0000),
            inter: geometry.inter_sizes(68, true, 4 << 20).unwrap(),
            scratch: None,
            second_field: false,
        }
    }

    #[test]
    fn mpeg12_lone_backward_reference_is_compacted() {
        let backward = DeviceAddress(0x2_0030_0000);
        let refs = [None, Some(backward)];
        let picture = PictureDesc::Mpeg12(Mpeg12Picture {
            picture_coding_type: mpeg12::CODING_B,
            picture_structure: mpeg12::STRUCTURE_FRAME,
            ..Default::default()
        });
        let out = build(&picture, &input(VideoProfile::Mpeg2Main, &refs)).unwrap();
        assert_eq!(out.references, vec![backward, DeviceAddress(0x2_00ff_0000)]);
        assert_eq!(out.mode, 0x01011);
        assert!(!out.is_reference);
    }

    #[test]
    fn mpeg2_rejects_bad_structure() {
        let picture = PictureDesc::Mpeg12(Mpeg12Picture {
            picture_coding_type: mpeg12::CODING_I,
            picture_structure: 0,
            ..Default::default()
        });
        let err = build(&picture, &input(VideoProfile::Mpeg2Main, &[])).unwrap_err();
        assert!(err.is_configuration());
        // MPEG-1 ignores the field and decodes frames.
        let out = build(&picture, &input(VideoProfile::Mpeg1, &[])).unwrap();
        assert_eq!(out.mode, 0x01010);
        assert!(out.is_reference);
    }

    #[test]
    fn reference_rules() {
        let p = |t| PictureDesc::Mpeg4(Mpeg4Picture {
            vop_coding_type: t,
            ..Default::default()
        });
        assert!(is_reference(&p(mpeg4::VOP_I)));
        assert!(is_reference(&p(mpeg4::VOP_P)));
        assert!(!is_reference(&p(mpeg4::VOP_B)));

        let v = |t| PictureDesc::Vc1(Vc1Picture {
            picture_type: t,
            ..Default::default()
        });
        assert!(is_reference(&v(vc1::PICTURE_P)));
        assert!(!is_reference(&v(vc1::PICTURE_BI)));
    }

    #[test]
    fn h264_block_fits_the_parameter_region() {
        let refs = vec![Some(DeviceAddress(0x2_0000_0000)); H264_REFERENCE_ENTRIES];
        let buffer = crate::buffer::VideoBuffer::from_planes(16, 16, Vec::new());
        let picture = PictureDesc::H264(H264Picture {
            is_reference: true,
            references: (0..H264_REFERENCE_ENTRIES as u32)
                .map(|i| crate::picture::H264Reference::frame(buffer.clone(), i, i as i32 * 2))
                .collect(),
            ..Default::default()
        });
        let out = build(&picture, &input(VideoProfile::H264High, &refs)).unwrap();
        assert!(out.params.len() as u64 * 4 <= VP_PARAMS_SIZE);
        assert_eq!(out.references.len(), H264_REFERENCE_ENTRIES);
        assert_eq!(out.mode, 0x01013);
    }
}
