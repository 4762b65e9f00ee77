//! Synthetic streams: random slice data and a simple I/P picture pattern
//! per codec.

use std::sync::Arc;

use gx_common::{VideoCodec, VideoProfile};
use gx_vdec::picture::{mpeg12, mpeg4, vc1};
use gx_vdec::{
    H264Picture, H264Reference, Mpeg12Picture, Mpeg4Picture, PictureDesc, Vc1Picture, VideoBuffer,
};
use rand::rngs::StdRng;
use rand::Rng;

/// Random slice payload of roughly `bytes` bytes.
pub fn slice_data(rng: &mut StdRng, bytes: usize) -> Vec<u8> {
    let len = rng.gen_range(bytes / 2..=bytes.max(1));
    (0..len).map(|_| rng.gen()).collect()
}

/// Picture `index` of a stream whose intra period is `gop`. `refs` are the
/// most recently decoded pictures, newest first.
pub fn picture(
    profile: VideoProfile,
    index: u32,
    gop: u32,
    slices: u32,
    refs: &[Arc<VideoBuffer>],
) -> PictureDesc {
    let intra = gop == 0 || index % gop == 0;
    let previous = if intra { None } else { refs.first().cloned() };

    match profile.codec() {
        VideoCodec::Mpeg12 => PictureDesc::Mpeg12(Mpeg12Picture {
            picture_coding_type: if intra { mpeg12::CODING_I } else { mpeg12::CODING_P },
            picture_structure: mpeg12::STRUCTURE_FRAME,
            frame_pred_frame_dct: true,
            f_code: [[1, 1], [15, 15]],
            num_slices: slices,
            refs: [previous, None],
            ..Default::default()
        }),
        VideoCodec::Mpeg4 => PictureDesc::Mpeg4(Mpeg4Picture {
            vop_coding_type: if intra { mpeg4::VOP_I } else { mpeg4::VOP_P },
            vop_time_increment_resolution: 30000,
            vop_fcode_forward: 1,
            refs: [previous, None],
            ..Default::default()
        }),
        VideoCodec::Vc1 => PictureDesc::Vc1(Vc1Picture {
            picture_type: if intra { vc1::PICTURE_I } else { vc1::PICTURE_P },
            loopfilter: true,
            pquant: 4,
            slice_count: slices,
            refs: [previous, None],
            ..Default::default()
        }),
        VideoCodec::H264 => {
            let references = if intra {
                Vec::new()
            } else {
                refs.iter()
                    .enumerate()
                    .map(|(i, buffer)| {
                        let frame_num = index - 1 - i as u32;
                        H264Reference::frame(Arc::clone(buffer), frame_num, frame_num as i32 * 2)
                    })
                    .collect()
            };
            PictureDesc::H264(H264Picture {
                slice_count: slices,
                is_reference: true,
                frame_num: index,
                field_order_cnt: [index as i32 * 2; 2],
                frame_mbs_only_flag: true,
                direct_8x8_inference_flag: true,
                num_ref_frames: refs.len() as u8,
                references,
                ..Default::default()
            })
        }
    }
}
