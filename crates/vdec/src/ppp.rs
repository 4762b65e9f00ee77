//! Post processor (PPP) stage: copies the decoded slot out of the
//! reference image into the target picture's planes.

use gx_common::VideoProfile;

use crate::error::{DecodeError, DecodeResult};
use crate::geometry::Geometry;
use crate::picture::PictureDesc;

/// Capability word of every PPP launch.
pub const PPP_CAPS: u32 = 0x10;

/// PPP launch mode word.
pub fn mode(picture: &PictureDesc, profile: VideoProfile) -> u32 {
    match picture {
        PictureDesc::Mpeg12(_) => 0x1410 | u32::from(!profile.is_mpeg1()),
        PictureDesc::Mpeg4(_) => 0x1414,
        PictureDesc::Vc1(_) => 0x1412,
        PictureDesc::H264(_) => 0x1413,
    }
}

/// Reject pictures the post processor cannot pass through unchanged.
pub fn validate(picture: &PictureDesc, geometry: Geometry) -> DecodeResult<()> {
    if let PictureDesc::Vc1(p) = picture {
        if p.deblock_enable {
            return Err(DecodeError::config("VC-1 post-process deblocking is not supported"));
        }
        if geometry.width % 16 != 0 || geometry.height % 16 != 0 {
            return Err(DecodeError::config(format!(
                "VC-1 post-process needs macroblock aligned frames, got {}x{}",
                geometry.width, geometry.height
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::{H264Picture, Vc1Picture};

    #[test]
    fn vc1_restrictions() {
        let aligned = Geometry::new(1280, 720);
        let ok = PictureDesc::Vc1(Vc1Picture::default());
        assert!(validate(&ok, aligned).is_ok());
        assert!(validate(&ok, Geometry::new(1920, 1080)).is_err());

        let deblock = PictureDesc::Vc1(Vc1Picture {
            deblock_enable: true,
            ..Default::default()
        });
        assert!(validate(&deblock, aligned).unwrap_err().is_configuration());
    }

    #[test]
    fn other_codecs_pass_through() {
        let h264 = PictureDesc::H264(H264Picture::default());
        assert!(validate(&h264, Geometry::new(1920, 1080)).is_ok());
        assert_eq!(mode(&h264, VideoProfile::H264Main), 0x1413);
    }
}
