//! Video codec and profile enums.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Codec family handled by the fixed-function decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    Mpeg12,
    Mpeg4,
    Vc1,
    H264,
}

impl VideoCodec {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Mpeg12 => "MPEG-1/2",
            Self::Mpeg4 => "MPEG-4 Part 2",
            Self::Vc1 => "VC-1",
            Self::H264 => "H.264/AVC",
        }
    }

    /// Hardware limit on reference pictures per frame for this codec.
    pub fn max_references(self) -> u32 {
        match self {
            Self::H264 => 16,
            Self::Mpeg12 | Self::Mpeg4 | Self::Vc1 => 2,
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Decode profile. The profile selects the codec and a handful of
/// codec-specific parameter bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoProfile {
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

impl VideoProfile {
    /// Codec family this profile belongs to.
    pub fn codec(self) -> VideoCodec {
        match self {
            Self::Mpeg1 | Self::Mpeg2Simple | Self::Mpeg2Main => VideoCodec::Mpeg12,
            Self::Mpeg4Simple | Self::Mpeg4AdvancedSimple => VideoCodec::Mpeg4,
            Self::Vc1Simple | Self::Vc1Main | Self::Vc1Advanced => VideoCodec::Vc1,
            Self::H264Baseline | Self::H264Main | Self::H264High => VideoCodec::H264,
        }
    }

    /// VC-1 profile index as the bitstream parser expects it
    /// (0 simple, 1 main, 2 advanced). `None` for other codecs.
    pub fn vc1_index(self) -> Option<u8> {
        match self {
            Self::Vc1Simple => Some(0),
            Self::Vc1Main => Some(1),
            Self::Vc1Advanced => Some(2),
            _ => None,
        }
    }

    pub fn is_mpeg1(self) -> bool {
        self == Self::Mpeg1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_codec_mapping() {
        assert_eq!(VideoProfile::Mpeg1.codec(), VideoCodec::Mpeg12);
        assert_eq!(VideoProfile::Mpeg2Main.codec(), VideoCodec::Mpeg12);
        assert_eq!(VideoProfile::Mpeg4AdvancedSimple.codec(), VideoCodec::Mpeg4);
        assert_eq!(VideoProfile::Vc1Advanced.codec(), VideoCodec::Vc1);
        assert_eq!(VideoProfile::H264High.codec(), VideoCodec::H264);
    }

    #[test]
    fn vc1_profile_index() {
        assert_eq!(VideoProfile::Vc1Simple.vc1_index(), Some(0));
        assert_eq!(VideoProfile::Vc1Main.vc1_index(), Some(1));
        assert_eq!(VideoProfile::Vc1Advanced.vc1_index(), Some(2));
        assert_eq!(VideoProfile::H264Main.vc1_index(), None);
    }

    #[test]
    fn codec_display() {
        assert_eq!(VideoCodec::H264.display_name(), "H.264/AVC");
        assert_eq!(VideoCodec::Mpeg12.display_name(), "MPEG-1/2");
    }
}
