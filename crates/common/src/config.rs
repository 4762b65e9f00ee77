//! Configuration structs for decoder sessions and control stream builders.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::VideoProfile;
use crate::error::ConfigError;

/// Hardware limit on reference pictures a frame may name.
pub const MAX_REFERENCES: u32 = 16;

/// Ring depth used in production: the VP stage runs one frame behind BSP.
pub const DEFAULT_RING_DEPTH: u32 = 2;

/// Video decoder session configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub profile: VideoProfile,
    pub width: u32,
    pub height: u32,
    /// Maximum number of reference frames a picture may name.
    pub max_references: u32,
    /// Number of bitstream scratch buffers cycled by sequence number.
    pub ring_depth: u32,
    /// Diagnostic mode: single-entry ring and a busy-poll wait on every
    /// engine fence after each submission.
    pub debug_fence: bool,
    /// Sleep between fence polls.
    pub fence_poll_interval_us: u64,
    /// Give up waiting on a fence after this long.
    pub fence_timeout_ms: u64,
    /// Override for the bitstream buffer size (bytes).
    pub bsp_size: Option<u64>,
    /// Override for the BSP -> VP intermediate buffer size (bytes).
    pub inter_size: Option<u64>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            profile: VideoProfile::H264Main,
            width: 1920,
            height: 1080,
            max_references: 4,
            ring_depth: DEFAULT_RING_DEPTH,
            debug_fence: false,
            fence_poll_interval_us: 1000,
            fence_timeout_ms: 2000,
            bsp_size: None,
            inter_size: None,
        }
    }
}

impl DecoderConfig {
    pub fn new(profile: VideoProfile, width: u32, height: u32, max_references: u32) -> Self {
        Self {
            profile,
            width,
            height,
            max_references,
            ..Self::default()
        }
    }

    /// Ring depth actually used: debug-fence mode serialises on one buffer.
    pub fn effective_ring_depth(&self) -> u32 {
        if self.debug_fence {
            1
        } else {
            self.ring_depth
        }
    }

    pub fn fence_poll_interval(&self) -> Duration {
        Duration::from_micros(self.fence_poll_interval_us)
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// Check the preconditions a session relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width > 4096 || self.height > 4096 {
            return Err(ConfigError::Invalid(format!(
                "frame dimensions {}x{} exceed 4096x4096",
                self.width, self.height
            )));
        }
        if self.max_references > MAX_REFERENCES {
            return Err(ConfigError::TooManyReferences {
                requested: self.max_references,
                max: MAX_REFERENCES,
            });
        }
        if self.ring_depth == 0 {
            return Err(ConfigError::Invalid("ring depth must be at least 1".into()));
        }
        if self.debug_fence && self.fence_poll_interval_us == 0 {
            return Err(ConfigError::Invalid(
                "fence poll interval must be non-zero in debug-fence mode".into(),
            ));
        }
        Ok(())
    }
}

/// Control stream builder configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsbConfig {
    /// Size of every physical stream buffer in bytes.
    pub bo_size: u64,
    /// Buffer alignment (SLC cache line).
    pub alignment: u64,
    /// Guard padding the stream parser may prefetch past the last word.
    pub guard_size: u64,
    /// Zero the moved-out bytes of a state update on extend. Always on in
    /// debug builds.
    pub zero_after_move: bool,
}

impl Default for CsbConfig {
    fn default() -> Self {
        Self {
            bo_size: 16 * 1024,
            alignment: 64,
            guard_size: 64,
            zero_after_move: false,
        }
    }
}

impl CsbConfig {
    pub fn validate(&self, link_bytes: u64) -> Result<(), ConfigError> {
        if !self.alignment.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "stream buffer alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.bo_size % 4 != 0 || self.guard_size % 4 != 0 {
            return Err(ConfigError::Invalid(
                "stream buffer and guard sizes must be whole words".into(),
            ));
        }
        if self.bo_size <= link_bytes + self.guard_size {
            return Err(ConfigError::Invalid(format!(
                "stream buffer of {} bytes leaves no room after the {}-byte reserved tail",
                self.bo_size,
                link_bytes + self.guard_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_decoder_config_is_valid() {
        let config = DecoderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_ring_depth(), 2);
    }

    #[test]
    fn debug_fence_forces_single_buffer() {
        let config = DecoderConfig {
            debug_fence: true,
            ..DecoderConfig::default()
        };
        assert_eq!(config.effective_ring_depth(), 1);
    }

    #[test]
    fn rejects_bad_decoder_configs() {
        let zero = DecoderConfig::new(VideoProfile::Mpeg2Main, 0, 480, 2);
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid(_))));

        let refs = DecoderConfig::new(VideoProfile::H264High, 1280, 720, 17);
        assert_eq!(
            refs.validate(),
            Err(ConfigError::TooManyReferences {
                requested: 17,
                max: MAX_REFERENCES
            })
        );

        let ring = DecoderConfig {
            ring_depth: 0,
            ..DecoderConfig::default()
        };
        assert!(ring.validate().is_err());
    }

    #[test]
    fn decoder_config_from_partial_json() {
        let json = r#"{ "profile": "Vc1Advanced", "width": 720, "height": 576 }"#;
        let config: DecoderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.profile, VideoProfile::Vc1Advanced);
        assert_eq!(config.width, 720);
        assert_eq!(config.max_references, 4);
        assert_eq!(config.ring_depth, DEFAULT_RING_DEPTH);
    }

    #[test]
    fn csb_config_needs_room_past_the_tail() {
        let ok = CsbConfig::default();
        assert!(ok.validate(8).is_ok());

        let tiny = CsbConfig {
            bo_size: 72,
            ..CsbConfig::default()
        };
        assert!(tiny.validate(8).is_err());

        let odd = CsbConfig {
            alignment: 48,
            ..CsbConfig::default()
        };
        assert!(odd.validate(8).is_err());
    }
}
