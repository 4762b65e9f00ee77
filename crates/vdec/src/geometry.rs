//! Macroblock geometry and reference image layout.
//!
//! All offsets the engines take are in 256-byte units.

use serde::Serialize;

use crate::error::DecodeError;

/// Macroblocks covering `x` pixels.
pub fn mb(x: u32) -> u32 {
    (x + 15) >> 4
}

/// Macroblock pairs covering `x` pixels.
pub fn mb_half(x: u32) -> u32 {
    (x + 31) >> 5
}

/// Height aligned up to 64 lines.
pub fn align64(h: u32) -> u32 {
    (h + 63) & !63
}

/// Bytes of inter-stage buffer reserved per slice.
pub const SLICE_SIZE: u32 = 0x200;

/// Chroma and second-field plane offsets within one reference image.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlaneOffsets {
    /// Luma of the second field.
    pub y2: u32,
    /// Interleaved chroma.
    pub cbcr: u32,
    /// Chroma of the second field.
    pub cbcr2: u32,
}

/// Layout of the BSP to VP intermediate buffer, in 256-byte units.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InterSizes {
    /// Slice header area at the start of the buffer.
    pub slice_size: u32,
    /// Per-macroblock-row bucket after the slice area; zero for MPEG-1/2.
    pub bucket_size: u32,
    /// Usable buffer size, less a four-unit guard.
    pub ring_size: u32,
}

/// Frame geometry of a decoder session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn mb_width(&self) -> u32 {
        mb(self.width)
    }

    pub fn mb_height(&self) -> u32 {
        mb(self.height)
    }

    /// Bytes per decoded picture in the reference image.
    pub fn ref_stride(&self) -> u64 {
        u64::from(mb(self.width)) * 16
            * (u64::from(mb_half(self.height)) * 32 + u64::from(align64(self.height)) / 2)
    }

    /// Plane offsets within one reference picture.
    ///
    /// Fails with [`DecodeError::StrideOverflow`] if the planes do not fit
    /// the reference stride, which indicates a layout bug rather than bad
    /// input.
    pub fn plane_offsets(&self) -> Result<PlaneOffsets, DecodeError> {
        let w = mb(self.width);
        let y2 = mb_half(self.height) * w;
        let cbcr = y2 * 2;
        let cbcr2 = cbcr + w * (align64(self.height) >> 6);

        let required = u64::from(2 * (cbcr2 - cbcr) + cbcr) << 8;
        let stride = self.ref_stride();
        if required > stride {
            tracing::error!(required, stride, y2, cbcr, cbcr2, "Overshot reference stride");
            return Err(DecodeError::StrideOverflow { required, stride });
        }
        Ok(PlaneOffsets { y2, cbcr, cbcr2 })
    }

    /// Opaque H.264 scratch region placed after the reference pictures.
    // TODO: name this region once its hardware use is documented.
    pub fn h264_scratch_size(&self, max_references: u32) -> u64 {
        let blocks = mb(self.width) * ((mb(self.height) + 1) & !1);
        (u64::from((blocks + 3) >> 2) << 8) * u64::from(max_references + 1)
    }

    /// Reference image size: every slot, the null slot and the scratch tail.
    pub fn ref_image_size(&self, max_references: u32, scratch: u64) -> u64 {
        self.ref_stride() * u64::from(max_references + 2) + scratch
    }

    /// Intermediate buffer layout for `slice_count` slices.
    ///
    /// Fails with [`DecodeError::Overrun`] if the slice area does not fit
    /// the buffer.
    pub fn inter_sizes(
        &self,
        slice_count: u32,
        with_bucket: bool,
        inter_size: u64,
    ) -> Result<InterSizes, DecodeError> {
        let slice_bytes = u64::from(SLICE_SIZE) * u64::from(slice_count);
        if slice_bytes > inter_size {
            return Err(DecodeError::Overrun {
                needed: slice_bytes,
                capacity: inter_size,
            });
        }
        Ok(InterSizes {
            slice_size: (slice_bytes >> 8) as u32,
            bucket_size: if with_bucket { mb(self.width) * 3 } else { 0 },
            ring_size: u32::try_from(inter_size >> 8).unwrap_or(u32::MAX).saturating_sub(4),
        })
    }
}
