//! Word-packed parameter blocks written into the bitstream buffer.

use gx_common::{DeviceAddress, HostMapping};

use crate::error::{DecodeError, DecodeResult};

/// Sequential builder for a fixed-layout parameter block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamBlock {
    words: Vec<u32>,
}

impl ParamBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn word(&mut self, value: u32) -> &mut Self {
        self.words.push(value);
        self
    }

    pub fn flag(&mut self, value: bool) -> &mut Self {
        self.word(u32::from(value))
    }

    pub fn signed(&mut self, value: i32) -> &mut Self {
        self.word(value as u32)
    }

    /// Address in 256-byte units.
    pub fn address(&mut self, address: DeviceAddress) -> &mut Self {
        self.word(address.shr8())
    }

    /// Pack `bits` into one word, first flag in bit 0.
    pub fn bits(&mut self, bits: &[bool]) -> &mut Self {
        let packed = bits
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, bit)| acc | u32::from(*bit) << i);
        self.word(packed)
    }

    /// Pack bytes four to a word, little-endian, zero padded.
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        for chunk in bytes.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.word(u32::from_le_bytes(word));
        }
        self
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Store the block at `offset`, failing if it exceeds `limit` bytes.
    pub fn write(&self, mapping: &HostMapping, offset: u64, limit: u64) -> DecodeResult<()> {
        let needed = self.words.len() as u64 * 4;
        if needed > limit {
            return Err(DecodeError::Overrun {
                needed,
                capacity: limit,
            });
        }
        mapping.write_u32s(offset, &self.words)?;
        Ok(())
    }
}
