//! Control word encoding shared by every stream type.
//!
//! Each word carries its block type in bits 31:28. Stream control words
//! (link, return, terminate) steer the hardware stream parser; packet
//! headers introduce `count` payload words for method `method`.
//!
//! ```text
//! PACKET      0x1 | count[27:16] | method[15:0]      + count payload words
//! LINK        0xE | ret[27] | addr[39:32] in [7:0]    + addr[31:0]
//! RETURN      0xD
//! TERMINATE   0xF
//! ```

use gx_common::DeviceAddress;

/// Bytes per stream word.
pub const WORD_SIZE: u64 = 4;

/// Words in a stream link.
pub const LINK_WORDS: usize = 2;

/// Bytes in a stream link; every buffer reserves this much at its tail.
pub const LINK_BYTES: u64 = LINK_WORDS as u64 * WORD_SIZE;

/// Largest payload a single packet header can announce.
pub const MAX_PACKET_WORDS: usize = 0xfff;

/// Link targets are 40-bit, word aligned.
pub const ADDRESS_MASK: u64 = (1 << 40) - 1;

const TYPE_SHIFT: u32 = 28;
const TYPE_PACKET: u32 = 0x1;
const TYPE_RETURN: u32 = 0xd;
const TYPE_LINK: u32 = 0xe;
const TYPE_TERMINATE: u32 = 0xf;
const LINK_RETURN_BIT: u32 = 1 << 27;

/// One decoded control word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlWord {
    /// Header of a method packet followed by `count` payload words.
    Packet { method: u16, count: u16 },
    /// Continue parsing at `target`, optionally returning here afterwards.
    Link { target: DeviceAddress, with_return: bool },
    /// Return to the word after the last with-return link.
    Return,
    /// End of stream.
    Terminate,
}

/// Encoded form of a [`ControlWord`]: one or two words.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EncodedWord {
    words: [u32; 2],
    len: usize,
}

impl EncodedWord {
    pub fn as_slice(&self) -> &[u32] {
        &self.words[..self.len]
    }
}

impl ControlWord {
    /// Packet header for `count` payload words.
    pub fn packet(method: u16, count: usize) -> Self {
        debug_assert!(count <= MAX_PACKET_WORDS);
        Self::Packet {
            method,
            count: count as u16,
        }
    }

    /// Number of words this control word occupies.
    pub fn len(&self) -> usize {
        match self {
            Self::Link { .. } => LINK_WORDS,
            _ => 1,
        }
    }

    pub fn encode(self) -> EncodedWord {
        match self {
            Self::Packet { method, count } => EncodedWord {
                words: [
                    TYPE_PACKET << TYPE_SHIFT
                        | (u32::from(count) & MAX_PACKET_WORDS as u32) << 16
                        | u32::from(method),
                    0,
                ],
                len: 1,
            },
            Self::Link {
                target,
                with_return,
            } => {
                let addr = target.0 & ADDRESS_MASK;
                let mut msb = TYPE_LINK << TYPE_SHIFT | (addr >> 32) as u32;
                if with_return {
                    msb |= LINK_RETURN_BIT;
                }
                EncodedWord {
                    words: [msb, addr as u32],
                    len: LINK_WORDS,
                }
            }
            Self::Return => EncodedWord {
                words: [TYPE_RETURN << TYPE_SHIFT, 0],
                len: 1,
            },
            Self::Terminate => EncodedWord {
                words: [TYPE_TERMINATE << TYPE_SHIFT, 0],
                len: 1,
            },
        }
    }

    /// Decode the control word at the head of `words`.
    ///
    /// Returns `None` for an unknown block type or a truncated link.
    pub fn decode(words: &[u32]) -> Option<Self> {
        let first = *words.first()?;
        match first >> TYPE_SHIFT {
            TYPE_PACKET => Some(Self::Packet {
                method: first as u16,
                count: ((first >> 16) & MAX_PACKET_WORDS as u32) as u16,
            }),
            TYPE_LINK => {
                let lsb = *words.get(1)?;
                let msb = u64::from(first & 0xff);
                Some(Self::Link {
                    target: DeviceAddress(msb << 32 | u64::from(lsb)),
                    with_return: first & LINK_RETURN_BIT != 0,
                })
            }
            TYPE_RETURN => Some(Self::Return),
            TYPE_TERMINATE => Some(Self::Terminate),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_carries_forty_bit_address() {
        let link = ControlWord::Link {
            target: DeviceAddress(0xab_1234_5678),
            with_return: true,
        };
        let encoded = link.encode();
        assert_eq!(encoded.as_slice(), &[0xe800_00ab, 0x1234_5678]);
        assert_eq!(ControlWord::decode(encoded.as_slice()), Some(link));
    }

    #[test]
    fn packet_header_fields() {
        let header = ControlWord::packet(0x0400, 3).encode();
        assert_eq!(header.as_slice(), &[0x1003_0400]);
        assert_eq!(
            ControlWord::decode(header.as_slice()),
            Some(ControlWord::Packet {
                method: 0x400,
                count: 3
            })
        );
    }

    #[test]
    fn unknown_and_truncated_words() {
        assert_eq!(ControlWord::decode(&[]), None);
        assert_eq!(ControlWord::decode(&[0x0000_0001]), None);
        assert_eq!(ControlWord::decode(&[0xe000_0001]), None);
        assert_eq!(ControlWord::decode(&[0xf000_0000]), Some(ControlWord::Terminate));
        assert_eq!(ControlWord::decode(&[0xd000_0000]), Some(ControlWord::Return));
    }
}
