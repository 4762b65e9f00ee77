//! Walks a built stream through an [`AddressSpace`] the way the hardware
//! parser would: following links, returning from with-return links and
//! stopping at terminate.

use gx_common::{AddressSpace, DeviceAddress, HostMapping};
use thiserror::Error;
use tracing::trace;

use crate::words::{ControlWord, WORD_SIZE};

/// Words parsed before a stream is declared runaway.
pub const DEFAULT_WORD_LIMIT: usize = 1 << 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("Stream address {0} is not mapped")]
    Unmapped(DeviceAddress),

    #[error("Unknown control word 0x{word:08x} at {address}")]
    UnknownWord { address: DeviceAddress, word: u32 },

    #[error("Stream ran past the end of its buffer at {0}")]
    PastEnd(DeviceAddress),

    #[error("Stream did not terminate within {0} words")]
    Runaway(usize),
}

/// One method packet read from a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub method: u16,
    pub payload: Vec<u32>,
    /// Address of the packet header.
    pub address: DeviceAddress,
}

/// Sequential parser over a device stream.
pub struct StreamReader<'a, A: AddressSpace + ?Sized> {
    space: &'a A,
    mapping: HostMapping,
    base: DeviceAddress,
    offset: u64,
    return_stack: Vec<DeviceAddress>,
    words_read: usize,
    word_limit: usize,
    links_followed: usize,
    done: bool,
}

impl<'a, A: AddressSpace + ?Sized> StreamReader<'a, A> {
    pub fn new(space: &'a A, start: DeviceAddress) -> Result<Self, ReadError> {
        let (mapping, offset) = space.resolve(start).ok_or(ReadError::Unmapped(start))?;
        Ok(Self {
            space,
            mapping,
            base: DeviceAddress(start.0 - offset),
            offset,
            return_stack: Vec::new(),
            words_read: 0,
            word_limit: DEFAULT_WORD_LIMIT,
            links_followed: 0,
            done: false,
        })
    }

    pub fn with_word_limit(mut self, limit: usize) -> Self {
        self.word_limit = limit;
        self
    }

    /// Links followed so far, including with-return links.
    pub fn links_followed(&self) -> usize {
        self.links_followed
    }

    fn address(&self) -> DeviceAddress {
        self.base.offset(self.offset)
    }

    fn jump(&mut self, target: DeviceAddress) -> Result<(), ReadError> {
        let (mapping, offset) = self.space.resolve(target).ok_or(ReadError::Unmapped(target))?;
        trace!(%target, "Following stream link");
        self.base = DeviceAddress(target.0 - offset);
        self.mapping = mapping;
        self.offset = offset;
        Ok(())
    }

    fn read_word(&mut self) -> Result<u32, ReadError> {
        if self.words_read >= self.word_limit {
            return Err(ReadError::Runaway(self.word_limit));
        }
        let word = self
            .mapping
            .read_u32(self.offset)
            .map_err(|_| ReadError::PastEnd(self.address()))?;
        self.offset += WORD_SIZE;
        self.words_read += 1;
        Ok(word)
    }

    /// Next packet, or `None` once the stream terminates (or returns with an
    /// empty return stack).
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ReadError> {
        while !self.done {
            let address = self.address();
            let first = self.read_word()?;
            let decoded = match ControlWord::decode(&[first]) {
                // Links are the only two-word control words.
                None if first >> 28 == 0xe => {
                    let second = self.read_word()?;
                    ControlWord::decode(&[first, second])
                }
                other => other,
            };
            match decoded {
                Some(ControlWord::Packet { method, count }) => {
                    let payload = (0..count)
                        .map(|_| self.read_word())
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Some(Packet {
                        method,
                        payload,
                        address,
                    }));
                }
                Some(ControlWord::Link {
                    target,
                    with_return,
                }) => {
                    if with_return {
                        self.return_stack.push(self.address());
                    }
                    self.links_followed += 1;
                    self.jump(target)?;
                }
                Some(ControlWord::Return) => match self.return_stack.pop() {
                    Some(back) => self.jump(back)?,
                    None => self.done = true,
                },
                Some(ControlWord::Terminate) => self.done = true,
                None => return Err(ReadError::UnknownWord { address, word: first }),
            }
        }
        Ok(None)
    }

    /// Read every remaining packet.
    pub fn collect_packets(mut self) -> Result<Vec<Packet>, ReadError> {
        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }
}

/// Parse every packet of the stream starting at `start`.
pub fn read_stream<A: AddressSpace + ?Sized>(
    space: &A,
    start: DeviceAddress,
) -> Result<Vec<Packet>, ReadError> {
    StreamReader::new(space, start)?.collect_packets()
}
