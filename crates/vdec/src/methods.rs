//! Method packets the decoder emits into engine command streams.
//!
//! Addresses travel as two words (high, low). Each packet is emitted with
//! [`ControlStream::emit_packet`], which never splits it across buffers.

use gx_common::DeviceAddress;
use gx_csb::{ControlStream, Packet, StreamError};

/// Method identifiers.
pub mod id {
    pub const SET_BITSTREAM: u16 = 0x0100;
    pub const SET_PARAMS: u16 = 0x0104;
    pub const SET_INTER: u16 = 0x0108;
    pub const SET_COMM: u16 = 0x010c;
    pub const SET_REFERENCE: u16 = 0x0110;
    pub const SET_TARGET: u16 = 0x0114;
    pub const SET_SCRATCH: u16 = 0x0118;
    pub const SET_SOURCE: u16 = 0x011c;
    pub const SET_DESTINATION: u16 = 0x0120;
    pub const LAUNCH: u16 = 0x0300;
    pub const FENCE_WRITE: u16 = 0x0304;
}

/// A decoded engine method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Method {
    /// Stream parameters and raw bitstream of the frame.
    SetBitstream {
        params: DeviceAddress,
        data: DeviceAddress,
        length: u32,
    },
    /// Picture parameter block for this engine.
    SetParams { address: DeviceAddress },
    /// Intermediate buffer and its layout, in 256-byte units.
    SetInter {
        address: DeviceAddress,
        slice_size: u32,
        bucket_size: u32,
        ring_size: u32,
    },
    SetComm { address: DeviceAddress },
    SetReference { index: u32, address: DeviceAddress },
    SetTarget { slot: u32, address: DeviceAddress },
    SetScratch { address: DeviceAddress, size: u32 },
    /// Decoded picture with its plane offsets, in 256-byte units.
    SetSource {
        address: DeviceAddress,
        y2: u32,
        cbcr: u32,
        cbcr2: u32,
    },
    SetDestination { plane: u32, address: DeviceAddress },
    /// Start the engine with the given mode and capability words.
    Launch { mode: u32, caps: u32 },
    /// Write `value` to `address` once the engine is done.
    FenceWrite { address: DeviceAddress, value: u32 },
}

fn addr(address: DeviceAddress) -> [u32; 2] {
    [address.high(), address.low()]
}

fn join(high: u32, low: u32) -> DeviceAddress {
    DeviceAddress(u64::from(high) << 32 | u64::from(low))
}

impl Method {
    /// Method identifier and payload words.
    pub fn encode(&self) -> (u16, Vec<u32>) {
        match *self {
            Self::SetBitstream {
                params,
                data,
                length,
            } => {
                let mut words = addr(params).to_vec();
                words.extend(addr(data));
                words.push(length);
                (id::SET_BITSTREAM, words)
            }
            Self::SetParams { address } => (id::SET_PARAMS, addr(address).to_vec()),
            Self::SetInter {
                address,
                slice_size,
                bucket_size,
                ring_size,
            } => {
                let mut words = addr(address).to_vec();
                words.extend([slice_size, bucket_size, ring_size]);
                (id::SET_INTER, words)
            }
            Self::SetComm { address } => (id::SET_COMM, addr(address).to_vec()),
            Self::SetReference { index, address } => {
                let [high, low] = addr(address);
                (id::SET_REFERENCE, vec![index, high, low])
            }
            Self::SetTarget { slot, address } => {
                let [high, low] = addr(address);
                (id::SET_TARGET, vec![slot, high, low])
            }
            Self::SetScratch { address, size } => {
                let [high, low] = addr(address);
                (id::SET_SCRATCH, vec![high, low, size])
            }
            Self::SetSource {
                address,
                y2,
                cbcr,
                cbcr2,
            } => {
                let [high, low] = addr(address);
                (id::SET_SOURCE, vec![high, low, y2, cbcr, cbcr2])
            }
            Self::SetDestination { plane, address } => {
                let [high, low] = addr(address);
                (id::SET_DESTINATION, vec![plane, high, low])
            }
            Self::Launch { mode, caps } => (id::LAUNCH, vec![mode, caps]),
            Self::FenceWrite { address, value } => {
                let [high, low] = addr(address);
                (id::FENCE_WRITE, vec![high, low, value])
            }
        }
    }

    /// Decode a packet read back from a stream. `None` for unknown methods
    /// or malformed payloads.
    pub fn parse(packet: &Packet) -> Option<Self> {
        let p = packet.payload.as_slice();
        let method = match (packet.method, p) {
            (id::SET_BITSTREAM, &[ph, pl, dh, dl, length]) => Self::SetBitstream {
                params: join(ph, pl),
                data: join(dh, dl),
                length,
            },
            (id::SET_PARAMS, &[h, l]) => Self::SetParams { address: join(h, l) },
            (id::SET_INTER, &[h, l, slice_size, bucket_size, ring_size]) => Self::SetInter {
                address: join(h, l),
                slice_size,
                bucket_size,
                ring_size,
            },
            (id::SET_COMM, &[h, l]) => Self::SetComm { address: join(h, l) },
            (id::SET_REFERENCE, &[index, h, l]) => Self::SetReference {
                index,
                address: join(h, l),
            },
            (id::SET_TARGET, &[slot, h, l]) => Self::SetTarget {
                slot,
                address: join(h, l),
            },
            (id::SET_SCRATCH, &[h, l, size]) => Self::SetScratch {
                address: join(h, l),
                size,
            },
            (id::SET_SOURCE, &[h, l, y2, cbcr, cbcr2]) => Self::SetSource {
                address: join(h, l),
                y2,
                cbcr,
                cbcr2,
            },
            (id::SET_DESTINATION, &[plane, h, l]) => Self::SetDestination {
                plane,
                address: join(h, l),
            },
            (id::LAUNCH, &[mode, caps]) => Self::Launch { mode, caps },
            (id::FENCE_WRITE, &[h, l, value]) => Self::FenceWrite {
                address: join(h, l),
                value,
            },
            _ => return None,
        };
        Some(method)
    }

    /// Emit this method as one packet.
    pub fn emit(&self, stream: &mut ControlStream) -> Result<(), StreamError> {
        let (method, payload) = self.encode();
        stream.emit_packet(method, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inverts_encode() {
        let methods = [
            Method::SetBitstream {
                params: DeviceAddress(0x1_0000_0100),
                data: DeviceAddress(0x1_0000_0700),
                length: 1234,
            },
            Method::SetReference {
                index: 3,
                address: DeviceAddress(0x2_0030_0000),
            },
            Method::Launch {
                mode: 0x1413,
                caps: 0x10,
            },
        ];
        for method in methods {
            let (id, payload) = method.encode();
            let packet = Packet {
                method: id,
                payload,
                address: DeviceAddress::NULL,
            };
            assert_eq!(Method::parse(&packet), Some(method));
        }
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let packet = Packet {
            method: id::LAUNCH,
            payload: vec![1],
            address: DeviceAddress::NULL,
        };
        assert_eq!(Method::parse(&packet), None);
    }
}
