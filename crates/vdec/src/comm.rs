//! The comm block: a handshake area in every bitstream buffer that the
//! engines update as they parse. The driver only reads it for diagnostics.

use gx_common::{GpuResult, HostMapping};
use serde::Serialize;

/// Offset of the comm block inside a bitstream buffer.
pub const COMM_OFFSET: u64 = 0x500;
/// Size of the comm block.
pub const COMM_SIZE: u64 = 0x200;

const BSP_CUR_INDEX: u64 = 0x00;
const BYTE_OFS: u64 = 0x04;
const STATUS: u64 = 0x08;
const POS: u64 = 0x48;
const PVP_CUR_INDEX: u64 = 0x100;
const ACKED_BSP_CUR_INDEX: u64 = 0x104;
const PVP_STAGE: u64 = 0x108;
const PARSE_ENDPOS_INDEX: u64 = 0x10c;

/// Status and position history entries kept by the parser.
pub const HISTORY_LEN: usize = 0x10;

/// Snapshot of a comm block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommStatus {
    pub bsp_cur_index: u32,
    pub byte_ofs: u32,
    pub status: Vec<u32>,
    pub pos: Vec<u32>,
    pub pvp_cur_index: u32,
    pub acked_bsp_cur_index: u32,
    pub pvp_stage: u32,
    pub parse_endpos_index: u32,
}

impl CommStatus {
    /// Decode the comm block at `base` in `mapping`.
    pub fn read(mapping: &HostMapping, base: u64) -> GpuResult<Self> {
        Ok(Self {
            bsp_cur_index: mapping.read_u32(base + BSP_CUR_INDEX)?,
            byte_ofs: mapping.read_u32(base + BYTE_OFS)?,
            status: mapping.read_u32s(base + STATUS, HISTORY_LEN)?,
            pos: mapping.read_u32s(base + POS, HISTORY_LEN)?,
            pvp_cur_index: mapping.read_u32(base + PVP_CUR_INDEX)?,
            acked_bsp_cur_index: mapping.read_u32(base + ACKED_BSP_CUR_INDEX)?,
            pvp_stage: mapping.read_u32(base + PVP_STAGE)?,
            parse_endpos_index: mapping.read_u32(base + PARSE_ENDPOS_INDEX)?,
        })
    }

    /// Record that the parser finished frame `sequence` after `bytes` bytes.
    pub fn record_parse(mapping: &HostMapping, base: u64, sequence: u32, bytes: u32) -> GpuResult<()> {
        let slot = u64::from(sequence) % HISTORY_LEN as u64;
        mapping.write_u32(base + BSP_CUR_INDEX, sequence)?;
        mapping.write_u32(base + BYTE_OFS, bytes)?;
        mapping.write_u32(base + STATUS + slot * 4, 1)?;
        mapping.write_u32(base + POS + slot * 4, bytes)?;
        mapping.write_u32(base + PARSE_ENDPOS_INDEX, sequence)
    }

    /// Record that the video processor finished frame `sequence`.
    pub fn record_process(mapping: &HostMapping, base: u64, sequence: u32) -> GpuResult<()> {
        mapping.write_u32(base + PVP_CUR_INDEX, sequence)?;
        mapping.write_u32(base + ACKED_BSP_CUR_INDEX, sequence)?;
        mapping.write_u32(base + PVP_STAGE, 2)
    }
}
