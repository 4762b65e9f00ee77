//! Fence strategies: how the session waits for an engine to finish a frame.
//!
//! Engines write the sequence number of the last frame they completed into
//! the fence buffer. Production sessions use [`NoFence`] and rely on the
//! ring depth; the diagnostic mode uses [`PollingFence`], which sleeps and
//! re-checks until the value arrives.

use std::thread;
use std::time::{Duration, Instant};

use gx_common::{GpuResult, HostMapping};
use tracing::{debug, error, trace};

use crate::comm::{CommStatus, COMM_OFFSET};
use crate::error::{DecodeError, DecodeResult};
use crate::queue::Engine;

/// Size of the fence buffer: one 16-byte lane per engine.
pub const FENCE_BUFFER_SIZE: u64 = 0x30;

/// What a wait is for.
#[derive(Copy, Clone, Debug)]
pub struct FenceTarget<'a> {
    pub engine: Engine,
    pub sequence: u64,
    pub fences: &'a HostMapping,
    /// Bitstream buffer of the frame, for comm block diagnostics.
    pub bitstream: &'a HostMapping,
}

impl FenceTarget<'_> {
    /// Last sequence the engine reported complete.
    pub fn completed(&self) -> GpuResult<u32> {
        self.fences.read_u32(self.engine.fence_offset())
    }

    /// Whether the engine has completed `sequence`, allowing for wrap.
    pub fn reached(&self) -> GpuResult<bool> {
        let completed = self.completed()?;
        Ok(completed.wrapping_sub(self.sequence as u32) as i32 >= 0)
    }
}

/// Waiting policy injected into a decoder session.
pub trait FenceStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Block until `target` is reached, or return immediately if the
    /// strategy does not wait.
    fn wait(&self, target: &FenceTarget<'_>) -> DecodeResult<()>;
}

/// Never waits.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoFence;

impl FenceStrategy for NoFence {
    fn name(&self) -> &'static str {
        "none"
    }

    fn wait(&self, _target: &FenceTarget<'_>) -> DecodeResult<()> {
        Ok(())
    }
}

/// Sleep-and-recheck until the fence value arrives or `timeout` passes.
#[derive(Copy, Clone, Debug)]
pub struct PollingFence {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollingFence {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl FenceStrategy for PollingFence {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn wait(&self, target: &FenceTarget<'_>) -> DecodeResult<()> {
        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            if target.reached()? {
                trace!(engine = %target.engine, sequence = target.sequence, polls, "Fence reached");
                return Ok(());
            }
            if started.elapsed() >= self.timeout {
                let comm = CommStatus::read(target.bitstream, COMM_OFFSET)?;
                error!(
                    engine = %target.engine,
                    sequence = target.sequence,
                    completed = target.completed()?,
                    bsp_cur_index = comm.bsp_cur_index,
                    byte_ofs = comm.byte_ofs,
                    pvp_cur_index = comm.pvp_cur_index,
                    pvp_stage = comm.pvp_stage,
                    "Fence wait timed out"
                );
                return Err(DecodeError::FenceTimeout {
                    engine: target.engine,
                    sequence: target.sequence,
                });
            }
            polls += 1;
            if polls % 100 == 0 {
                debug!(engine = %target.engine, sequence = target.sequence, polls, "Still waiting on fence");
            }
            thread::sleep(self.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target<'a>(fences: &'a HostMapping, bitstream: &'a HostMapping, sequence: u64) -> FenceTarget<'a> {
        FenceTarget {
            engine: Engine::Vp,
            sequence,
            fences,
            bitstream,
        }
    }

    #[test]
    fn reached_handles_wrap() {
        let fences = HostMapping::zeroed(FENCE_BUFFER_SIZE as usize);
        let bitstream = HostMapping::zeroed(0x800);
        fences.write_u32(Engine::Vp.fence_offset(), 5).unwrap();
        assert!(target(&fences, &bitstream, 5).reached().unwrap());
        assert!(target(&fences, &bitstream, 4).reached().unwrap());
        assert!(!target(&fences, &bitstream, 6).reached().unwrap());

        fences.write_u32(Engine::Vp.fence_offset(), 1).unwrap();
        assert!(target(&fences, &bitstream, u64::from(u32::MAX)).reached().unwrap());
    }

    #[test]
    fn polling_fence_times_out() {
        let fences = HostMapping::zeroed(FENCE_BUFFER_SIZE as usize);
        let bitstream = HostMapping::zeroed(0x800);
        let fence = PollingFence::new(Duration::from_micros(100), Duration::from_millis(5));
        assert_eq!(
            fence.wait(&target(&fences, &bitstream, 1)),
            Err(DecodeError::FenceTimeout {
                engine: Engine::Vp,
                sequence: 1
            })
        );
    }

    #[test]
    fn polling_fence_sees_late_signal() {
        let fences = HostMapping::zeroed(FENCE_BUFFER_SIZE as usize);
        let bitstream = HostMapping::zeroed(0x800);
        let writer = fences.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            writer.write_u32(Engine::Vp.fence_offset(), 3).unwrap();
        });
        let fence = PollingFence::new(Duration::from_micros(200), Duration::from_secs(5));
        fence.wait(&target(&fences, &bitstream, 3)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn no_fence_never_waits() {
        let fences = HostMapping::zeroed(FENCE_BUFFER_SIZE as usize);
        let bitstream = HostMapping::zeroed(0x800);
        NoFence.wait(&target(&fences, &bitstream, 99)).unwrap();
    }
}
