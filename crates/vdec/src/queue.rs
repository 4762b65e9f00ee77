//! Per-engine submission queues.

use std::fmt;
use std::sync::Arc;

use gx_common::{BufferObject, DeviceAddress, GpuError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

/// One of the three decode engines.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Engine {
    /// Bitstream parser.
    Bsp,
    /// Video processor.
    Vp,
    /// Post processor.
    Ppp,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Bsp, Engine::Vp, Engine::Ppp];

    /// Offset of this engine's completed-sequence word in the fence buffer.
    pub fn fence_offset(self) -> u64 {
        match self {
            Self::Bsp => 0x00,
            Self::Vp => 0x10,
            Self::Ppp => 0x20,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bsp => "BSP",
            Self::Vp => "VP",
            Self::Ppp => "PPP",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A baked engine command stream ready for execution.
#[derive(Debug)]
pub struct Submission {
    pub engine: Engine,
    pub sequence: u64,
    /// Address the engine starts parsing at.
    pub start: DeviceAddress,
    /// Stream buffers; kept alive until the engine is done with them.
    pub buffers: Vec<BufferObject>,
}

/// Hardware command queue of one engine.
pub trait SubmitQueue: Send + Sync {
    fn submit(&self, submission: Submission) -> Result<(), GpuError>;
}

/// The three queues a decoder session submits to.
#[derive(Clone)]
pub struct EngineQueues {
    pub bsp: Arc<dyn SubmitQueue>,
    pub vp: Arc<dyn SubmitQueue>,
    pub ppp: Arc<dyn SubmitQueue>,
}

impl EngineQueues {
    /// Route all three engines to the same queue.
    pub fn shared(queue: Arc<dyn SubmitQueue>) -> Self {
        Self {
            bsp: Arc::clone(&queue),
            vp: Arc::clone(&queue),
            ppp: queue,
        }
    }

    pub fn get(&self, engine: Engine) -> &Arc<dyn SubmitQueue> {
        match engine {
            Engine::Bsp => &self.bsp,
            Engine::Vp => &self.vp,
            Engine::Ppp => &self.ppp,
        }
    }
}

impl fmt::Debug for EngineQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineQueues").finish_non_exhaustive()
    }
}

/// Queue that keeps every submission for later inspection.
#[derive(Debug, Default)]
pub struct RecordingQueue {
    submissions: Mutex<Vec<Submission>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.submissions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.submissions.lock().is_empty()
    }

    /// `(engine, sequence, start)` of every submission in order.
    pub fn log(&self) -> Vec<(Engine, u64, DeviceAddress)> {
        self.submissions
            .lock()
            .iter()
            .map(|s| (s.engine, s.sequence, s.start))
            .collect()
    }

    /// Start address of the submission for `engine` and `sequence`.
    pub fn find(&self, engine: Engine, sequence: u64) -> Option<DeviceAddress> {
        self.submissions
            .lock()
            .iter()
            .find(|s| s.engine == engine && s.sequence == sequence)
            .map(|s| s.start)
    }

    /// Remove and return every recorded submission.
    pub fn drain(&self) -> Vec<Submission> {
        std::mem::take(&mut *self.submissions.lock())
    }
}

impl SubmitQueue for RecordingQueue {
    fn submit(&self, submission: Submission) -> Result<(), GpuError> {
        trace!(
            engine = %submission.engine,
            sequence = submission.sequence,
            start = %submission.start,
            "Recorded submission"
        );
        self.submissions.lock().push(submission);
        Ok(())
    }
}
