//! Simulated engines on their own thread.
//!
//! Submissions travel over a crossbeam channel, so the session returns from
//! `end` before the engines run, as it would with real hardware.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use gx_common::{AddressSpace, GpuError};
use gx_vdec::{Engine, SoftwareDevice, Submission, SubmitQueue};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// What the device thread did before it stopped.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DeviceSummary {
    pub executed: u64,
    pub failed: u64,
    pub links_followed: u64,
    pub per_engine: [u64; 3],
    pub last_error: Option<String>,
}

/// Queue end the session submits to.
pub struct ChannelQueue {
    sender: Sender<Submission>,
}

impl SubmitQueue for ChannelQueue {
    fn submit(&self, submission: Submission) -> Result<(), GpuError> {
        self.sender.send(submission).map_err(|err| GpuError::Submit {
            queue: err.0.engine.name().to_string(),
            reason: "device thread has stopped".to_string(),
        })
    }
}

pub struct DeviceThread {
    handle: JoinHandle<()>,
    summary: Arc<Mutex<DeviceSummary>>,
}

impl DeviceThread {
    /// Start the engines. The thread runs until every [`ChannelQueue`]
    /// handed out is dropped.
    pub fn spawn(space: Arc<dyn AddressSpace>) -> anyhow::Result<(Self, Arc<ChannelQueue>)> {
        let (sender, receiver) = channel::unbounded();
        let summary = Arc::new(Mutex::new(DeviceSummary::default()));
        let device = SoftwareDevice::new(space);

        let thread_summary = Arc::clone(&summary);
        let handle = thread::Builder::new()
            .name("gx-device".into())
            .spawn(move || run(&device, &receiver, &thread_summary))?;

        Ok((Self { handle, summary }, Arc::new(ChannelQueue { sender })))
    }

    /// Wait for the thread to drain its queue and stop.
    pub fn join(self) -> anyhow::Result<DeviceSummary> {
        self.handle
            .join()
            .map_err(|_| anyhow::anyhow!("device thread panicked"))?;
        let summary = self.summary.lock().clone();
        Ok(summary)
    }
}

fn run(device: &SoftwareDevice, receiver: &Receiver<Submission>, summary: &Mutex<DeviceSummary>) {
    for submission in receiver {
        let result = device.execute(&submission);
        let mut summary = summary.lock();
        match result {
            Ok(execution) => {
                summary.executed += 1;
                summary.links_followed += execution.links_followed as u64;
                let lane = match execution.engine {
                    Engine::Bsp => 0,
                    Engine::Vp => 1,
                    Engine::Ppp => 2,
                };
                summary.per_engine[lane] += 1;
            }
            Err(err) => {
                warn!(engine = %submission.engine, sequence = submission.sequence, error = %err, "Submission failed");
                summary.failed += 1;
                summary.last_error = Some(err.to_string());
            }
        }
    }
    debug!("Device thread stopped");
}
