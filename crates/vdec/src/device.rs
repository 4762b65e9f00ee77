//! Software model of the decode engines.
//!
//! Executes submitted streams synchronously: it walks every packet through
//! the address space, updates the comm block on launches and writes fence
//! values. Pixel work is not modelled. Used by tests and tools to drive a
//! session without hardware.

use std::sync::Arc;

use gx_common::{AddressSpace, DeviceAddress, GpuError, HostMapping};
use gx_csb::{ReadError, StreamReader};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::bsp::END_MARKER_LEN;
use crate::comm::CommStatus;
use crate::methods::Method;
use crate::queue::{Engine, Submission, SubmitQueue};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Stream read failed: {0}")]
    Read(#[from] ReadError),

    #[error("Address {0} is not mapped")]
    Unmapped(DeviceAddress),

    #[error("Memory access failed: {0}")]
    Memory(#[from] GpuError),

    #[error("Unknown or malformed method 0x{method:04x}")]
    UnknownMethod { method: u16 },

    #[error("{engine} launched without {missing}")]
    MissingState { engine: Engine, missing: &'static str },

    #[error("Bitstream at {address} does not end with a marker")]
    MissingEndMarker { address: DeviceAddress },
}

/// One executed submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Execution {
    pub engine: Engine,
    pub sequence: u64,
    pub methods: Vec<Method>,
    pub links_followed: usize,
}

/// Per-stream engine registers.
#[derive(Default)]
struct EngineState {
    comm: Option<DeviceAddress>,
    bitstream: Option<(DeviceAddress, u32)>,
}

pub struct SoftwareDevice {
    space: Arc<dyn AddressSpace>,
    log: Mutex<Vec<Execution>>,
}

impl SoftwareDevice {
    pub fn new(space: Arc<dyn AddressSpace>) -> Self {
        Self {
            space,
            log: Mutex::new(Vec::new()),
        }
    }

    fn resolve(&self, address: DeviceAddress) -> Result<(HostMapping, u64), DeviceError> {
        self.space.resolve(address).ok_or(DeviceError::Unmapped(address))
    }

    /// Run one submission to completion.
    pub fn execute(&self, submission: &Submission) -> Result<Execution, DeviceError> {
        let engine = submission.engine;
        let mut reader = StreamReader::new(&*self.space, submission.start)?;
        let mut state = EngineState::default();
        let mut methods = Vec::new();

        while let Some(packet) = reader.next_packet()? {
            let method = Method::parse(&packet).ok_or(DeviceError::UnknownMethod {
                method: packet.method,
            })?;
            trace!(%engine, sequence = submission.sequence, ?method, "Executing method");
            match method {
                Method::SetComm { address } => state.comm = Some(address),
                Method::SetBitstream { data, length, .. } => state.bitstream = Some((data, length)),
                Method::Launch { .. } => self.launch(engine, submission.sequence, &state)?,
                Method::FenceWrite { address, value } => {
                    let (mapping, offset) = self.resolve(address)?;
                    mapping.write_u32(offset, value)?;
                }
                _ => {}
            }
            methods.push(method);
        }

        let execution = Execution {
            engine,
            sequence: submission.sequence,
            methods,
            links_followed: reader.links_followed(),
        };
        debug!(
            %engine,
            sequence = submission.sequence,
            methods = execution.methods.len(),
            "Executed submission"
        );
        self.log.lock().push(execution.clone());
        Ok(execution)
    }

    fn launch(&self, engine: Engine, sequence: u64, state: &EngineState) -> Result<(), DeviceError> {
        match engine {
            Engine::Bsp => {
                let comm = state.comm.ok_or(DeviceError::MissingState {
                    engine,
                    missing: "comm block",
                })?;
                let (data, length) = state.bitstream.ok_or(DeviceError::MissingState {
                    engine,
                    missing: "bitstream",
                })?;
                self.check_end_marker(data, length)?;
                let (mapping, base) = self.resolve(comm)?;
                CommStatus::record_parse(&mapping, base, sequence as u32, length)?;
            }
            Engine::Vp => {
                let comm = state.comm.ok_or(DeviceError::MissingState {
                    engine,
                    missing: "comm block",
                })?;
                let (mapping, base) = self.resolve(comm)?;
                CommStatus::record_process(&mapping, base, sequence as u32)?;
            }
            Engine::Ppp => {}
        }
        Ok(())
    }

    fn check_end_marker(&self, data: DeviceAddress, length: u32) -> Result<(), DeviceError> {
        let address = data.offset(u64::from(length).saturating_sub(END_MARKER_LEN));
        let (mapping, offset) = self.resolve(address)?;
        let words = mapping.read_u32s(offset, 4)?;
        if words[0] == 0 || words[0] != words[2] || words[1] != 0 || words[3] != 0 {
            return Err(DeviceError::MissingEndMarker { address });
        }
        Ok(())
    }

    /// Every submission executed so far.
    pub fn executions(&self) -> Vec<Execution> {
        self.log.lock().clone()
    }

    pub fn execution_count(&self) -> usize {
        self.log.lock().len()
    }
}

impl SubmitQueue for SoftwareDevice {
    fn submit(&self, submission: Submission) -> Result<(), GpuError> {
        self.execute(&submission)
            .map(|_| ())
            .map_err(|err| GpuError::Submit {
                queue: submission.engine.name().to_string(),
                reason: err.to_string(),
            })
    }
}
