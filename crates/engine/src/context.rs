use std::sync::{Arc, Mutex};

use batforge_core::{JobId, MachineId, Machines, Profile, SharedJob, WorkloadSet};

use crate::api::{SimClock, SimulationConfig, TraceSink};
use crate::bus::Bus;
use crate::error::SimulationError;
use crate::platform::Platform;

/// Shared run state handed to the server and every worker task. Only the
/// server mutates job/machine state and counters; workers touch the job
/// fields handed to them and talk back through the bus.
pub(crate) struct SimContext {
    pub(crate) cfg: SimulationConfig,
    pub(crate) clock: SimClock,
    pub(crate) bus: Bus,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) workloads: Mutex<WorkloadSet>,
    pub(crate) machines: Mutex<Machines>,
    pub(crate) trace: Arc<dyn TraceSink>,
}

impl SimContext {
    pub(crate) fn shared_job(&self, id: &JobId) -> Result<SharedJob, SimulationError> {
        self.workloads
            .lock()
            .expect("workload table poisoned")
            .job(id)
            .ok_or_else(|| SimulationError::UnknownJob(id.clone()))
    }

    pub(crate) fn profile(&self, workload: &str, name: &str) -> Result<Profile, SimulationError> {
        self.workloads
            .lock()
            .expect("workload table poisoned")
            .profile(workload, name)
            .ok_or_else(|| SimulationError::UnknownProfile {
                workload: workload.to_string(),
                name: name.to_string(),
            })
    }

    /// Energy reader handed to machine-table transitions.
    pub(crate) fn energy_probe(&self) -> impl Fn(MachineId) -> f64 + '_ {
        move |machine| self.platform.consumed_energy(machine)
    }
}
