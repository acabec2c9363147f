use batforge_core::{JobId, JobState, MachineId};

use crate::bus::BusError;

/// Fatal conditions that abort a run. Expected job-level outcomes (walltime,
/// kill, rejection) are job states, never errors.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SimulationError {
    #[error("unknown job '{0}'")]
    UnknownJob(JobId),

    #[error("unknown profile '{name}' in workload '{workload}'")]
    UnknownProfile { workload: String, name: String },

    #[error("unknown machine {0}")]
    UnknownMachine(MachineId),

    #[error("job '{job}' placed on machine {machine}, which cannot execute jobs right now")]
    MachineRefusesExecution { job: JobId, machine: MachineId },

    #[error("cannot execute job '{job}' from state {state:?}")]
    InvalidExecution { job: JobId, state: JobState },

    #[error("cannot reject job '{job}' from state {state:?}")]
    InvalidRejection { job: JobId, state: JobState },

    #[error("cannot change state of job '{job}' from {from:?} to {to:?}")]
    InvalidStateChange {
        job: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("machine {0} received a pstate request while already switching")]
    PstateSwitchInProgress(MachineId),

    #[error("job '{job}': rank mapping has {mapping} entries for {ranks} trace files")]
    RankMappingMismatch {
        job: JobId,
        ranks: usize,
        mapping: usize,
    },

    #[error("job '{job}': rank {rank} maps to allocation index {host_index}, which is out of range")]
    RankMappingOutOfRange {
        job: JobId,
        rank: usize,
        host_index: usize,
    },

    #[error("job '{job}': profile '{profile}' does not match the allocation size")]
    ProfileShape { job: JobId, profile: String },

    #[error("execution of job '{0}' resulted in a null runtime")]
    ZeroRuntime(JobId),

    #[error("profile needs a parallel filesystem host but the platform has none")]
    MissingPfsHost,

    #[error("decider protocol error: {0}")]
    Protocol(String),

    #[error("decider connection failed: {0}")]
    Decider(String),

    #[error("platform failure: {0}")]
    Platform(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("server mailbox closed while the simulation was still live")]
    ServerMailboxClosed,
}
