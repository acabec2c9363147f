#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Data model for the `batforge` batch-scheduling simulator: jobs, profiles,
//! workloads, workflows and the machine table. Pure types with no async code;
//! the coordination engine lives in `batforge-engine`.

mod job;
mod machine;
mod profile;
mod workflow;
mod workload;

pub use job::{Allocation, Job, JobId, JobState};
pub use machine::{Machine, MachineId, MachineState, Machines};
pub use profile::Profile;
pub use workflow::{Workflow, WorkflowTask};
pub use workload::{SharedJob, Workload, WorkloadSet};
