use std::fmt;

use serde::{Deserialize, Serialize};

use crate::machine::MachineId;

/// Identifies a job across every workload of a run.
///
/// The textual form is `<workload>!<number>`, which is also how the id
/// travels on the decider wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct JobId {
    /// Name of the workload the job belongs to.
    pub workload: String,
    /// Job number, unique within its workload.
    pub number: u32,
}

impl JobId {
    /// Builds a job id from its two parts.
    pub fn new(workload: impl Into<String>, number: u32) -> Self {
        Self {
            workload: workload.into(),
            number,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.workload, self.number)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for JobId {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let (workload, number) = raw
            .rsplit_once('!')
            .ok_or_else(|| format!("job id {raw:?} is missing the '!' separator"))?;
        if workload.is_empty() {
            return Err(format!("job id {raw:?} has an empty workload name"));
        }
        let number = number
            .parse()
            .map_err(|_| format!("job id {raw:?} has an invalid job number"))?;
        Ok(Self {
            workload: workload.to_string(),
            number,
        })
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Known to the workload but not yet announced to the server.
    NotSubmitted,
    /// Announced to the server; awaiting a decider decision.
    Submitted,
    /// Currently executing on an allocation.
    Running,
    /// Ran to the end of its profile within the walltime.
    CompletedSuccessfully,
    /// Stopped early: walltime hit or an explicit kill.
    CompletedKilled,
    /// Terminal state only reachable through a decider state override.
    CompletedWalltimeReached,
    /// Refused by the decider; never ran.
    Rejected,
}

impl JobState {
    /// Whether the state is terminal (the job will never run again).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::CompletedSuccessfully
                | JobState::CompletedKilled
                | JobState::CompletedWalltimeReached
                | JobState::Rejected
        )
    }

    /// Whether the state marks a completed execution (terminal and ran).
    pub fn is_completed(self) -> bool {
        self.is_terminal() && self != JobState::Rejected
    }

    fn not_submitted() -> Self {
        JobState::NotSubmitted
    }
}

/// One job of a workload.
///
/// Execution-time fields (`allocation`, `starting_time`, `runtime`,
/// `consumed_energy`) are written by the job-executor task that owns the job
/// while it runs; everything else is set at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// The job identifier.
    pub id: JobId,
    /// Simulated time at which the job enters the system.
    #[serde(default)]
    pub submission_time: f64,
    /// Maximum allowed runtime in simulated seconds.
    pub walltime: f64,
    /// Number of machines the job needs.
    pub required_resources: usize,
    /// Name of the profile describing the job's computational shape.
    pub profile: String,
    /// Current lifecycle state.
    #[serde(default = "JobState::not_submitted")]
    pub state: JobState,
    /// Machines the job runs (or ran) on; empty before execution.
    #[serde(default)]
    pub allocation: Vec<MachineId>,
    /// Simulated time at which execution started.
    #[serde(default)]
    pub starting_time: f64,
    /// Wall-clock (simulated) duration of the execution.
    #[serde(default)]
    pub runtime: f64,
    /// Energy consumed by the allocation during the execution, in joules.
    #[serde(default)]
    pub consumed_energy: f64,
    /// MPI rank to allocation-index mapping; empty means round-robin.
    #[serde(default)]
    pub rank_hosts: Vec<usize>,
    /// Reason attached by the decider when it forces a killed state.
    #[serde(default)]
    pub kill_reason: Option<String>,
}

impl Job {
    /// Builds a job in the `NotSubmitted` state.
    pub fn new(
        id: JobId,
        submission_time: f64,
        walltime: f64,
        required_resources: usize,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            id,
            submission_time,
            walltime,
            required_resources,
            profile: profile.into(),
            state: JobState::NotSubmitted,
            allocation: Vec::new(),
            starting_time: 0.0,
            runtime: 0.0,
            consumed_energy: 0.0,
            rank_hosts: Vec::new(),
            kill_reason: None,
        }
    }
}

/// A decider-issued binding of a job to machines.
///
/// Owned by a single job-executor task for the duration of the execution and
/// dropped on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The job being placed.
    pub job_id: JobId,
    /// Ordered machine ids hosting the job.
    pub machines: Vec<MachineId>,
    /// Optional executor-to-machine-index mapping (MPI replay); `None`
    /// selects the round-robin default.
    pub mapping: Option<Vec<usize>>,
}

impl Allocation {
    /// Builds an allocation without an executor mapping.
    pub fn new(job_id: JobId, machines: Vec<MachineId>) -> Self {
        Self {
            job_id,
            machines,
            mapping: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_textual_form_round_trips() {
        let id = JobId::new("batch0", 42);
        assert_eq!(id.to_string(), "batch0!42");
        assert_eq!(JobId::try_from("batch0!42".to_string()).unwrap(), id);
    }

    #[test]
    fn job_id_rejects_malformed_text() {
        assert!(JobId::try_from("no-separator".to_string()).is_err());
        assert!(JobId::try_from("!7".to_string()).is_err());
        assert!(JobId::try_from("wl!notanumber".to_string()).is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::CompletedKilled.is_terminal());
        assert!(JobState::Rejected.is_terminal());
        assert!(!JobState::Rejected.is_completed());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Submitted.is_terminal());
    }

    #[test]
    fn job_deserializes_with_defaults() {
        let job: Job = serde_json::from_str(
            r#"{"id": "dyn!1", "walltime": 60.0, "required_resources": 2, "profile": "p"}"#,
        )
        .unwrap();
        assert_eq!(job.id, JobId::new("dyn", 1));
        assert_eq!(job.state, JobState::NotSubmitted);
        assert!(job.allocation.is_empty());
    }
}
