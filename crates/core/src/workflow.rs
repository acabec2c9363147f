use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// One task of a workflow: a job plus the jobs that must complete before it
/// may be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTask {
    /// The job to submit.
    pub job: JobId,
    /// Jobs that must reach a completed state first. Dependencies must point
    /// at jobs of the same workflow.
    #[serde(default)]
    pub deps: Vec<JobId>,
}

/// A dependency DAG over jobs of one workload, driven by the workflow
/// submitter: a task is submitted only once all of its dependencies have
/// completed (and its own submission time has passed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name; also names the submitter.
    pub name: String,
    /// The tasks of the DAG.
    pub tasks: Vec<WorkflowTask>,
}

impl Workflow {
    /// Names of the workloads the workflow's jobs live in.
    pub fn workload_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.job.workload.as_str())
    }
}
