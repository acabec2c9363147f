use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::job::{Job, JobId};
use crate::profile::Profile;

/// A job shared between the server and the executor task that runs it.
pub type SharedJob = Arc<Mutex<Job>>;

/// One named workload: its jobs and the profiles they reference.
#[derive(Debug, Default)]
pub struct Workload {
    /// Workload name, unique within a run.
    pub name: String,
    jobs: HashMap<u32, SharedJob>,
    profiles: HashMap<String, Profile>,
}

impl Workload {
    /// Builds an empty workload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: HashMap::new(),
            profiles: HashMap::new(),
        }
    }

    /// Adds a job. Returns `false` (leaving the existing entry untouched)
    /// when the job number is already taken.
    pub fn add_job(&mut self, job: Job) -> bool {
        debug_assert_eq!(job.id.workload, self.name);
        match self.jobs.entry(job.id.number) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(job)));
                true
            }
        }
    }

    /// Adds or replaces a named profile.
    pub fn add_profile(&mut self, name: impl Into<String>, profile: Profile) {
        self.profiles.insert(name.into(), profile);
    }

    /// Looks up a job by number.
    pub fn job(&self, number: u32) -> Option<SharedJob> {
        self.jobs.get(&number).cloned()
    }

    /// Looks up a profile by name.
    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// All jobs of the workload, in unspecified order.
    pub fn jobs(&self) -> impl Iterator<Item = &SharedJob> {
        self.jobs.values()
    }

    /// Number of jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

/// Every workload of a run, keyed by name. Both jobs and profiles may be
/// inserted dynamically while the simulation is in progress.
#[derive(Debug, Default)]
pub struct WorkloadSet {
    workloads: HashMap<String, Workload>,
}

impl WorkloadSet {
    /// Builds an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a workload, replacing any previous one with the same name.
    pub fn insert(&mut self, workload: Workload) {
        self.workloads.insert(workload.name.clone(), workload);
    }

    /// Looks up a workload by name.
    pub fn get(&self, name: &str) -> Option<&Workload> {
        self.workloads.get(name)
    }

    /// Looks up a workload by name, creating an empty one if absent.
    pub fn get_or_insert(&mut self, name: &str) -> &mut Workload {
        self.workloads
            .entry(name.to_string())
            .or_insert_with(|| Workload::new(name))
    }

    /// Resolves a job id to its shared job.
    pub fn job(&self, id: &JobId) -> Option<SharedJob> {
        self.workloads.get(&id.workload)?.job(id.number)
    }

    /// Resolves a profile by workload and name, cloning it out of the table.
    pub fn profile(&self, workload: &str, name: &str) -> Option<Profile> {
        self.workloads.get(workload)?.profile(name).cloned()
    }

    /// All workloads, in unspecified order.
    pub fn workloads(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.values()
    }
}
