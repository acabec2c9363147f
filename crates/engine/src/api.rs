//! Public API types for the `batforge` coordination engine.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use batforge_core::{JobId, JobState, Machines, Workflow, WorkloadSet};

use crate::bus::{Bus, SERVER_MAILBOX};
use crate::context::SimContext;
use crate::platform::Platform;
use crate::server::ServerRuntime;
use crate::submitter;

/// Configuration for one simulation run.
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    /// Track per-job consumed energy and drive the energy trace sink.
    pub energy_tracking: bool,
    /// Drive the scheduling trace sink on job kills.
    pub schedule_trace: bool,
    /// Whether the decider intends to submit jobs dynamically; when `true`
    /// the run only terminates after an `END_DYNAMIC_SUBMIT`.
    pub dynamic_submissions: bool,
}

/// The simulated clock.
///
/// Thin wrapper over the tokio clock, which must be paused for the run:
/// `now` is the number of simulated seconds since the simulation started and
/// `sleep` suspends the calling task for a simulated duration.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    origin: tokio::time::Instant,
}

impl SimClock {
    pub(crate) fn start() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }

    /// Current simulated time, in seconds since the run started.
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Suspends the calling task for `seconds` of simulated time. Zero and
    /// negative durations return immediately.
    pub async fn sleep(&self, seconds: f64) {
        if seconds > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        }
    }
}

/// Progress snapshot of a job at the moment it was killed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Name of the profile the job was playing.
    pub profile: String,
    /// Simulated seconds the job had been running when the kill landed.
    pub elapsed: f64,
}

/// Connection to the external decision process.
///
/// The relay performs exactly one `round_trip` per outbound batch: `request`
/// is the serialized event envelope, and the returned string must be the
/// decider's reply envelope. No real I/O is required; test deciders answer
/// in-process.
#[async_trait]
pub trait DeciderConnection: Send {
    /// Sends one request envelope and returns the decider's reply envelope.
    async fn round_trip(&mut self, request: &str) -> anyhow::Result<String>;
}

/// Handle job models use to message the decider.
///
/// The platform layer receives one through
/// [`Platform::attach_job_messenger`](crate::platform::Platform::attach_job_messenger);
/// payloads sent here reach the decider as `FROM_JOB_MSG` events in the next
/// outbound batch.
#[derive(Clone)]
pub struct JobMessenger {
    pub(crate) bus: Bus,
}

impl JobMessenger {
    /// Sends one payload from `job` to the decider.
    pub fn message_scheduler(&self, job: JobId, payload: serde_json::Value) {
        self.bus.send_to_server(crate::bus::Message::FromJob {
            job_id: job,
            payload,
        });
    }
}

/// Sink for the scheduling and energy traces.
///
/// All methods default to no-ops; implement the ones your tracer records.
/// File formats are the implementor's concern.
pub trait TraceSink: Send + Sync {
    /// A job started executing (energy trace).
    fn job_start(&self, _time: f64, _job: &JobId) {}
    /// A job finished executing (energy trace).
    fn job_end(&self, _time: f64, _job: &JobId) {}
    /// Jobs were stopped before completing (scheduling trace).
    fn job_kill(&self, _time: f64, _jobs: &[JobId]) {}
}

pub(crate) struct NoopTrace;

impl TraceSink for NoopTrace {}

/// Final state of one job after the run.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// The job identifier.
    pub id: JobId,
    /// Terminal (or last observed) state.
    pub state: JobState,
    /// Simulated submission time.
    pub submission_time: f64,
    /// Simulated time execution started, when it did.
    pub starting_time: f64,
    /// Simulated execution duration, when the job ran.
    pub runtime: f64,
    /// Joules consumed by the allocation, when energy tracking was on.
    pub consumed_energy: f64,
    /// Kill reason attached by the decider, if any.
    pub kill_reason: Option<String>,
}

/// Result of a completed simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Simulated time at which the run terminated.
    pub makespan: f64,
    /// Per-job final states, ordered by job id.
    pub jobs: Vec<JobReport>,
}

/// One simulation run, ready to start.
pub struct Simulation {
    /// Run configuration.
    pub config: SimulationConfig,
    /// The static workloads (jobs and profiles).
    pub workloads: WorkloadSet,
    /// Workflows submitted with dependency ordering. Workloads referenced by
    /// a workflow do not also get a static submitter.
    pub workflows: Vec<Workflow>,
    /// The machine table.
    pub machines: Machines,
    /// The platform collaborator executing parallel tasks.
    pub platform: Arc<dyn Platform>,
    /// The decision process connection.
    pub decider: Box<dyn DeciderConnection>,
    /// Optional trace sink; defaults to a no-op.
    pub trace: Option<Arc<dyn TraceSink>>,
}

impl Simulation {
    /// Runs the simulation to termination.
    ///
    /// Must execute on a current-thread runtime whose clock is paused, so
    /// that simulated time auto-advances while every task is blocked.
    pub async fn run(self) -> anyhow::Result<SimulationReport> {
        let ctx = Arc::new(SimContext {
            cfg: self.config,
            clock: SimClock::start(),
            bus: Bus::new(),
            platform: self.platform,
            workloads: Mutex::new(self.workloads),
            machines: Mutex::new(self.machines),
            trace: self.trace.unwrap_or_else(|| Arc::new(NoopTrace)),
        });
        ctx.platform.attach_clock(ctx.clock);
        ctx.platform.attach_job_messenger(JobMessenger {
            bus: ctx.bus.clone(),
        });

        let server_rx = ctx.bus.register(SERVER_MAILBOX)?;

        let workflow_workloads: HashSet<String> = self
            .workflows
            .iter()
            .flat_map(|wf| wf.workload_names().map(str::to_string))
            .collect();

        let mut expected_submitters = 0;
        {
            let workloads = ctx.workloads.lock().expect("workload table poisoned");
            for workload in workloads.workloads() {
                if workload.job_count() > 0 && !workflow_workloads.contains(&workload.name) {
                    submitter::spawn_static(ctx.clone(), workload.name.clone());
                    expected_submitters += 1;
                }
            }
        }
        for workflow in self.workflows {
            submitter::spawn_workflow(ctx.clone(), workflow);
            expected_submitters += 1;
        }

        ServerRuntime::new(ctx.clone(), server_rx, self.decider, expected_submitters)
            .run()
            .await?;

        Ok(build_report(&ctx))
    }

    /// Builds a current-thread runtime with a paused clock and runs the
    /// simulation on it.
    pub fn run_blocking(self) -> anyhow::Result<SimulationReport> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        runtime.block_on(async {
            tokio::time::pause();
            self.run().await
        })
    }
}

fn build_report(ctx: &SimContext) -> SimulationReport {
    let workloads = ctx.workloads.lock().expect("workload table poisoned");
    let mut jobs: Vec<JobReport> = workloads
        .workloads()
        .flat_map(|wl| wl.jobs())
        .map(|shared| {
            let job = shared.lock().expect("job poisoned");
            JobReport {
                id: job.id.clone(),
                state: job.state,
                submission_time: job.submission_time,
                starting_time: job.starting_time,
                runtime: job.runtime,
                consumed_energy: job.consumed_energy,
                kill_reason: job.kill_reason.clone(),
            }
        })
        .collect();
    jobs.sort_by(|a, b| a.id.cmp(&b.id));

    SimulationReport {
        makespan: ctx.clock.now(),
        jobs,
    }
}
