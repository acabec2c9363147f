use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use batforge_core::{JobId, JobState, MachineState};

use crate::api::DeciderConnection;
use crate::bus::Message;
use crate::context::SimContext;
use crate::error::SimulationError;
use crate::execution::{self, RunningJob};
use crate::protocol::{JobSummary, OutboundEvent, TimedEvent};
use crate::relay::{self, SharedDecider};
use crate::worker::{self, KillTarget};

#[derive(Debug)]
struct SubmitterInfo {
    callback_on_completion: bool,
    finished: bool,
}

/// The authoritative server loop: consumes every message, owns the counters
/// and readiness flags, spawns workers and flushes event batches to the
/// decider when it goes quiescent.
pub(crate) struct ServerRuntime {
    ctx: Arc<SimContext>,
    rx: mpsc::UnboundedReceiver<Message>,
    decider: SharedDecider,
    relay_task: Option<JoinHandle<Result<(), SimulationError>>>,

    expected_submitters: usize,
    submitters: HashMap<String, SubmitterInfo>,
    job_origin: HashMap<JobId, String>,
    running: HashMap<JobId, RunningJob>,

    nb_submitters: usize,
    nb_submitters_finished: usize,
    nb_running_jobs: usize,
    nb_switching_machines: usize,
    nb_waiters: usize,
    nb_killers: usize,

    sched_ready: bool,
    submission_sched_finished: bool,
    submission_submitters_finished: bool,
    ending: bool,

    batch: Vec<TimedEvent>,
}

impl ServerRuntime {
    pub(crate) fn new(
        ctx: Arc<SimContext>,
        rx: mpsc::UnboundedReceiver<Message>,
        decider: Box<dyn DeciderConnection>,
        expected_submitters: usize,
    ) -> Self {
        let submission_sched_finished = !ctx.cfg.dynamic_submissions;
        Self {
            ctx,
            rx,
            decider: Arc::new(tokio::sync::Mutex::new(decider)),
            relay_task: None,
            expected_submitters,
            submitters: HashMap::new(),
            job_origin: HashMap::new(),
            running: HashMap::new(),
            nb_submitters: 0,
            nb_submitters_finished: 0,
            nb_running_jobs: 0,
            nb_switching_machines: 0,
            nb_waiters: 0,
            nb_killers: 0,
            sched_ready: true,
            submission_sched_finished,
            submission_submitters_finished: expected_submitters == 0,
            ending: false,
            batch: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), SimulationError> {
        loop {
            // Handle everything deliverable at the current simulated instant
            // before deciding whether to flush.
            self.settle().await?;

            if self.sched_ready {
                if self.ending {
                    if !self.can_terminate() || !self.batch.is_empty() {
                        return Err(SimulationError::Protocol(
                            "decider issued commands after the final batch".to_string(),
                        ));
                    }
                    break;
                }
                if !self.batch.is_empty() {
                    self.flush();
                } else if self.can_terminate() {
                    self.push_event(OutboundEvent::SimulationEnds);
                    self.flush();
                    self.ending = true;
                }
            }

            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.dispatch(msg)?,
                    None => return Err(SimulationError::ServerMailboxClosed),
                },
                res = join_relay(&mut self.relay_task) => {
                    self.relay_task = None;
                    res?;
                }
            }
        }

        if let Some(task) = self.relay_task.take() {
            match task.await {
                Ok(res) => res?,
                Err(err) => {
                    return Err(SimulationError::Decider(format!("relay task failed: {err}")));
                }
            }
        }
        tracing::info!(makespan = self.ctx.clock.now(), "simulation reached termination");
        Ok(())
    }

    /// Drains the mailbox until no message remains at the current instant.
    /// Yielding twice lets same-instant tasks (and tasks they wake in turn)
    /// run and post their follow-ups before the check.
    async fn settle(&mut self) -> Result<(), SimulationError> {
        loop {
            while let Ok(msg) = self.rx.try_recv() {
                self.dispatch(msg)?;
            }
            tokio::task::yield_now().await;
            if self.rx.is_empty() {
                tokio::task::yield_now().await;
            }
            if self.rx.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn can_terminate(&self) -> bool {
        self.submission_submitters_finished
            && self.submission_sched_finished
            && self.nb_running_jobs == 0
            && self.nb_switching_machines == 0
            && self.nb_waiters == 0
            && self.nb_killers == 0
    }

    fn push_event(&mut self, event: OutboundEvent) {
        self.batch.push(TimedEvent {
            timestamp: self.ctx.clock.now(),
            event,
        });
    }

    fn flush(&mut self) {
        debug_assert!(self.sched_ready);
        let events = std::mem::take(&mut self.batch);
        self.sched_ready = false;
        tracing::debug!(events = events.len(), "flushing batch");
        self.relay_task = Some(tokio::spawn(relay::relay_round(
            self.ctx.clone(),
            self.decider.clone(),
            events,
        )));
    }

    fn dispatch(&mut self, message: Message) -> Result<(), SimulationError> {
        tracing::debug!(now = self.ctx.clock.now(), kind = message.kind(), "dispatching");
        match message {
            Message::SubmitterHello {
                submitter,
                callback_on_completion,
            } => {
                self.nb_submitters += 1;
                self.submitters.insert(
                    submitter,
                    SubmitterInfo {
                        callback_on_completion,
                        finished: false,
                    },
                );
            }
            Message::SubmitterBye {
                submitter,
                is_workflow,
            } => {
                self.nb_submitters_finished += 1;
                if let Some(info) = self.submitters.get_mut(&submitter) {
                    debug_assert!(!info.finished, "submitter said goodbye twice");
                    info.finished = true;
                }
                tracing::debug!(
                    %submitter,
                    is_workflow,
                    finished = self.nb_submitters_finished,
                    of = self.nb_submitters,
                    "submitter finished"
                );
                if self.nb_submitters_finished >= self.expected_submitters {
                    self.submission_submitters_finished = true;
                }
            }
            Message::JobSubmitted { submitter, job_id } => {
                self.handle_job_submitted(Some(submitter), job_id)?;
            }
            Message::JobSubmittedByDecider { mut job, profile } => {
                job.submission_time = self.ctx.clock.now();
                let job_id = job.id.clone();
                {
                    let mut workloads =
                        self.ctx.workloads.lock().expect("workload table poisoned");
                    let workload = workloads.get_or_insert(&job_id.workload);
                    if let Some((name, profile)) = profile {
                        workload.add_profile(name, profile);
                    }
                    if !workload.add_job(job) {
                        return Err(SimulationError::Protocol(format!(
                            "job '{job_id}' dynamically submitted twice"
                        )));
                    }
                }
                self.handle_job_submitted(None, job_id)?;
            }
            Message::ProfileSubmittedByDecider {
                workload,
                name,
                profile,
            } => {
                self.ctx
                    .workloads
                    .lock()
                    .expect("workload table poisoned")
                    .get_or_insert(&workload)
                    .add_profile(name, profile);
            }
            Message::ExecuteJob { allocation } => {
                {
                    let machines = self.ctx.machines.lock().expect("machine table poisoned");
                    for &m in &allocation.machines {
                        let machine = machines
                            .get(m)
                            .ok_or(SimulationError::UnknownMachine(m))?;
                        if !machine.allows_execution() {
                            return Err(SimulationError::MachineRefusesExecution {
                                job: allocation.job_id.clone(),
                                machine: m,
                            });
                        }
                    }
                }
                let shared = self.ctx.shared_job(&allocation.job_id)?;
                let profile = {
                    let mut job = shared.lock().expect("job poisoned");
                    if job.state != JobState::Submitted {
                        return Err(SimulationError::InvalidExecution {
                            job: allocation.job_id.clone(),
                            state: job.state,
                        });
                    }
                    job.state = JobState::Running;
                    if let Some(mapping) = &allocation.mapping {
                        job.rank_hosts = mapping.clone();
                    }
                    job.profile.clone()
                };
                let job_id = allocation.job_id.clone();
                let handle = execution::spawn(self.ctx.clone(), allocation, profile, true);
                self.running.insert(job_id, handle);
                self.nb_running_jobs += 1;
            }
            Message::ChangeJobState {
                job_id,
                state,
                kill_reason,
            } => {
                let shared = self.ctx.shared_job(&job_id)?;
                let mut job = shared.lock().expect("job poisoned");
                if !state.is_terminal() || job.state.is_terminal() {
                    return Err(SimulationError::InvalidStateChange {
                        job: job_id.clone(),
                        from: job.state,
                        to: state,
                    });
                }
                tracing::info!(job = %job_id, from = ?job.state, to = ?state, "state overridden");
                job.state = state;
                job.kill_reason = kill_reason;
            }
            Message::RejectJob { job_id } => {
                let shared = self.ctx.shared_job(&job_id)?;
                let mut job = shared.lock().expect("job poisoned");
                if job.state != JobState::Submitted {
                    return Err(SimulationError::InvalidRejection {
                        job: job_id.clone(),
                        state: job.state,
                    });
                }
                job.state = JobState::Rejected;
                tracing::info!(job = %job_id, "job rejected");
            }
            Message::KillJobs { job_ids } => {
                let mut targets = Vec::with_capacity(job_ids.len());
                for job_id in job_ids {
                    let shared = self.ctx.shared_job(&job_id)?;
                    let state = shared.lock().expect("job poisoned").state;
                    let running = if state == JobState::Running {
                        self.running.get(&job_id).cloned()
                    } else {
                        None
                    };
                    targets.push(KillTarget { job_id, running });
                }
                worker::spawn_killer(self.ctx.clone(), targets);
                self.nb_killers += 1;
            }
            Message::CallMeLater { target_time } => {
                worker::spawn_waiter(self.ctx.clone(), target_time);
                self.nb_waiters += 1;
            }
            Message::QueryConsumedEnergy => {
                let consumed_energy = {
                    let machines = self.ctx.machines.lock().expect("machine table poisoned");
                    machines
                        .ids()
                        .map(|m| self.ctx.platform.consumed_energy(m))
                        .sum()
                };
                self.push_event(OutboundEvent::ConsumedEnergy { consumed_energy });
            }
            Message::SetMachinePstates { machines, pstate } => {
                {
                    let mut table = self.ctx.machines.lock().expect("machine table poisoned");
                    for &m in &machines {
                        let machine =
                            table.get(m).ok_or(SimulationError::UnknownMachine(m))?;
                        if !matches!(
                            machine.state,
                            MachineState::Idle | MachineState::Sleeping
                        ) {
                            return Err(SimulationError::PstateSwitchInProgress(m));
                        }
                        let switch_on = self.ctx.platform.is_compute_pstate(m, pstate);
                        table.begin_pstate_switch(m, switch_on, self.ctx.energy_probe());
                        worker::spawn_switcher(self.ctx.clone(), m, pstate, switch_on);
                        self.nb_switching_machines += 1;
                    }
                }
                self.push_event(OutboundEvent::ResourceStateChanging {
                    resources: machines,
                    pstate,
                });
            }
            Message::SwitchedOn { machine, pstate } | Message::SwitchedOff { machine, pstate } => {
                self.nb_switching_machines = self.nb_switching_machines.saturating_sub(1);
                self.push_event(OutboundEvent::ResourceStateChanged {
                    resources: vec![machine],
                    pstate,
                });
            }
            Message::JobCompleted { job_id } => {
                self.nb_running_jobs = self.nb_running_jobs.saturating_sub(1);
                self.running.remove(&job_id);
                let shared = self.ctx.shared_job(&job_id)?;
                let (job_state, kill_reason) = {
                    let job = shared.lock().expect("job poisoned");
                    (job.state, job.kill_reason.clone())
                };
                self.push_event(OutboundEvent::JobCompleted {
                    job_id: job_id.clone(),
                    job_state,
                    kill_reason,
                });
                if let Some(origin) = self.job_origin.remove(&job_id) {
                    if let Err(err) = self
                        .ctx
                        .bus
                        .send(&origin, Message::SubmitterCallback { job_id })
                    {
                        tracing::debug!(%err, "completion callback dropped");
                    }
                }
            }
            Message::WaitingDone => {
                self.nb_waiters = self.nb_waiters.saturating_sub(1);
                self.push_event(OutboundEvent::RequestedCall);
            }
            Message::KillingDone { job_ids, progress } => {
                self.nb_killers = self.nb_killers.saturating_sub(1);
                self.push_event(OutboundEvent::JobKilled { job_ids, progress });
            }
            Message::EndDynamicSubmissions => {
                self.submission_sched_finished = true;
            }
            Message::ContinueDynamicSubmissions => {
                self.submission_sched_finished = false;
            }
            Message::ToJob { job_id, payload } => {
                let mailbox = job_id.to_string();
                if let Err(err) = self.ctx.bus.send(
                    &mailbox,
                    Message::ToJob {
                        job_id,
                        payload,
                    },
                ) {
                    tracing::warn!(%err, "TO_JOB_MSG dropped: job has no mailbox");
                }
            }
            Message::FromJob { job_id, payload } => {
                self.push_event(OutboundEvent::FromJob {
                    job_id,
                    msg: payload,
                });
            }
            Message::SchedReady => {
                self.sched_ready = true;
            }
            Message::SubmitterCallback { .. } => {
                return Err(SimulationError::Protocol(
                    "SUBMITTER_CALLBACK addressed to the server".to_string(),
                ));
            }
            Message::WorkerFailed { error } => return Err(error),
        }

        debug_assert_eq!(self.nb_running_jobs, self.running.len());
        Ok(())
    }

    fn handle_job_submitted(
        &mut self,
        submitter: Option<String>,
        job_id: JobId,
    ) -> Result<(), SimulationError> {
        let shared = self.ctx.shared_job(&job_id)?;
        let summary = {
            let mut job = shared.lock().expect("job poisoned");
            if job.state != JobState::NotSubmitted {
                return Err(SimulationError::Protocol(format!(
                    "job '{job_id}' submitted from state {:?}",
                    job.state
                )));
            }
            job.state = JobState::Submitted;
            JobSummary {
                profile: job.profile.clone(),
                res: job.required_resources,
                walltime: job.walltime,
                subtime: job.submission_time,
            }
        };
        if let Some(name) = submitter {
            if self
                .submitters
                .get(&name)
                .is_some_and(|info| info.callback_on_completion)
            {
                self.job_origin.insert(job_id.clone(), name);
            }
        }
        self.push_event(OutboundEvent::JobSubmitted {
            job_id,
            job: summary,
        });
        Ok(())
    }
}

/// Joins the in-flight relay round, or parks forever when none is running
/// (so the surrounding `select!` only wakes on mailbox traffic).
async fn join_relay(
    task: &mut Option<JoinHandle<Result<(), SimulationError>>>,
) -> Result<(), SimulationError> {
    match task {
        Some(handle) => match handle.await {
            Ok(res) => res,
            Err(err) => Err(SimulationError::Decider(format!("relay task failed: {err}"))),
        },
        None => std::future::pending().await,
    }
}
