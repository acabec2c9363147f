use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinSet;

use batforge_core::{Allocation, JobState, MachineId, Profile};

use crate::bus::Message;
use crate::context::SimContext;
use crate::error::SimulationError;
use crate::platform::TaskOutcome;

/// Runtimes below this are clock-precision artifacts of trace replay.
const MIN_REPLAY_RUNTIME: f64 = 1e-5;

/// Result of playing a profile under a walltime budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProfileOutcome {
    Finished,
    WalltimeReached,
}

/// Handle the server keeps for every live job-executor task.
#[derive(Clone)]
pub(crate) struct RunningJob {
    pub(crate) kill: Arc<Notify>,
    pub(crate) started_at: f64,
    pub(crate) profile: String,
}

/// Spawns the executor task owning `allocation`. With `notify_server` unset
/// (the lite variant, for dry runs) energy accounting and the completion
/// message are skipped.
pub(crate) fn spawn(
    ctx: Arc<SimContext>,
    allocation: Allocation,
    profile: String,
    notify_server: bool,
) -> RunningJob {
    let kill = Arc::new(Notify::new());
    let handle = RunningJob {
        kill: kill.clone(),
        started_at: ctx.clock.now(),
        profile,
    };
    tokio::spawn(async move {
        if let Err(error) = run_job(&ctx, &allocation, &kill, notify_server).await {
            ctx.bus.send_to_server(Message::WorkerFailed { error });
        }
    });
    handle
}

async fn run_job(
    ctx: &SimContext,
    alloc: &Allocation,
    kill: &Notify,
    notify_server: bool,
) -> Result<(), SimulationError> {
    let shared = ctx.shared_job(&alloc.job_id)?;
    let started_at = ctx.clock.now();
    let (profile_name, walltime) = {
        let mut job = shared.lock().expect("job poisoned");
        job.starting_time = started_at;
        job.allocation = alloc.machines.clone();
        (job.profile.clone(), job.walltime)
    };
    let is_replay = matches!(
        ctx.profile(&alloc.job_id.workload, &profile_name)?,
        Profile::MpiReplay { .. }
    );
    let mut remaining_time = walltime;

    let track_energy = ctx.cfg.energy_tracking && notify_server;
    let mut energy_base = 0.0;
    if track_energy {
        energy_base = allocation_energy(ctx, &alloc.machines);
        ctx.trace.job_start(started_at, &alloc.job_id);
    }

    ctx.machines
        .lock()
        .expect("machine table poisoned")
        .update_on_job_run(&alloc.job_id, &alloc.machines, ctx.energy_probe());

    // A kill cancels the in-flight profile future; the executor itself always
    // runs to completion and reports, so the server sees exactly one
    // terminal event per job.
    let outcome = tokio::select! {
        res = execute_profile(ctx, &profile_name, alloc, &mut remaining_time) => Some(res?),
        _ = kill.notified() => None,
    };

    let now = ctx.clock.now();
    let state = match outcome {
        Some(ProfileOutcome::Finished) => {
            tracing::info!(job = %alloc.job_id, "job finished in time");
            JobState::CompletedSuccessfully
        }
        Some(ProfileOutcome::WalltimeReached) => {
            tracing::info!(job = %alloc.job_id, walltime, "job killed: walltime reached");
            JobState::CompletedKilled
        }
        None => {
            tracing::info!(job = %alloc.job_id, "job killed on request");
            JobState::CompletedKilled
        }
    };
    if state == JobState::CompletedKilled && ctx.cfg.schedule_trace {
        ctx.trace.job_kill(now, std::slice::from_ref(&alloc.job_id));
    }

    ctx.machines
        .lock()
        .expect("machine table poisoned")
        .update_on_job_end(&alloc.job_id, &alloc.machines, ctx.energy_probe());

    let mut runtime = now - started_at;
    if is_replay {
        // Clock-precision workaround for degenerate replay cases.
        runtime = runtime.max(MIN_REPLAY_RUNTIME);
    }
    if runtime <= 0.0 {
        return Err(SimulationError::ZeroRuntime(alloc.job_id.clone()));
    }

    {
        let mut job = shared.lock().expect("job poisoned");
        job.state = state;
        job.runtime = runtime;
        if track_energy {
            job.consumed_energy = allocation_energy(ctx, &alloc.machines) - energy_base;
        }
    }
    if track_energy {
        ctx.trace.job_end(now, &alloc.job_id);
    }

    if notify_server {
        ctx.bus.send_to_server(Message::JobCompleted {
            job_id: alloc.job_id.clone(),
        });
    }
    Ok(())
}

fn allocation_energy(ctx: &SimContext, machines: &[MachineId]) -> f64 {
    machines
        .iter()
        .map(|&m| ctx.platform.consumed_energy(m))
        .sum()
}

/// Plays `profile_name` on the allocation, charging `remaining_time` with the
/// elapsed simulated time.
async fn execute_profile(
    ctx: &SimContext,
    profile_name: &str,
    alloc: &Allocation,
    remaining_time: &mut f64,
) -> Result<ProfileOutcome, SimulationError> {
    let profile = ctx.profile(&alloc.job_id.workload, profile_name)?;
    match profile {
        Profile::ParallelHomogeneous { cpu, com } => {
            let n = alloc.machines.len();
            let compute = vec![cpu; n];
            let comm = (com != 0.0).then(|| homogeneous_matrix(n, com));
            run_parallel_task(ctx, alloc.machines.clone(), compute, comm, remaining_time).await
        }
        Profile::Parallel { cpu, com } => {
            let n = alloc.machines.len();
            if cpu.len() != n || com.len() != n || com.iter().any(|row| row.len() != n) {
                return Err(SimulationError::ProfileShape {
                    job: alloc.job_id.clone(),
                    profile: profile_name.to_string(),
                });
            }
            let comm: Vec<f64> = com.into_iter().flatten().collect();
            run_parallel_task(ctx, alloc.machines.clone(), cpu, Some(comm), remaining_time).await
        }
        Profile::ParallelHomogeneousPfs { size } => {
            let pfs = ctx
                .platform
                .pfs_host()
                .ok_or(SimulationError::MissingPfsHost)?;
            let mut hosts = alloc.machines.clone();
            hosts.push(pfs);
            let n = hosts.len();
            let compute = vec![0.0; n];
            let comm = (size != 0.0).then(|| pfs_matrix(n, size));
            run_parallel_task(ctx, hosts, compute, comm, remaining_time).await
        }
        Profile::Delay { delay } => {
            if delay < *remaining_time {
                tracing::debug!(delay, "sleeping the whole profile length");
                ctx.clock.sleep(delay).await;
                *remaining_time -= delay;
                Ok(ProfileOutcome::Finished)
            } else {
                tracing::debug!(budget = *remaining_time, "sleeping until walltime");
                ctx.clock.sleep(*remaining_time).await;
                *remaining_time = 0.0;
                Ok(ProfileOutcome::WalltimeReached)
            }
        }
        Profile::MpiReplay { trace_files } => replay_traces(ctx, alloc, trace_files).await,
        Profile::Sequence { repeat, sequence } => {
            for _ in 0..repeat {
                for sub in &sequence {
                    let outcome =
                        Box::pin(execute_profile(ctx, sub, alloc, remaining_time)).await?;
                    if outcome == ProfileOutcome::WalltimeReached {
                        return Ok(ProfileOutcome::WalltimeReached);
                    }
                }
            }
            Ok(ProfileOutcome::Finished)
        }
    }
}

async fn run_parallel_task(
    ctx: &SimContext,
    hosts: Vec<MachineId>,
    compute: Vec<f64>,
    comm: Option<Vec<f64>>,
    remaining_time: &mut f64,
) -> Result<ProfileOutcome, SimulationError> {
    let before = ctx.clock.now();
    let outcome = ctx
        .platform
        .execute_parallel_task(hosts, compute, comm, *remaining_time)
        .await
        .map_err(|err| SimulationError::Platform(format!("{err:#}")))?;
    *remaining_time = (*remaining_time - (ctx.clock.now() - before)).max(0.0);

    Ok(match outcome {
        TaskOutcome::Completed => ProfileOutcome::Finished,
        TaskOutcome::Timeout => ProfileOutcome::WalltimeReached,
    })
}

/// `com` between every distinct pair, nothing on the diagonal.
fn homogeneous_matrix(n: usize, com: f64) -> Vec<f64> {
    let mut matrix = vec![com; n * n];
    for y in 0..n {
        matrix[y * n + y] = 0.0;
    }
    matrix
}

/// Every job host sends `size` to the PFS host (the last column); the PFS
/// row stays silent.
fn pfs_matrix(n: usize, size: f64) -> Vec<f64> {
    let mut matrix = vec![0.0; n * n];
    for y in 0..n - 1 {
        matrix[y * n + (n - 1)] = size;
    }
    matrix
}

async fn replay_traces(
    ctx: &SimContext,
    alloc: &Allocation,
    trace_files: Vec<String>,
) -> Result<ProfileOutcome, SimulationError> {
    let shared = ctx.shared_job(&alloc.job_id)?;
    let nb_ranks = trace_files.len();

    let mapping = {
        let mut job = shared.lock().expect("job poisoned");
        if job.rank_hosts.is_empty() {
            // Round-robin over the allocated machines when the decider did
            // not provide a mapping.
            job.rank_hosts = (0..nb_ranks).map(|i| i % job.required_resources).collect();
        }
        if job.rank_hosts.len() != nb_ranks {
            return Err(SimulationError::RankMappingMismatch {
                job: alloc.job_id.clone(),
                ranks: nb_ranks,
                mapping: job.rank_hosts.len(),
            });
        }
        job.rank_hosts.clone()
    };

    let instance = format!("{}!{}", alloc.job_id.workload, alloc.job_id.number);
    let mut ranks = JoinSet::new();
    for (rank, trace_file) in trace_files.into_iter().enumerate() {
        let host_index = mapping[rank];
        let host = *alloc.machines.get(host_index).ok_or_else(|| {
            SimulationError::RankMappingOutOfRange {
                job: alloc.job_id.clone(),
                rank,
                host_index,
            }
        })?;
        let platform = ctx.platform.clone();
        let instance = instance.clone();
        let task_name = format!("{}_{}", alloc.job_id.number, rank);
        ranks.spawn(async move {
            tracing::debug!(task = %task_name, "launching replay rank");
            platform.replay_mpi_rank(host, instance, rank, trace_file).await
        });
    }

    // The parent joins every rank; replay carries no walltime budget.
    while let Some(res) = ranks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(SimulationError::Platform(format!("{err:#}"))),
            Err(err) => return Err(SimulationError::Platform(format!("rank task failed: {err}"))),
        }
    }
    Ok(ProfileOutcome::Finished)
}
