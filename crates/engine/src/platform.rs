//! The platform collaborator: the simulated hosts a run executes on.
//!
//! The engine only depends on the [`Platform`] trait: the parallel-task
//! execution primitive, host energy counters and pstate metadata.
//! [`UniformPlatform`] is a reference implementation with homogeneous hosts,
//! used by the test suite and by embedders who do not bring their own host
//! model.

use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;

use batforge_core::MachineId;

use crate::api::{JobMessenger, SimClock};

/// Outcome of a parallel-task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task ran to completion within its walltime budget.
    Completed,
    /// The walltime budget elapsed first; the task was stopped.
    Timeout,
}

/// The simulated execution substrate.
///
/// Compute and communication buffers are moved into
/// [`execute_parallel_task`](Platform::execute_parallel_task); the platform
/// owns them from that point on. Fatal platform failures are reported as
/// errors and abort the simulation.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Receives the simulated clock before the run starts. Platforms that
    /// integrate energy over time need it; others may ignore the call.
    fn attach_clock(&self, _clock: SimClock) {}

    /// Receives the job-to-decider messenger before the run starts. Platforms
    /// whose job models talk back to the scheduler keep it; others may ignore
    /// the call.
    fn attach_job_messenger(&self, _messenger: JobMessenger) {}

    /// Executes `compute` (one flop amount per host) and the optional
    /// row-major `comm` matrix across `hosts`, bounded by `timeout`
    /// simulated seconds.
    async fn execute_parallel_task(
        &self,
        hosts: Vec<MachineId>,
        compute: Vec<f64>,
        comm: Option<Vec<f64>>,
        timeout: f64,
    ) -> anyhow::Result<TaskOutcome>;

    /// Replays one rank of an MPI trace on `host`. `instance` uniquely names
    /// the replayed application and `rank` the executor within it.
    async fn replay_mpi_rank(
        &self,
        host: MachineId,
        instance: String,
        rank: usize,
        trace_file: String,
    ) -> anyhow::Result<()>;

    /// Total energy consumed by `host` so far, in joules.
    fn consumed_energy(&self, host: MachineId) -> f64;

    /// Commits a host power-state change (used by the pstate switcher).
    fn set_pstate(&self, host: MachineId, pstate: u32);

    /// Simulated seconds a transition of `host` into `pstate` takes.
    fn pstate_switch_delay(&self, host: MachineId, pstate: u32) -> f64;

    /// Whether `pstate` is a compute pstate of `host` (as opposed to a sleep
    /// pstate).
    fn is_compute_pstate(&self, host: MachineId, pstate: u32) -> bool;

    /// The parallel-filesystem host, when the platform has one.
    fn pfs_host(&self) -> Option<MachineId>;
}

/// Shape of a [`UniformPlatform`].
#[derive(Debug, Clone)]
pub struct UniformPlatformSpec {
    /// Number of hosts, including the PFS host if any.
    pub hosts: u32,
    /// Compute rate of every host, in flops per simulated second.
    pub flops_per_second: f64,
    /// Network drain rate, in bytes per simulated second.
    pub bytes_per_second: f64,
    /// Power drawn by a host in a compute pstate with no task, in watts.
    pub idle_watts: f64,
    /// Power drawn by a host while executing a task, in watts.
    pub computing_watts: f64,
    /// Power drawn by a host in a sleep pstate, in watts.
    pub sleeping_watts: f64,
    /// Pstates `0..compute_pstates` are compute pstates, the rest sleep.
    pub compute_pstates: u32,
    /// Simulated seconds every pstate transition takes.
    pub switch_seconds: f64,
    /// Host acting as the parallel filesystem, if any.
    pub pfs_host: Option<MachineId>,
    /// Simulated seconds one MPI rank replay takes.
    pub mpi_rank_seconds: f64,
}

impl Default for UniformPlatformSpec {
    fn default() -> Self {
        Self {
            hosts: 4,
            flops_per_second: 1e9,
            bytes_per_second: 1e9,
            idle_watts: 100.0,
            computing_watts: 200.0,
            sleeping_watts: 10.0,
            compute_pstates: 1,
            switch_seconds: 1.0,
            pfs_host: None,
            mpi_rank_seconds: 1e-3,
        }
    }
}

#[derive(Debug)]
struct HostMeter {
    pstate: u32,
    active_tasks: u32,
    joules: f64,
    last_update: f64,
}

/// Reference platform: homogeneous hosts with a flat network.
///
/// A parallel task takes `max(compute) / flops + sum(comm) / bytes`
/// simulated seconds; per-host energy is integrated lazily from the host's
/// power draw (active, idle or sleeping).
pub struct UniformPlatform {
    spec: UniformPlatformSpec,
    clock: OnceLock<SimClock>,
    meters: Mutex<Vec<HostMeter>>,
}

impl UniformPlatform {
    /// Builds a platform from its spec.
    pub fn new(spec: UniformPlatformSpec) -> Self {
        let meters = (0..spec.hosts)
            .map(|_| HostMeter {
                pstate: 0,
                active_tasks: 0,
                joules: 0.0,
                last_update: 0.0,
            })
            .collect();
        Self {
            spec,
            clock: OnceLock::new(),
            meters: Mutex::new(meters),
        }
    }

    fn now(&self) -> f64 {
        self.clock.get().map(SimClock::now).unwrap_or(0.0)
    }

    fn power_of(&self, meter: &HostMeter) -> f64 {
        if meter.active_tasks > 0 {
            self.spec.computing_watts
        } else if meter.pstate < self.spec.compute_pstates {
            self.spec.idle_watts
        } else {
            self.spec.sleeping_watts
        }
    }

    fn sync_meter(&self, meter: &mut HostMeter, now: f64) {
        meter.joules += self.power_of(meter) * (now - meter.last_update);
        meter.last_update = now;
    }

    fn adjust_active(&self, hosts: &[MachineId], delta: i64) {
        let now = self.now();
        let mut meters = self.meters.lock().expect("platform meters poisoned");
        for &host in hosts {
            if let Some(meter) = meters.get_mut(host as usize) {
                self.sync_meter(meter, now);
                meter.active_tasks = (i64::from(meter.active_tasks) + delta).max(0) as u32;
            }
        }
    }
}

/// Marks hosts busy for the lifetime of one task, surviving cancellation:
/// dropping the span (kill path included) settles the energy accounts.
struct ActiveSpan<'a> {
    platform: &'a UniformPlatform,
    hosts: Vec<MachineId>,
}

impl<'a> ActiveSpan<'a> {
    fn enter(platform: &'a UniformPlatform, hosts: Vec<MachineId>) -> Self {
        platform.adjust_active(&hosts, 1);
        Self { platform, hosts }
    }
}

impl Drop for ActiveSpan<'_> {
    fn drop(&mut self) {
        self.platform.adjust_active(&self.hosts, -1);
    }
}

#[async_trait]
impl Platform for UniformPlatform {
    fn attach_clock(&self, clock: SimClock) {
        let _ = self.clock.set(clock);
    }

    async fn execute_parallel_task(
        &self,
        hosts: Vec<MachineId>,
        compute: Vec<f64>,
        comm: Option<Vec<f64>>,
        timeout: f64,
    ) -> anyhow::Result<TaskOutcome> {
        let n = hosts.len();
        if n == 0 {
            anyhow::bail!("parallel task with no hosts");
        }
        if compute.len() != n {
            anyhow::bail!(
                "compute vector has {} entries for {n} hosts",
                compute.len()
            );
        }
        if let Some(comm) = &comm {
            if comm.len() != n * n {
                anyhow::bail!(
                    "communication matrix has {} entries for {n} hosts",
                    comm.len()
                );
            }
        }
        if let Some(&host) = hosts.iter().find(|&&h| h >= self.spec.hosts) {
            anyhow::bail!("host {host} does not exist on this platform");
        }

        let compute_seconds =
            compute.iter().copied().fold(0.0_f64, f64::max) / self.spec.flops_per_second;
        let comm_seconds = comm
            .as_ref()
            .map(|m| m.iter().sum::<f64>() / self.spec.bytes_per_second)
            .unwrap_or(0.0);
        let duration = compute_seconds + comm_seconds;

        let timeout = timeout.max(0.0);
        let clock = self.clock.get().copied();
        let span = ActiveSpan::enter(self, hosts);
        if let Some(clock) = clock {
            clock.sleep(duration.min(timeout)).await;
        }
        drop(span);

        if duration > timeout {
            Ok(TaskOutcome::Timeout)
        } else {
            Ok(TaskOutcome::Completed)
        }
    }

    async fn replay_mpi_rank(
        &self,
        host: MachineId,
        instance: String,
        rank: usize,
        trace_file: String,
    ) -> anyhow::Result<()> {
        tracing::debug!(%instance, rank, %trace_file, host, "replaying rank");
        let clock = self.clock.get().copied();
        let span = ActiveSpan::enter(self, vec![host]);
        if let Some(clock) = clock {
            clock.sleep(self.spec.mpi_rank_seconds).await;
        }
        drop(span);
        Ok(())
    }

    fn consumed_energy(&self, host: MachineId) -> f64 {
        let now = self.now();
        let mut meters = self.meters.lock().expect("platform meters poisoned");
        match meters.get_mut(host as usize) {
            Some(meter) => {
                self.sync_meter(meter, now);
                meter.joules
            }
            None => 0.0,
        }
    }

    fn set_pstate(&self, host: MachineId, pstate: u32) {
        let now = self.now();
        let mut meters = self.meters.lock().expect("platform meters poisoned");
        if let Some(meter) = meters.get_mut(host as usize) {
            self.sync_meter(meter, now);
            meter.pstate = pstate;
        }
    }

    fn pstate_switch_delay(&self, _host: MachineId, _pstate: u32) -> f64 {
        self.spec.switch_seconds
    }

    fn is_compute_pstate(&self, _host: MachineId, pstate: u32) -> bool {
        pstate < self.spec.compute_pstates
    }

    fn pfs_host(&self) -> Option<MachineId> {
        self.spec.pfs_host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(spec: UniformPlatformSpec) -> UniformPlatform {
        let platform = UniformPlatform::new(spec);
        platform.attach_clock(SimClock::start());
        platform
    }

    #[tokio::test(start_paused = true)]
    async fn task_duration_is_compute_plus_comm() {
        let platform = platform(UniformPlatformSpec {
            hosts: 2,
            flops_per_second: 10.0,
            bytes_per_second: 100.0,
            ..UniformPlatformSpec::default()
        });

        let clock = *platform.clock.get().unwrap();
        let before = clock.now();
        // 40 flops on the slowest host -> 4s, 200 bytes -> 2s.
        let outcome = platform
            .execute_parallel_task(
                vec![0, 1],
                vec![30.0, 40.0],
                Some(vec![0.0, 100.0, 100.0, 0.0]),
                100.0,
            )
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert!((clock.now() - before - 6.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn task_longer_than_budget_times_out_at_the_budget() {
        let platform = platform(UniformPlatformSpec {
            hosts: 1,
            flops_per_second: 1.0,
            ..UniformPlatformSpec::default()
        });

        let clock = *platform.clock.get().unwrap();
        let outcome = platform
            .execute_parallel_task(vec![0], vec![10.0], None, 4.0)
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Timeout);
        assert!((clock.now() - 4.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn energy_integrates_idle_and_active_power() {
        let platform = platform(UniformPlatformSpec {
            hosts: 1,
            flops_per_second: 1.0,
            idle_watts: 100.0,
            computing_watts: 250.0,
            ..UniformPlatformSpec::default()
        });

        let clock = *platform.clock.get().unwrap();
        clock.sleep(10.0).await;
        platform
            .execute_parallel_task(vec![0], vec![5.0], None, 100.0)
            .await
            .unwrap();

        // 10s idle at 100W, then 5s active at 250W.
        assert!((platform.consumed_energy(0) - (1000.0 + 1250.0)).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_buffers_are_fatal() {
        let platform = platform(UniformPlatformSpec::default());
        assert!(
            platform
                .execute_parallel_task(vec![0, 1], vec![1.0], None, 10.0)
                .await
                .is_err()
        );
        assert!(
            platform
                .execute_parallel_task(vec![0, 1], vec![1.0, 1.0], Some(vec![0.0]), 10.0)
                .await
                .is_err()
        );
    }
}
