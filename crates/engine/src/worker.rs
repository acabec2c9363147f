use std::collections::HashMap;
use std::sync::Arc;

use batforge_core::{JobId, MachineId};

use crate::api::JobProgress;
use crate::bus::Message;
use crate::context::SimContext;
use crate::execution::RunningJob;

/// Sleeps shorter than this do not reliably advance the simulated clock.
const MIN_WAIT: f64 = 1e-5;

/// Sleeps until `target_time`, then reports `WAITING_DONE`. Exactly one
/// report per spawned waiter; waiters cannot be cancelled.
pub(crate) fn spawn_waiter(ctx: Arc<SimContext>, target_time: f64) {
    tokio::spawn(async move {
        let now = ctx.clock.now();
        if now < target_time {
            let wait = (target_time - now).max(MIN_WAIT);
            tracing::debug!(wait, target_time, "waiter sleeping");
            ctx.clock.sleep(wait).await;
        } else {
            tracing::debug!(target_time, "target time already reached, skipping sleep");
        }
        ctx.bus.send_to_server(Message::WaitingDone);
    });
}

/// Drives one machine through a pstate transition: sleeps the platform
/// transition delay, commits the flip, then reports `SWITCHED_ON` or
/// `SWITCHED_OFF`.
pub(crate) fn spawn_switcher(
    ctx: Arc<SimContext>,
    machine: MachineId,
    pstate: u32,
    switch_on: bool,
) {
    tokio::spawn(async move {
        let delay = ctx.platform.pstate_switch_delay(machine, pstate);
        ctx.clock.sleep(delay).await;

        ctx.platform.set_pstate(machine, pstate);
        ctx.machines
            .lock()
            .expect("machine table poisoned")
            .finish_pstate_switch(machine, pstate, switch_on, ctx.energy_probe());
        tracing::debug!(machine, pstate, switch_on, "pstate transition finished");

        let message = if switch_on {
            Message::SwitchedOn { machine, pstate }
        } else {
            Message::SwitchedOff { machine, pstate }
        };
        ctx.bus.send_to_server(message);
    });
}

/// One entry of a kill request, resolved by the server: `running` is `None`
/// when the job was not running (already terminal, rejected, never started).
pub(crate) struct KillTarget {
    pub(crate) job_id: JobId,
    pub(crate) running: Option<RunningJob>,
}

/// Signals every running target's executor to abort and reports one
/// `KILLING_DONE` carrying the ids and per-killed-job progress snapshots.
/// Targets that were not running are reported without a progress entry.
pub(crate) fn spawn_killer(ctx: Arc<SimContext>, targets: Vec<KillTarget>) {
    tokio::spawn(async move {
        let now = ctx.clock.now();
        let mut job_ids = Vec::with_capacity(targets.len());
        let mut progress = HashMap::new();
        for target in targets {
            if let Some(running) = &target.running {
                running.kill.notify_one();
                progress.insert(
                    target.job_id.clone(),
                    JobProgress {
                        profile: running.profile.clone(),
                        elapsed: now - running.started_at,
                    },
                );
            } else {
                tracing::debug!(job = %target.job_id, "kill requested for a job that is not running");
            }
            job_ids.push(target.job_id);
        }
        ctx.bus.send_to_server(Message::KillingDone { job_ids, progress });
    });
}
