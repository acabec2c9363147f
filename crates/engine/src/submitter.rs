use std::collections::HashSet;
use std::sync::Arc;

use batforge_core::{JobId, Workflow};

use crate::bus::Message;
use crate::context::SimContext;

/// Spawns the static submitter for one workload: greet the server, submit
/// every job at its submission time, say goodbye.
pub(crate) fn spawn_static(ctx: Arc<SimContext>, workload: String) {
    tokio::spawn(run_static(ctx, workload));
}

async fn run_static(ctx: Arc<SimContext>, workload: String) {
    let name = format!("{workload}_submitter");
    let mut entries: Vec<(f64, JobId)> = {
        let workloads = ctx.workloads.lock().expect("workload table poisoned");
        match workloads.get(&workload) {
            Some(wl) => wl
                .jobs()
                .map(|shared| {
                    let job = shared.lock().expect("job poisoned");
                    (job.submission_time, job.id.clone())
                })
                .collect(),
            None => Vec::new(),
        }
    };
    entries.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });

    ctx.bus.send_to_server(Message::SubmitterHello {
        submitter: name.clone(),
        callback_on_completion: false,
    });
    for (submission_time, job_id) in entries {
        let now = ctx.clock.now();
        if now < submission_time {
            ctx.clock.sleep(submission_time - now).await;
        }
        tracing::info!(job = %job_id, "submitting job");
        ctx.bus.send_to_server(Message::JobSubmitted {
            submitter: name.clone(),
            job_id,
        });
    }
    ctx.bus.send_to_server(Message::SubmitterBye {
        submitter: name,
        is_workflow: false,
    });
}

/// Spawns the workflow submitter: like the static one, but a task is only
/// submitted once all of its dependencies have completed, learned through
/// completion callbacks.
pub(crate) fn spawn_workflow(ctx: Arc<SimContext>, workflow: Workflow) {
    tokio::spawn(run_workflow(ctx, workflow));
}

async fn run_workflow(ctx: Arc<SimContext>, workflow: Workflow) {
    let name = format!("{}_workflow_submitter", workflow.name);
    let mut rx = match ctx.bus.register(&name) {
        Ok(rx) => rx,
        Err(err) => {
            tracing::warn!(%err, "workflow submitter cannot register its mailbox");
            return;
        }
    };

    ctx.bus.send_to_server(Message::SubmitterHello {
        submitter: name.clone(),
        callback_on_completion: true,
    });

    let mut pending = workflow.tasks;
    let mut completed: HashSet<JobId> = HashSet::new();
    while !pending.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|task| task.deps.iter().all(|dep| completed.contains(dep)));
        pending = blocked;

        if ready.is_empty() {
            // Nothing can move until another job completes.
            match rx.recv().await {
                Some(Message::SubmitterCallback { job_id }) => {
                    tracing::debug!(job = %job_id, "dependency completed");
                    completed.insert(job_id);
                }
                Some(other) => {
                    tracing::warn!(kind = other.kind(), "unexpected message for workflow submitter");
                }
                None => break,
            }
            continue;
        }

        let mut ready: Vec<(f64, JobId)> = ready
            .into_iter()
            .filter_map(|task| {
                let shared = ctx
                    .workloads
                    .lock()
                    .expect("workload table poisoned")
                    .job(&task.job);
                match shared {
                    Some(shared) => {
                        let submission_time =
                            shared.lock().expect("job poisoned").submission_time;
                        Some((submission_time, task.job))
                    }
                    None => {
                        tracing::warn!(job = %task.job, "workflow references an unknown job");
                        None
                    }
                }
            })
            .collect();
        ready.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        for (submission_time, job_id) in ready {
            let now = ctx.clock.now();
            if now < submission_time {
                ctx.clock.sleep(submission_time - now).await;
            }
            tracing::info!(job = %job_id, "submitting workflow job");
            ctx.bus.send_to_server(Message::JobSubmitted {
                submitter: name.clone(),
                job_id,
            });
        }
    }

    ctx.bus.send_to_server(Message::SubmitterBye {
        submitter: name.clone(),
        is_workflow: true,
    });
    ctx.bus.unregister(&name);
}
