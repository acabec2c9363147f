#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use batforge_core::{Job, JobId, Machines, Profile, Workload, WorkloadSet};
use batforge_engine::{
    DeciderConnection, Simulation, SimulationConfig, UniformPlatform, UniformPlatformSpec,
};

/// Everything the decider saw, one entry per relay round.
pub type RequestLog = Arc<Mutex<Vec<Value>>>;

/// In-process decider scripted by a closure: for each request envelope it
/// returns the reply events. Every request is recorded for assertions.
pub struct ScriptedDecider<F> {
    script: F,
    log: RequestLog,
}

#[async_trait]
impl<F> DeciderConnection for ScriptedDecider<F>
where
    F: FnMut(&Value) -> Vec<Value> + Send,
{
    async fn round_trip(&mut self, request: &str) -> anyhow::Result<String> {
        let request: Value = serde_json::from_str(request)?;
        self.log.lock().unwrap().push(request.clone());
        let events = (self.script)(&request);
        Ok(json!({"now": request["now"], "events": events}).to_string())
    }
}

/// Builds a scripted decider plus the handle to its request log.
pub fn scripted<F>(script: F) -> (Box<dyn DeciderConnection>, RequestLog)
where
    F: FnMut(&Value) -> Vec<Value> + Send + 'static,
{
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    (
        Box::new(ScriptedDecider {
            script,
            log: log.clone(),
        }),
        log,
    )
}

/// All `(type, data)` pairs the decider received, across every round.
pub fn received_events(log: &RequestLog) -> Vec<(String, Value)> {
    log.lock()
        .unwrap()
        .iter()
        .flat_map(|request| request["events"].as_array().cloned().unwrap_or_default())
        .map(|event| {
            (
                event["type"].as_str().unwrap_or_default().to_string(),
                event.clone(),
            )
        })
        .collect()
}

/// Events of one request, as `(type, event)` pairs.
pub fn events_of(request: &Value) -> Vec<(String, Value)> {
    request["events"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|event| {
            (
                event["type"].as_str().unwrap_or_default().to_string(),
                event,
            )
        })
        .collect()
}

/// Reply event executing `job_id` on `alloc`.
pub fn execute(job_id: &str, alloc: &[u32]) -> Value {
    json!({"type": "EXECUTE_JOB", "data": {"job_id": job_id, "alloc": alloc}})
}

/// Reply event asking to be called back at `timestamp`.
pub fn call_me_later(timestamp: f64) -> Value {
    json!({"type": "CALL_ME_LATER", "data": {"timestamp": timestamp}})
}

/// Reply event killing the listed jobs.
pub fn kill(job_ids: &[&str]) -> Value {
    json!({"type": "KILL_JOB", "data": {"job_ids": job_ids}})
}

/// Reply event rejecting a job.
pub fn reject(job_id: &str) -> Value {
    json!({"type": "REJECT_JOB", "data": {"job_id": job_id}})
}

/// One workload named `w` holding `jobs` (number, submission time, walltime,
/// resources, profile name) and `profiles`.
pub fn workload(
    jobs: &[(u32, f64, f64, usize, &str)],
    profiles: &[(&str, Profile)],
) -> WorkloadSet {
    let mut wl = Workload::new("w");
    for (name, profile) in profiles {
        wl.add_profile(*name, profile.clone());
    }
    for &(number, subtime, walltime, res, profile) in jobs {
        wl.add_job(Job::new(JobId::new("w", number), subtime, walltime, res, profile));
    }
    let mut set = WorkloadSet::new();
    set.insert(wl);
    set
}

/// A simulation over `machine_count` uniform machines with unit flop/byte
/// rates, so profile amounts read directly as seconds.
pub fn simulation(
    workloads: WorkloadSet,
    machine_count: u32,
    decider: Box<dyn DeciderConnection>,
) -> Simulation {
    simulation_with(
        workloads,
        machine_count,
        decider,
        SimulationConfig::default(),
        |spec| spec,
    )
}

/// Same as [`simulation`], with config and platform-spec hooks. `tweak` may
/// grow `spec.hosts` past the machine count (e.g. to add a PFS host).
pub fn simulation_with(
    workloads: WorkloadSet,
    machine_count: u32,
    decider: Box<dyn DeciderConnection>,
    config: SimulationConfig,
    tweak: impl FnOnce(UniformPlatformSpec) -> UniformPlatformSpec,
) -> Simulation {
    let spec = tweak(UniformPlatformSpec {
        hosts: machine_count,
        flops_per_second: 1.0,
        bytes_per_second: 1.0,
        ..UniformPlatformSpec::default()
    });
    Simulation {
        config,
        workloads,
        workflows: Vec::new(),
        machines: Machines::new(machine_count),
        platform: Arc::new(UniformPlatform::new(spec)),
        decider,
        trace: None,
    }
}
