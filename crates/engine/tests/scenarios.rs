//! End-to-end runs against a scripted decider: one server, real workers,
//! simulated time.

mod common;

use batforge_core::{JobState, Profile};
use batforge_engine::{SimulationConfig, UniformPlatformSpec};
use serde_json::json;

use common::*;

fn approx(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() < 1e-9
}

#[tokio::test(start_paused = true)]
async fn delay_job_completes_at_its_length() {
    let workloads = workload(
        &[(1, 0.0, 20.0, 1, "delay10")],
        &[("delay10", Profile::Delay { delay: 10.0 })],
    );
    let (decider, log) = scripted(|request| {
        events_of(request)
            .iter()
            .filter(|(kind, _)| kind == "JOB_SUBMITTED")
            .map(|(_, event)| execute(event["data"]["job_id"].as_str().unwrap(), &[0]))
            .collect()
    });

    let report = simulation(workloads, 1, decider).run().await.unwrap();

    assert!(approx(report.makespan, 10.0));
    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::CompletedSuccessfully);
    assert!(approx(job.runtime, 10.0));
    assert!(approx(job.starting_time, 0.0));

    let events = received_events(&log);
    assert!(events.iter().any(|(kind, event)| {
        kind == "JOB_COMPLETED" && approx(event["timestamp"].as_f64().unwrap(), 10.0)
    }));
    assert_eq!(events.last().unwrap().0, "SIMULATION_ENDS");
}

#[tokio::test(start_paused = true)]
async fn delay_job_is_killed_at_walltime() {
    let workloads = workload(
        &[(1, 0.0, 5.0, 1, "delay10")],
        &[("delay10", Profile::Delay { delay: 10.0 })],
    );
    let (decider, log) = scripted(|request| {
        events_of(request)
            .iter()
            .filter(|(kind, _)| kind == "JOB_SUBMITTED")
            .map(|(_, event)| execute(event["data"]["job_id"].as_str().unwrap(), &[0]))
            .collect()
    });

    let report = simulation(workloads, 1, decider).run().await.unwrap();

    assert!(approx(report.makespan, 5.0));
    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::CompletedKilled);
    assert!(approx(job.runtime, 5.0));

    let events = received_events(&log);
    let completed = events
        .iter()
        .find(|(kind, _)| kind == "JOB_COMPLETED")
        .unwrap();
    assert_eq!(completed.1["data"]["job_state"], "COMPLETED_KILLED");
}

#[tokio::test(start_paused = true)]
async fn two_parallel_jobs_run_side_by_side() {
    let workloads = workload(
        &[(1, 0.0, 1000.0, 2, "par"), (2, 0.0, 1000.0, 2, "par")],
        &[(
            "par",
            Profile::ParallelHomogeneous {
                cpu: 100.0,
                com: 0.0,
            },
        )],
    );
    let (decider, _log) = scripted(|request| {
        events_of(request)
            .iter()
            .filter(|(kind, _)| kind == "JOB_SUBMITTED")
            .map(|(_, event)| {
                let job_id = event["data"]["job_id"].as_str().unwrap();
                if job_id.ends_with("!1") {
                    execute(job_id, &[0, 1])
                } else {
                    execute(job_id, &[2, 3])
                }
            })
            .collect()
    });

    let report = simulation(workloads, 4, decider).run().await.unwrap();

    assert!(approx(report.makespan, 100.0));
    assert_eq!(report.jobs.len(), 2);
    for job in &report.jobs {
        assert_eq!(job.state, JobState::CompletedSuccessfully);
    }
    assert!(approx(report.jobs[0].runtime, report.jobs[1].runtime));
}

#[tokio::test(start_paused = true)]
async fn call_me_later_wakes_the_decider_at_the_target_time() {
    let workloads = workload(
        &[(1, 0.0, 5.0, 1, "p")],
        &[("p", Profile::Delay { delay: 1.0 })],
    );
    let (decider, log) = scripted(|request| {
        events_of(request)
            .iter()
            .filter_map(|(kind, event)| match kind.as_str() {
                // Nothing to run: park the only job and ask for a wake-up.
                "JOB_SUBMITTED" => Some(vec![
                    reject(event["data"]["job_id"].as_str().unwrap()),
                    call_me_later(50.0),
                ]),
                _ => None,
            })
            .flatten()
            .collect()
    });

    let report = simulation(workloads, 1, decider).run().await.unwrap();

    assert!(approx(report.makespan, 50.0));
    assert_eq!(report.jobs[0].state, JobState::Rejected);

    let events = received_events(&log);
    let requested = events
        .iter()
        .find(|(kind, _)| kind == "REQUESTED_CALL")
        .expect("REQUESTED_CALL must reach the decider");
    assert!(approx(requested.1["timestamp"].as_f64().unwrap(), 50.0));
    assert_eq!(events.last().unwrap().0, "SIMULATION_ENDS");
}

#[tokio::test(start_paused = true)]
async fn killing_a_running_job_snapshots_its_progress() {
    let workloads = workload(
        &[(1, 0.0, 20.0, 1, "delay10")],
        &[("delay10", Profile::Delay { delay: 10.0 })],
    );
    let (decider, log) = scripted(|request| {
        events_of(request)
            .iter()
            .filter_map(|(kind, event)| match kind.as_str() {
                "JOB_SUBMITTED" => Some(vec![
                    execute(event["data"]["job_id"].as_str().unwrap(), &[0]),
                    call_me_later(3.0),
                ]),
                "REQUESTED_CALL" => Some(vec![kill(&["w!1"])]),
                _ => None,
            })
            .flatten()
            .collect()
    });

    let report = simulation(workloads, 1, decider).run().await.unwrap();

    assert!(approx(report.makespan, 3.0));
    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::CompletedKilled);
    assert!(approx(job.runtime, 3.0));

    let events = received_events(&log);
    let killed = events
        .iter()
        .find(|(kind, _)| kind == "JOB_KILLED")
        .expect("JOB_KILLED must reach the decider");
    assert!(approx(killed.1["timestamp"].as_f64().unwrap(), 3.0));
    let progress = &killed.1["data"]["progress"]["w!1"];
    assert_eq!(progress["profile"], "delay10");
    assert!(approx(progress["elapsed"].as_f64().unwrap(), 3.0));
    assert!(
        events
            .iter()
            .any(|(kind, event)| kind == "JOB_COMPLETED"
                && event["data"]["job_state"] == "COMPLETED_KILLED")
    );
}

#[tokio::test(start_paused = true)]
async fn pstate_switch_reports_each_machine_after_the_transition() {
    let workloads = workload(
        &[(1, 0.0, 5.0, 1, "p")],
        &[("p", Profile::Delay { delay: 1.0 })],
    );
    let (decider, log) = scripted(|request| {
        events_of(request)
            .iter()
            .filter_map(|(kind, event)| match kind.as_str() {
                "JOB_SUBMITTED" => Some(vec![
                    reject(event["data"]["job_id"].as_str().unwrap()),
                    json!({"type": "SET_RESOURCE_STATE",
                           "data": {"resources": [0, 1], "pstate": 1}}),
                ]),
                _ => None,
            })
            .flatten()
            .collect()
    });

    let report = simulation_with(
        workloads,
        2,
        decider,
        SimulationConfig::default(),
        |spec| UniformPlatformSpec {
            switch_seconds: 2.0,
            ..spec
        },
    )
    .run()
    .await
    .unwrap();

    assert!(approx(report.makespan, 2.0));

    let events = received_events(&log);
    let changing = events
        .iter()
        .find(|(kind, _)| kind == "RESOURCE_STATE_CHANGING")
        .expect("the accepted request must be announced");
    assert!(approx(changing.1["timestamp"].as_f64().unwrap(), 0.0));

    let changed: Vec<_> = events
        .iter()
        .filter(|(kind, _)| kind == "RESOURCE_STATE_CHANGED")
        .collect();
    assert_eq!(changed.len(), 2);
    for (_, event) in &changed {
        assert!(approx(event["timestamp"].as_f64().unwrap(), 2.0));
        assert_eq!(event["data"]["pstate"], 1);
    }
}
