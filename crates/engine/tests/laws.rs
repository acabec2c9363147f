//! Behavioral laws: sequence short-circuit and kill idempotence.

mod common;

use batforge_core::{JobState, Profile};

use common::*;

fn approx(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() < 1e-9
}

#[tokio::test(start_paused = true)]
async fn sequence_short_circuits_on_walltime() {
    // 2 x [unit, unit] with unit = Delay(4) under a 10s walltime: the third
    // play hits the budget and everything after it is skipped.
    let workloads = workload(
        &[(1, 0.0, 10.0, 1, "seq")],
        &[
            ("unit", Profile::Delay { delay: 4.0 }),
            (
                "seq",
                Profile::Sequence {
                    repeat: 2,
                    sequence: vec!["unit".into(), "unit".into()],
                },
            ),
        ],
    );
    let (decider, _log) = scripted(|request| {
        events_of(request)
            .iter()
            .filter(|(kind, _)| kind == "JOB_SUBMITTED")
            .map(|(_, event)| execute(event["data"]["job_id"].as_str().unwrap(), &[0]))
            .collect()
    });

    let report = simulation(workloads, 1, decider).run().await.unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::CompletedKilled);
    assert!(approx(job.runtime, 10.0));
    assert!(approx(report.makespan, 10.0));
}

#[tokio::test(start_paused = true)]
async fn sequence_that_fits_replays_every_sub_profile() {
    let workloads = workload(
        &[(1, 0.0, 30.0, 1, "seq")],
        &[
            ("unit", Profile::Delay { delay: 4.0 }),
            (
                "seq",
                Profile::Sequence {
                    repeat: 3,
                    sequence: vec!["unit".into(), "unit".into()],
                },
            ),
        ],
    );
    let (decider, _log) = scripted(|request| {
        events_of(request)
            .iter()
            .filter(|(kind, _)| kind == "JOB_SUBMITTED")
            .map(|(_, event)| execute(event["data"]["job_id"].as_str().unwrap(), &[0]))
            .collect()
    });

    let report = simulation(workloads, 1, decider).run().await.unwrap();

    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::CompletedSuccessfully);
    assert!(approx(job.runtime, 24.0));
}

#[tokio::test(start_paused = true)]
async fn killing_a_completed_job_is_a_no_op() {
    let workloads = workload(
        &[(1, 0.0, 10.0, 1, "p")],
        &[("p", Profile::Delay { delay: 2.0 })],
    );
    let (decider, log) = scripted(|request| {
        events_of(request)
            .iter()
            .filter_map(|(kind, event)| match kind.as_str() {
                "JOB_SUBMITTED" => Some(vec![
                    execute(event["data"]["job_id"].as_str().unwrap(), &[0]),
                    call_me_later(5.0),
                ]),
                "REQUESTED_CALL" => Some(vec![kill(&["w!1"])]),
                _ => None,
            })
            .flatten()
            .collect()
    });

    let report = simulation(workloads, 1, decider).run().await.unwrap();

    // The kill arrived three seconds after completion: state and runtime are
    // untouched, and the kill report lists the job without progress.
    let job = &report.jobs[0];
    assert_eq!(job.state, JobState::CompletedSuccessfully);
    assert!(approx(job.runtime, 2.0));

    let events = received_events(&log);
    let killed = events
        .iter()
        .find(|(kind, _)| kind == "JOB_KILLED")
        .expect("KILLING_DONE must still be reported");
    assert_eq!(killed.1["data"]["job_ids"][0], "w!1");
    assert!(
        killed.1["data"]["progress"]
            .as_object()
            .unwrap()
            .is_empty()
    );
    assert!(approx(report.makespan, 5.0));
}
