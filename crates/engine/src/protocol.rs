use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use batforge_core::{Allocation, Job, JobId, JobState, MachineId, Profile};

use crate::api::JobProgress;
use crate::bus::Message;

/// One decider round: the simulated time of the flush plus every event
/// batched since the previous round, in enqueue order.
#[derive(Debug, Serialize)]
pub(crate) struct RequestEnvelope {
    pub(crate) now: f64,
    pub(crate) events: Vec<TimedEvent>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TimedEvent {
    pub(crate) timestamp: f64,
    #[serde(flatten)]
    pub(crate) event: OutboundEvent,
}

/// Compact job description attached to submission events so the decider can
/// place the job without a side channel.
#[derive(Debug, Serialize)]
pub(crate) struct JobSummary {
    pub(crate) profile: String,
    pub(crate) res: usize,
    pub(crate) walltime: f64,
    pub(crate) subtime: f64,
}

/// Events the server reports to the decider.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data")]
pub(crate) enum OutboundEvent {
    #[serde(rename = "JOB_SUBMITTED")]
    JobSubmitted {
        job_id: JobId,
        job: JobSummary,
    },
    #[serde(rename = "JOB_COMPLETED")]
    JobCompleted {
        job_id: JobId,
        job_state: JobState,
        #[serde(skip_serializing_if = "Option::is_none")]
        kill_reason: Option<String>,
    },
    #[serde(rename = "JOB_KILLED")]
    JobKilled {
        job_ids: Vec<JobId>,
        progress: HashMap<JobId, JobProgress>,
    },
    /// Machines accepted a pstate request and started transitioning.
    #[serde(rename = "RESOURCE_STATE_CHANGING")]
    ResourceStateChanging {
        resources: Vec<MachineId>,
        pstate: u32,
    },
    /// A machine finished its transition and now runs in `pstate`.
    #[serde(rename = "RESOURCE_STATE_CHANGED")]
    ResourceStateChanged {
        resources: Vec<MachineId>,
        pstate: u32,
    },
    #[serde(rename = "REQUESTED_CALL")]
    RequestedCall,
    #[serde(rename = "CONSUMED_ENERGY")]
    ConsumedEnergy {
        consumed_energy: f64,
    },
    #[serde(rename = "FROM_JOB_MSG")]
    FromJob {
        job_id: JobId,
        msg: serde_json::Value,
    },
    #[serde(rename = "SIMULATION_ENDS")]
    SimulationEnds,
}

/// The decider's reply to one round.
#[derive(Debug, Deserialize)]
pub(crate) struct ReplyEnvelope {
    #[serde(default)]
    pub(crate) now: f64,
    #[serde(default)]
    pub(crate) events: Vec<ReplyEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReplyEvent {
    #[serde(default)]
    pub(crate) timestamp: f64,
    #[serde(flatten)]
    pub(crate) event: InboundEvent,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubmittedProfile {
    pub(crate) name: String,
    pub(crate) profile: Profile,
}

/// Events the decider may issue in a reply.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data")]
pub(crate) enum InboundEvent {
    #[serde(rename = "EXECUTE_JOB")]
    ExecuteJob {
        job_id: JobId,
        alloc: Vec<MachineId>,
        #[serde(default)]
        mapping: Option<Vec<usize>>,
    },
    #[serde(rename = "REJECT_JOB")]
    RejectJob { job_id: JobId },
    #[serde(rename = "CHANGE_JOB_STATE")]
    ChangeJobState {
        job_id: JobId,
        job_state: JobState,
        #[serde(default)]
        kill_reason: Option<String>,
    },
    #[serde(rename = "KILL_JOB")]
    KillJob { job_ids: Vec<JobId> },
    #[serde(rename = "CALL_ME_LATER")]
    CallMeLater { timestamp: f64 },
    #[serde(rename = "QUERY_CONSUMED_ENERGY")]
    QueryConsumedEnergy,
    #[serde(rename = "SET_RESOURCE_STATE")]
    SetResourceState {
        resources: Vec<MachineId>,
        pstate: u32,
    },
    #[serde(rename = "SUBMIT_JOB")]
    SubmitJob {
        job: Job,
        #[serde(default)]
        profile: Option<SubmittedProfile>,
    },
    #[serde(rename = "SUBMIT_PROFILE")]
    SubmitProfile {
        workload: String,
        name: String,
        profile: Profile,
    },
    #[serde(rename = "END_DYNAMIC_SUBMIT")]
    EndDynamicSubmit,
    #[serde(rename = "CONTINUE_DYNAMIC_SUBMIT")]
    ContinueDynamicSubmit,
    #[serde(rename = "TO_JOB_MSG")]
    ToJob {
        job_id: JobId,
        msg: serde_json::Value,
    },
}

impl InboundEvent {
    /// Maps a parsed reply event onto the server's message set.
    pub(crate) fn into_message(self) -> Message {
        match self {
            InboundEvent::ExecuteJob {
                job_id,
                alloc,
                mapping,
            } => Message::ExecuteJob {
                allocation: Allocation {
                    job_id,
                    machines: alloc,
                    mapping,
                },
            },
            InboundEvent::RejectJob { job_id } => Message::RejectJob { job_id },
            InboundEvent::ChangeJobState {
                job_id,
                job_state,
                kill_reason,
            } => Message::ChangeJobState {
                job_id,
                state: job_state,
                kill_reason,
            },
            InboundEvent::KillJob { job_ids } => Message::KillJobs { job_ids },
            InboundEvent::CallMeLater { timestamp } => Message::CallMeLater {
                target_time: timestamp,
            },
            InboundEvent::QueryConsumedEnergy => Message::QueryConsumedEnergy,
            InboundEvent::SetResourceState { resources, pstate } => Message::SetMachinePstates {
                machines: resources,
                pstate,
            },
            InboundEvent::SubmitJob { job, profile } => Message::JobSubmittedByDecider {
                job,
                profile: profile.map(|p| (p.name, p.profile)),
            },
            InboundEvent::SubmitProfile {
                workload,
                name,
                profile,
            } => Message::ProfileSubmittedByDecider {
                workload,
                name,
                profile,
            },
            InboundEvent::EndDynamicSubmit => Message::EndDynamicSubmissions,
            InboundEvent::ContinueDynamicSubmit => Message::ContinueDynamicSubmissions,
            InboundEvent::ToJob { job_id, msg } => Message::ToJob {
                job_id,
                payload: msg,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_serializes_tagged_events() {
        let envelope = RequestEnvelope {
            now: 12.5,
            events: vec![
                TimedEvent {
                    timestamp: 3.0,
                    event: OutboundEvent::JobSubmitted {
                        job_id: JobId::new("w", 7),
                        job: JobSummary {
                            profile: "p".into(),
                            res: 2,
                            walltime: 60.0,
                            subtime: 3.0,
                        },
                    },
                },
                TimedEvent {
                    timestamp: 12.5,
                    event: OutboundEvent::RequestedCall,
                },
            ],
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(json["now"], 12.5);
        assert_eq!(json["events"][0]["type"], "JOB_SUBMITTED");
        assert_eq!(json["events"][0]["data"]["job_id"], "w!7");
        assert_eq!(json["events"][0]["data"]["job"]["res"], 2);
        assert_eq!(json["events"][1]["type"], "REQUESTED_CALL");
        assert_eq!(json["events"][1]["timestamp"], 12.5);
    }

    #[test]
    fn reply_envelope_parses_decider_commands() {
        let mut reply: ReplyEnvelope = serde_json::from_str(
            r#"{
                "now": 4.0,
                "events": [
                    {"timestamp": 4.0, "type": "EXECUTE_JOB",
                     "data": {"job_id": "w!1", "alloc": [0, 1], "mapping": [0, 0, 1]}},
                    {"timestamp": 4.0, "type": "CALL_ME_LATER", "data": {"timestamp": 50.0}},
                    {"timestamp": 4.0, "type": "END_DYNAMIC_SUBMIT"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(reply.now, 4.0);
        assert_eq!(reply.events.len(), 3);

        let first = reply.events.remove(0).event.into_message();
        match first {
            Message::ExecuteJob { allocation } => {
                assert_eq!(allocation.job_id, JobId::new("w", 1));
                assert_eq!(allocation.machines, vec![0, 1]);
                assert_eq!(allocation.mapping, Some(vec![0, 0, 1]));
            }
            other => panic!("expected EXECUTE_JOB, got {}", other.kind()),
        }
        let second = reply.events.remove(0).event.into_message();
        assert!(matches!(
            second,
            Message::CallMeLater { target_time } if target_time == 50.0
        ));
        let third = reply.events.remove(0).event.into_message();
        assert!(matches!(third, Message::EndDynamicSubmissions));
    }

    #[test]
    fn unknown_reply_event_is_an_error() {
        let err = serde_json::from_str::<ReplyEnvelope>(
            r#"{"events": [{"type": "MAKE_COFFEE"}]}"#,
        );
        assert!(err.is_err());
    }
}
