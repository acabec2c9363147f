use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use batforge_core::{Allocation, Job, JobId, JobState, MachineId, Profile};

use crate::api::JobProgress;

/// Well-known mailbox of the server loop.
pub(crate) const SERVER_MAILBOX: &str = "server";

/// The closed message set of the engine. One variant per payload; ownership
/// of the payload moves through the channel with the message, so there is no
/// blocking/detached send distinction.
#[derive(Debug)]
pub(crate) enum Message {
    // Submitter -> Server.
    SubmitterHello {
        submitter: String,
        callback_on_completion: bool,
    },
    JobSubmitted {
        submitter: String,
        job_id: JobId,
    },
    SubmitterBye {
        submitter: String,
        is_workflow: bool,
    },

    // Server -> Submitter.
    SubmitterCallback {
        job_id: JobId,
    },

    // Relay -> Server (decider commands).
    JobSubmittedByDecider {
        job: Job,
        profile: Option<(String, Profile)>,
    },
    ProfileSubmittedByDecider {
        workload: String,
        name: String,
        profile: Profile,
    },
    ExecuteJob {
        allocation: Allocation,
    },
    ChangeJobState {
        job_id: JobId,
        state: JobState,
        kill_reason: Option<String>,
    },
    RejectJob {
        job_id: JobId,
    },
    KillJobs {
        job_ids: Vec<JobId>,
    },
    CallMeLater {
        target_time: f64,
    },
    QueryConsumedEnergy,
    SetMachinePstates {
        machines: Vec<MachineId>,
        pstate: u32,
    },
    EndDynamicSubmissions,
    ContinueDynamicSubmissions,
    ToJob {
        job_id: JobId,
        payload: serde_json::Value,
    },
    SchedReady,

    // Job -> Server.
    FromJob {
        job_id: JobId,
        payload: serde_json::Value,
    },

    // Worker -> Server.
    JobCompleted {
        job_id: JobId,
    },
    WaitingDone,
    KillingDone {
        job_ids: Vec<JobId>,
        progress: HashMap<JobId, JobProgress>,
    },
    SwitchedOn {
        machine: MachineId,
        pstate: u32,
    },
    SwitchedOff {
        machine: MachineId,
        pstate: u32,
    },

    // Any worker -> Server: a fatal condition observed off the server task.
    WorkerFailed {
        error: crate::error::SimulationError,
    },
}

impl Message {
    /// Short kind name, for logs.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Message::SubmitterHello { .. } => "SUBMITTER_HELLO",
            Message::JobSubmitted { .. } => "JOB_SUBMITTED",
            Message::SubmitterBye { .. } => "SUBMITTER_BYE",
            Message::SubmitterCallback { .. } => "SUBMITTER_CALLBACK",
            Message::JobSubmittedByDecider { .. } => "JOB_SUBMITTED_BY_DP",
            Message::ProfileSubmittedByDecider { .. } => "PROFILE_SUBMITTED_BY_DP",
            Message::ExecuteJob { .. } => "SCHED_EXECUTE_JOB",
            Message::ChangeJobState { .. } => "SCHED_CHANGE_JOB_STATE",
            Message::RejectJob { .. } => "SCHED_REJECT_JOB",
            Message::KillJobs { .. } => "SCHED_KILL_JOB",
            Message::CallMeLater { .. } => "SCHED_CALL_ME_LATER",
            Message::QueryConsumedEnergy => "SCHED_TELL_ME_ENERGY",
            Message::SetMachinePstates { .. } => "PSTATE_MODIFICATION",
            Message::EndDynamicSubmissions => "END_DYNAMIC_SUBMIT",
            Message::ContinueDynamicSubmissions => "CONTINUE_DYNAMIC_SUBMIT",
            Message::ToJob { .. } => "TO_JOB_MSG",
            Message::SchedReady => "SCHED_READY",
            Message::FromJob { .. } => "FROM_JOB_MSG",
            Message::JobCompleted { .. } => "JOB_COMPLETED",
            Message::WaitingDone => "WAITING_DONE",
            Message::KillingDone { .. } => "KILLING_DONE",
            Message::SwitchedOn { .. } => "SWITCHED_ON",
            Message::SwitchedOff { .. } => "SWITCHED_OFF",
            Message::WorkerFailed { .. } => "WORKER_FAILED",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum BusError {
    #[error("no mailbox named '{0}'")]
    NoSuchMailbox(String),
    #[error("mailbox '{0}' is already registered")]
    DuplicateMailbox(String),
    #[error("mailbox '{0}' is no longer receiving")]
    Closed(String),
}

/// Named-mailbox registry. Mailboxes are unbounded FIFO channels addressed
/// by string; `send` enqueues without suspending the sender.
#[derive(Clone)]
pub(crate) struct Bus {
    inner: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>,
}

impl Bus {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a mailbox and returns its receiving end.
    pub(crate) fn register(&self, name: &str) -> Result<mpsc::UnboundedReceiver<Message>, BusError> {
        let mut inner = self.inner.lock().expect("bus poisoned");
        if inner.contains_key(name) {
            return Err(BusError::DuplicateMailbox(name.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.insert(name.to_string(), tx);
        Ok(rx)
    }

    /// Removes a mailbox; further sends to it fail.
    pub(crate) fn unregister(&self, name: &str) {
        self.inner.lock().expect("bus poisoned").remove(name);
    }

    /// Delivers a message into the named mailbox.
    pub(crate) fn send(&self, dest: &str, message: Message) -> Result<(), BusError> {
        let inner = self.inner.lock().expect("bus poisoned");
        let tx = inner
            .get(dest)
            .ok_or_else(|| BusError::NoSuchMailbox(dest.to_string()))?;
        tx.send(message)
            .map_err(|_| BusError::Closed(dest.to_string()))
    }

    /// Delivers to the server mailbox, which outlives every worker; failures
    /// only happen during teardown and are ignored.
    pub(crate) fn send_to_server(&self, message: Message) {
        if let Err(err) = self.send(SERVER_MAILBOX, message) {
            tracing::debug!(%err, "dropping message sent after server shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_are_delivered_in_fifo_order() {
        let bus = Bus::new();
        let mut rx = bus.register("box").unwrap();

        bus.send("box", Message::WaitingDone).unwrap();
        bus.send("box", Message::SchedReady).unwrap();

        assert_eq!(rx.recv().await.unwrap().kind(), "WAITING_DONE");
        assert_eq!(rx.recv().await.unwrap().kind(), "SCHED_READY");
    }

    #[tokio::test]
    async fn unknown_and_duplicate_mailboxes_are_errors() {
        let bus = Bus::new();
        assert!(matches!(
            bus.send("nobody", Message::WaitingDone),
            Err(BusError::NoSuchMailbox(_))
        ));

        let _rx = bus.register("box").unwrap();
        assert!(matches!(
            bus.register("box"),
            Err(BusError::DuplicateMailbox(_))
        ));

        bus.unregister("box");
        assert!(bus.register("box").is_ok());
    }
}
