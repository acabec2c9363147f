use std::sync::Arc;

use crate::api::DeciderConnection;
use crate::bus::{Message, SERVER_MAILBOX};
use crate::context::SimContext;
use crate::error::SimulationError;
use crate::protocol::{ReplyEnvelope, RequestEnvelope, TimedEvent};

/// The decider connection, shared between successive relay rounds. Rounds
/// never overlap (`sched_ready` gates the next flush), so the lock is only
/// ever contended during teardown.
pub(crate) type SharedDecider = Arc<tokio::sync::Mutex<Box<dyn DeciderConnection>>>;

/// One transactional exchange with the decider: serialize the batch, perform
/// the round trip, inject every reply event into the server mailbox in
/// order, then announce `SCHED_READY`.
pub(crate) async fn relay_round(
    ctx: Arc<SimContext>,
    decider: SharedDecider,
    events: Vec<TimedEvent>,
) -> Result<(), SimulationError> {
    let request = RequestEnvelope {
        now: ctx.clock.now(),
        events,
    };
    let payload =
        serde_json::to_string(&request).map_err(|err| SimulationError::Protocol(err.to_string()))?;

    tracing::debug!(now = request.now, events = request.events.len(), "flushing to decider");
    let reply = {
        let mut decider = decider.lock().await;
        decider
            .round_trip(&payload)
            .await
            .map_err(|err| SimulationError::Decider(format!("{err:#}")))?
    };

    let reply: ReplyEnvelope =
        serde_json::from_str(&reply).map_err(|err| SimulationError::Protocol(err.to_string()))?;
    tracing::debug!(reply_now = reply.now, events = reply.events.len(), "decider replied");

    for event in reply.events {
        tracing::trace!(timestamp = event.timestamp, "injecting reply event");
        ctx.bus.send(SERVER_MAILBOX, event.event.into_message())?;
    }
    ctx.bus.send(SERVER_MAILBOX, Message::SchedReady)?;
    Ok(())
}
