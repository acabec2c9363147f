#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Coordination engine for `batforge` (server loop, job execution, decider
//! relay) over a simulated clock.
//!
//! The engine runs on a *paused* tokio clock: every task suspends only at
//! message waits, simulated sleeps or parallel-task executions, and virtual
//! time advances only when all tasks are blocked on a future deadline. Use
//! [`api::Simulation::run_blocking`] from synchronous code, or
//! [`api::Simulation::run`] from a current-thread runtime whose clock is
//! already paused (e.g. `#[tokio::test(start_paused = true)]`).

/// Public API for the engine crate.
pub mod api;
/// Platform collaborator: the parallel-task primitive and host model.
pub mod platform;

mod bus;
mod context;
mod error;
mod execution;
mod protocol;
mod relay;
mod server;
mod submitter;
mod worker;

pub use api::{
    DeciderConnection, JobMessenger, JobProgress, JobReport, SimClock, Simulation,
    SimulationConfig, SimulationReport, TraceSink,
};
pub use platform::{Platform, TaskOutcome, UniformPlatform, UniformPlatformSpec};
