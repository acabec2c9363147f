use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Identifier of a simulated machine (also its platform host id).
pub type MachineId = u32;

/// Power-management state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    /// Powered on, no job running.
    Idle,
    /// Powered on, at least one job running.
    Computing,
    /// Transitioning into a compute pstate.
    SwitchingOn,
    /// Transitioning into a sleep pstate.
    SwitchingOff,
    /// In a sleep pstate; cannot execute jobs.
    Sleeping,
}

/// One simulated machine.
#[derive(Debug, Clone)]
pub struct Machine {
    /// Machine id, equal to its index in the table.
    pub id: MachineId,
    /// Human-readable name.
    pub name: String,
    /// Current power state index.
    pub pstate: u32,
    /// Current power-management state.
    pub state: MachineState,
    /// Jobs currently running on the machine.
    pub jobs: HashSet<JobId>,
    /// Joules consumed while at least one job was running.
    pub computing_joules: f64,
    /// Joules consumed while idle, switching or sleeping.
    pub idle_joules: f64,
    /// Platform energy reading at the last state transition.
    energy_mark: f64,
}

impl Machine {
    fn new(id: MachineId) -> Self {
        Self {
            id,
            name: format!("machine{id}"),
            pstate: 0,
            state: MachineState::Idle,
            jobs: HashSet::new(),
            computing_joules: 0.0,
            idle_joules: 0.0,
            energy_mark: 0.0,
        }
    }

    /// Whether a job may start executing on this machine right now.
    pub fn allows_execution(&self) -> bool {
        matches!(self.state, MachineState::Idle | MachineState::Computing)
    }

    fn close_span(&mut self, energy_now: f64) {
        let joules = energy_now - self.energy_mark;
        match self.state {
            MachineState::Computing => self.computing_joules += joules,
            _ => self.idle_joules += joules,
        }
        self.energy_mark = energy_now;
    }
}

/// The table of all schedulable machines, serialized through the server.
#[derive(Debug, Default)]
pub struct Machines {
    machines: Vec<Machine>,
}

impl Machines {
    /// Builds a table of `count` idle machines in pstate 0.
    pub fn new(count: u32) -> Self {
        Self {
            machines: (0..count).map(Machine::new).collect(),
        }
    }

    /// Number of machines.
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// All machine ids.
    pub fn ids(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.machines.iter().map(|m| m.id)
    }

    /// Looks up one machine.
    pub fn get(&self, id: MachineId) -> Option<&Machine> {
        self.machines.get(id as usize)
    }

    /// Marks the machines of a starting job as computing. `energy` reads the
    /// platform energy counter of a machine so open accounting spans can be
    /// closed at the transition.
    pub fn update_on_job_run(
        &mut self,
        job: &JobId,
        machines: &[MachineId],
        energy: impl Fn(MachineId) -> f64,
    ) {
        for &id in machines {
            let machine = &mut self.machines[id as usize];
            debug_assert!(machine.allows_execution(), "job placed on unavailable machine");
            if machine.state == MachineState::Idle {
                machine.close_span(energy(id));
                machine.state = MachineState::Computing;
            }
            machine.jobs.insert(job.clone());
        }
    }

    /// Removes a finished job from its machines, returning them to idle when
    /// the last job leaves.
    pub fn update_on_job_end(
        &mut self,
        job: &JobId,
        machines: &[MachineId],
        energy: impl Fn(MachineId) -> f64,
    ) {
        for &id in machines {
            let machine = &mut self.machines[id as usize];
            machine.jobs.remove(job);
            if machine.jobs.is_empty() && machine.state == MachineState::Computing {
                machine.close_span(energy(id));
                machine.state = MachineState::Idle;
            }
        }
    }

    /// Marks a machine as transitioning toward a pstate.
    pub fn begin_pstate_switch(
        &mut self,
        id: MachineId,
        to_compute_pstate: bool,
        energy: impl Fn(MachineId) -> f64,
    ) {
        let machine = &mut self.machines[id as usize];
        machine.close_span(energy(id));
        machine.state = if to_compute_pstate {
            MachineState::SwitchingOn
        } else {
            MachineState::SwitchingOff
        };
    }

    /// Commits a finished pstate transition.
    pub fn finish_pstate_switch(
        &mut self,
        id: MachineId,
        pstate: u32,
        to_compute_pstate: bool,
        energy: impl Fn(MachineId) -> f64,
    ) {
        let machine = &mut self.machines[id as usize];
        machine.close_span(energy(id));
        machine.pstate = pstate;
        machine.state = if to_compute_pstate {
            MachineState::Idle
        } else {
            MachineState::Sleeping
        };
    }
}
