//! # Master Module - Simulation Controller
//!
//! [`Simulator`] abstracts away the interface to the worker process: it
//! initializes the ensemble from a [`Parameters`]/[`Configuration`] pair,
//! drives simulation bursts across all ranks, and reassembles the
//! distributed particle data into canonically ordered snapshots.
//!
//! A burst posts `slave_simulation_loop` asynchronously to every slave,
//! runs `master_simulate_cycles` on rank 0 (which broadcasts the cycle
//! count over the compute plane), and then collects the slave replies, so
//! all ranks integrate concurrently while the FIFO protocol stays strictly
//! request/reply.

// Initialization fan-out and message builders
pub mod init;

use crate::cells::PartitionError;
use crate::channel::{ChannelError, WorkerChannel};
use crate::state::{Configuration, Parameters, SimulationState, StateError, ThreadState};
use crate::vector::Vec3;
use crate::wire::{WireError, WriteMessage};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors raised while controlling a simulation.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] WireError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("bad number of threads {threads} with divisions {divisions:?} for {world} workers")]
    BadThreadCount {
        threads: usize,
        divisions: [usize; 3],
        world: usize,
    },

    #[error("workers returned {found} particles; expected {expected}")]
    LostParticles { expected: usize, found: usize },

    #[error("duplicate particle tag {0} across workers")]
    DuplicateTag(i64),

    #[error("invalid positions: {0}")]
    InvalidPositions(String),

    #[error("worker returned a neighbor table with an odd element count")]
    MalformedNeighborTable,
}

/// High-level interface to the simulation process.
pub struct Simulator {
    channel: WorkerChannel,
    parameters: Parameters,
    time_step: f64,
    start_time: f64,
    simulated_cycles: u64,
    n_particles: usize,
}

impl Simulator {
    /// Creates a `Simulator` from an uninitialized [`WorkerChannel`],
    /// validating the inputs and broadcasting the full initialization
    /// sequence.
    pub fn create(
        mut channel: WorkerChannel,
        parameters: Parameters,
        configuration: &Configuration,
        divisions: Option<[usize; 3]>,
        random_seed: Option<u64>,
    ) -> Result<Self, MasterError> {
        parameters.validate()?;
        configuration.validate(&parameters.box_vec())?;
        init::initialize(
            &mut channel,
            &parameters,
            configuration,
            divisions,
            random_seed,
        )?;
        Ok(Simulator {
            channel,
            time_step: parameters.time_step,
            start_time: configuration.time,
            simulated_cycles: 0,
            n_particles: configuration.positions.len(),
            parameters,
        })
    }

    /// The immutable run parameters.
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Current simulation time: the initial configuration's time plus all
    /// integrated cycles.
    pub fn time(&self) -> f64 {
        self.start_time + self.simulated_cycles as f64 * self.time_step
    }

    /// Simulates `n_cycles` integration cycles, issuing at most
    /// `max_c_cycles` per worker command.
    pub fn simulate(&mut self, n_cycles: u64, max_c_cycles: u64) -> Result<(), MasterError> {
        let max_c_cycles = max_c_cycles.max(1);
        let full = n_cycles / max_c_cycles;
        let extra = n_cycles % max_c_cycles;
        for _ in 0..full {
            self.simulate_cycles(max_c_cycles)?;
        }
        if extra > 0 {
            self.simulate_cycles(extra)?;
        }
        Ok(())
    }

    fn simulate_cycles(&mut self, steps: u64) -> Result<(), MasterError> {
        let n_slaves = self.channel.size()? as usize - 1;
        let loop_msg = WriteMessage::command("slave_simulation_loop");
        self.channel
            .map_slave_async_send(&vec![loop_msg; n_slaves])?;

        let mut burst = WriteMessage::command("master_simulate_cycles");
        burst.write_int(steps as i64);
        self.channel.perform_command(0, &burst)?.require_end()?;
        self.simulated_cycles += steps;

        for reply in self.channel.map_slave_async_recv()? {
            reply.require_end()?;
        }
        Ok(())
    }

    /// Retrieves the positions of all particles, reassembled in the order
    /// the particles were first given (their tags), so individual particle
    /// trajectories stay traceable.
    pub fn positions(&mut self) -> Result<Vec<Vec3>, MasterError> {
        let replies = self
            .channel
            .on_each_async(&WriteMessage::command("collect_thread_positions_and_tags"))?;

        let mut tagged: Vec<(i64, Vec3)> = Vec::with_capacity(self.n_particles);
        for mut reply in replies {
            let positions = reply.read_vec_array()?;
            let tags = reply.read_int_array()?;
            reply.require_end()?;
            tagged.extend(tags.into_iter().zip(positions));
        }

        if tagged.len() != self.n_particles {
            return Err(MasterError::LostParticles {
                expected: self.n_particles,
                found: tagged.len(),
            });
        }
        tagged.sort_by_key(|&(tag, _)| tag);
        for pair in tagged.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(MasterError::DuplicateTag(pair[0].0));
            }
        }

        let box_size = self.parameters.box_vec();
        let bad: Vec<String> = tagged
            .iter()
            .filter(|(_, p)| !(0..3).all(|a| p.axis(a) >= 0.0 && p.axis(a) < box_size.axis(a)))
            .map(|(tag, p)| format!("{p} ({tag})"))
            .collect();
        if !bad.is_empty() {
            return Err(MasterError::InvalidPositions(bad.join(", ")));
        }

        Ok(tagged.into_iter().map(|(_, p)| p).collect())
    }

    /// Builds a [`Configuration`] snapshot at the current simulation time.
    pub fn configuration(&mut self) -> Result<Configuration, MasterError> {
        Ok(Configuration {
            time: self.time(),
            wall_time: wall_time(),
            positions: self.positions()?,
        })
    }

    /// Forces a collective ghost exchange and neighbor-list rebuild across
    /// all ranks.
    pub fn update_neighbors(&mut self) -> Result<(), MasterError> {
        for reply in self
            .channel
            .on_each_async(&WriteMessage::command("thread_update_neighbors"))?
        {
            reply.require_end()?;
        }
        Ok(())
    }

    /// Retrieves the internal state of every rank; largely only useful for
    /// debugging.
    pub fn state(&mut self) -> Result<SimulationState, MasterError> {
        let replies = self
            .channel
            .on_each_async(&WriteMessage::command("collect_thread_state"))?;

        let mut threads = Vec::with_capacity(replies.len());
        for mut reply in replies {
            let positions = reply.read_vec_array()?;
            let tags = reply.read_int_array()?;
            let internal_neighbors = read_neighbors(reply.read_int_array()?)?;
            let external_neighbors = read_neighbors(reply.read_int_array()?)?;
            reply.require_end()?;
            threads.push(ThreadState {
                positions,
                tags,
                internal_neighbors,
                external_neighbors,
            });
        }
        Ok(SimulationState {
            time: self.time(),
            wall_time: wall_time(),
            threads,
        })
    }

    /// Shuts the worker process down; further use is impossible.
    pub fn shutdown(mut self) {
        self.channel.shutdown();
    }
}

/// Reshapes a flat neighbor array into index pairs.
fn read_neighbors(flat: Vec<i64>) -> Result<Vec<[i64; 2]>, MasterError> {
    if flat.len() % 2 != 0 {
        return Err(MasterError::MalformedNeighborTable);
    }
    Ok(flat.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
