//! # State Module - Persisted Simulation State
//!
//! Configuration-independent run parameters and particle snapshots, the only
//! objects exchanged with the trajectory stream. Every type carries serde
//! derives so it can be persisted with bincode (trajectories) or parsed from
//! TOML (`--params-file`), and a `validate` method enforcing the physical
//! ranges before a run is allowed to start.


use crate::constants::{KB, MCM, MM, NM, NS, PS, R_PARTICLE};
use crate::forcefield::PairPotential;
use crate::vector::Vec3;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

/// Validation failures for persisted state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("{name} = {value:.6e} outside the allowed range [{low:.6e}, {high:.6e}]")]
    OutOfRange {
        name: &'static str,
        value: f64,
        low: f64,
        high: f64,
    },

    #[error("box must be cubic; got {0:?}")]
    NonCubicBox([f64; 3]),

    #[error("r_neighbor ({r_neighbor:.6e}) must exceed r_potential_cutoff ({r_cutoff:.6e})")]
    NeighborRangeTooSmall { r_neighbor: f64, r_cutoff: f64 },

    #[error("configuration time {0} must be finite and non-negative")]
    BadTime(f64),

    #[error("position {index} at {position} is not inside [0, {box_length:.6e}) per axis")]
    BadPosition {
        index: usize,
        position: Vec3,
        box_length: f64,
    },
}

fn check_range(
    name: &'static str,
    value: f64,
    low: f64,
    high: f64,
) -> Result<(), StateError> {
    if value.is_finite() && value >= low && value <= high {
        Ok(())
    } else {
        Err(StateError::OutOfRange {
            name,
            value,
            low,
            high,
        })
    }
}

/// Configuration-independent description of a simulation run.
///
/// All quantities are SI. `du_max` is expressed in kT, the natural energy
/// unit; conversion to joules happens when the system is broadcast to the
/// workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Dimensions of the periodic box (m); must be cubic.
    pub box_size: [f64; 3],

    /// Temperature of the thermal bath (K).
    pub temperature: f64,

    /// Brownian dynamics integration time step (s).
    pub time_step: f64,

    /// Maximum change in energy permitted in any single particle
    /// integration (kT). Sub-cycles keep each individual move below this
    /// limit.
    pub du_max: f64,

    /// Viscosity of the solvent the particles are immersed in (Pa·s).
    pub eta_solv: f64,

    /// Particle pairwise potential.
    pub pair_potential: PairPotential,

    /// Separation distance at which the pair potential becomes zero (m).
    pub r_potential_cutoff: f64,

    /// Reevaluate pairwise forces every n integration cycles. Each force
    /// evaluation requires communicating neighboring particle positions
    /// between workers.
    pub force_update_rate: i64,

    /// Number of points in the linear interpolation tables used for
    /// potential and force evaluation. Larger tables resolve more detail at
    /// the price of memory.
    pub linterp_size: usize,

    /// Minimum separation distance modeled by the interpolation tables (m).
    /// Behavior is undefined should two particles come closer.
    pub linterp_r_min: f64,

    /// All particle pairs within this distance enter the neighbor lists (m).
    /// Together with `r_potential_cutoff` it controls neighbor-list
    /// lifetime.
    pub r_neighbor: f64,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            box_size: [MCM; 3],
            temperature: 300.0,
            time_step: 0.1 * NS,
            du_max: 0.5,
            eta_solv: 8.94e-4, // viscosity of water at 25C
            pair_potential: PairPotential::Zero,
            r_potential_cutoff: 2.0 * R_PARTICLE + 20.0 * NM,
            force_update_rate: 1,
            linterp_size: 250,
            linterp_r_min: 0.0,
            r_neighbor: 2.0 * R_PARTICLE + 30.0 * NM,
        }
    }
}

impl Parameters {
    /// Checks every physical range; parameters come from user files, so
    /// violations are configuration errors, not bugs.
    pub fn validate(&self) -> Result<(), StateError> {
        for &side in &self.box_size {
            check_range("box_size", side, NM, MM)?;
        }
        if self.box_size[0] != self.box_size[1] || self.box_size[0] != self.box_size[2] {
            return Err(StateError::NonCubicBox(self.box_size));
        }
        check_range("temperature", self.temperature, 1.0, 2000.0)?;
        check_range("time_step", self.time_step, PS, 1000.0 * NS)?;
        check_range("du_max", self.du_max, 1e-3, 100.0)?;
        check_range("eta_solv", self.eta_solv, 1e-6, 1.0)?;
        check_range(
            "r_potential_cutoff",
            self.r_potential_cutoff,
            2.0 * R_PARTICLE,
            5.0 * R_PARTICLE,
        )?;
        check_range(
            "force_update_rate",
            self.force_update_rate as f64,
            1.0,
            10.0,
        )?;
        check_range("linterp_size", self.linterp_size as f64, 2.0, 10000.0)?;
        check_range("linterp_r_min", self.linterp_r_min, 0.0, 2.0 * R_PARTICLE)?;
        check_range(
            "r_neighbor",
            self.r_neighbor,
            2.0 * R_PARTICLE,
            10.0 * R_PARTICLE,
        )?;
        if self.r_neighbor <= self.r_potential_cutoff {
            return Err(StateError::NeighborRangeTooSmall {
                r_neighbor: self.r_neighbor,
                r_cutoff: self.r_potential_cutoff,
            });
        }
        Ok(())
    }

    /// Box dimensions as a vector.
    pub fn box_vec(&self) -> Vec3 {
        Vec3::from_array(self.box_size)
    }

    /// Thermal energy kT (J).
    pub fn kt(&self) -> f64 {
        KB * self.temperature
    }

    /// Friction coefficient from the Stokes-Einstein relationship (kg/s).
    pub fn friction_gamma(&self) -> f64 {
        6.0 * PI * self.eta_solv * R_PARTICLE
    }

    /// Diffusion coefficient D = kT/γ (m²/s).
    pub fn diffusion(&self) -> f64 {
        self.kt() / self.friction_gamma()
    }
}

/// A single snapshot of all particles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Time associated with this configuration, relative to some initial
    /// reference configuration (s).
    pub time: f64,

    /// Wall-clock time at which the snapshot was generated (s since the
    /// epoch); deltas between snapshots give rough benchmarking.
    pub wall_time: f64,

    /// Location of every particle, in canonical tag order.
    pub positions: Vec<Vec3>,
}

impl Configuration {
    /// An empty configuration at time zero.
    pub fn empty() -> Self {
        Configuration {
            time: 0.0,
            wall_time: 0.0,
            positions: Vec::new(),
        }
    }

    /// Seeds `n` particles on a uniform cubic lattice inside the box.
    ///
    /// Grid cells are filled in axis order and particles sit at cell
    /// centers, so any count up to the lattice capacity produces an
    /// overlap-free starting state.
    pub fn cubic_lattice(n: usize, box_size: &Vec3) -> Self {
        let per_side = (n as f64).cbrt().ceil().max(1.0) as usize;
        let mut positions = Vec::with_capacity(n);
        'fill: for x in 0..per_side {
            for y in 0..per_side {
                for z in 0..per_side {
                    if positions.len() == n {
                        break 'fill;
                    }
                    positions.push(Vec3::new(
                        (x as f64 + 0.5) / per_side as f64 * box_size.x,
                        (y as f64 + 0.5) / per_side as f64 * box_size.y,
                        (z as f64 + 0.5) / per_side as f64 * box_size.z,
                    ));
                }
            }
        }
        Configuration {
            time: 0.0,
            wall_time: 0.0,
            positions,
        }
    }

    /// Validates times and checks every position against the box.
    pub fn validate(&self, box_size: &Vec3) -> Result<(), StateError> {
        if !self.time.is_finite() || self.time < 0.0 {
            return Err(StateError::BadTime(self.time));
        }
        for (index, position) in self.positions.iter().enumerate() {
            let inside = (0..3).all(|a| {
                let c = position.axis(a);
                c.is_finite() && c >= 0.0 && c < box_size.axis(a)
            });
            if !inside {
                return Err(StateError::BadPosition {
                    index,
                    position: *position,
                    box_length: box_size.x,
                });
            }
        }
        Ok(())
    }
}

/// Snapshot of the internal state of a single worker; mainly useful for
/// debugging via `--thread-dump`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    /// Positions of all particles known to the worker, owned first, then
    /// ghost copies from its neighbors.
    pub positions: Vec<Vec3>,

    /// Unique tags of the owned particles.
    pub tags: Vec<i64>,

    /// Neighbor pairs with both endpoints owned, as index pairs into
    /// `positions`.
    pub internal_neighbors: Vec<[i64; 2]>,

    /// Neighbor pairs with one owned and one ghost endpoint.
    pub external_neighbors: Vec<[i64; 2]>,
}

/// State of every worker at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationState {
    /// Simulation time of the snapshot (s).
    pub time: f64,

    /// Wall-clock time of the snapshot (s since the epoch).
    pub wall_time: f64,

    /// Per-worker states, in rank order.
    pub threads: Vec<ThreadState>,
}
