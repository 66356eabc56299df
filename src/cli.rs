//! # CLI Module - Master Front-End Options
//!
//! Command-line interface of the simulator. A run either continues an
//! existing trajectory (loading its parameters and final configuration),
//! starts from a separate `--init-file`, or starts fresh from a TOML
//! `--params-file` with particles seeded on a cubic lattice.
//!
//! The simulation itself runs in a spawned worker process (`bd-worker`),
//! optionally wrapped by a launcher program via `--mpirun`/`--mpi`.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Brownian Dynamics simulation of colloidal particles")]
pub struct Cli {
    /// Trajectory output path; '-' writes to stdout
    #[arg(default_value = "-", value_name = "FILE")]
    pub outfile: String,

    /// Initial configuration file; otherwise load from the simulation file
    #[arg(long, value_name = "FILE")]
    pub init_file: Option<PathBuf>,

    /// TOML parameters file to start a fresh trajectory
    #[arg(long, value_name = "FILE", conflicts_with = "init_file")]
    pub params_file: Option<PathBuf>,

    /// Number of particles seeded on a cubic lattice with --params-file
    #[arg(long, value_name = "N", requires = "params_file")]
    pub num_particles: Option<usize>,

    /// How often to save configurations, in seconds
    #[arg(long, value_name = "TIME", default_value_t = 1e-5)]
    pub save_rate: f64,

    /// Total time to simulate in seconds; 0 simulates until interrupted
    #[arg(long, value_name = "TIME", default_value_t = 0.0)]
    pub duration: f64,

    /// Offset duration by the time of the initial configuration
    #[arg(long)]
    pub absolute_duration: bool,

    /// Perform at most N integrations in one worker command
    #[arg(long, value_name = "N", default_value_t = 4000)]
    pub max_c_integrations: u64,

    /// Erase an existing trajectory as opposed to appending
    #[arg(long)]
    pub clobber: bool,

    /// Dump the state of individual threads instead of just positions;
    /// just for debugging
    #[arg(long)]
    pub thread_dump: bool,

    /// Random seed; otherwise randomly seeded from system entropy
    #[arg(long, value_name = "SEED")]
    pub random_seed: Option<u64>,

    /// Number of worker threads to use in the simulation
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub nproc: u32,

    /// Pass an argument on to the launcher program (repeatable)
    #[arg(short = 'm', long = "mpi", value_name = "ARG")]
    pub mpiargs: Vec<String>,

    /// Path to the launcher program
    #[arg(long, value_name = "PATH")]
    pub mpirun: Option<PathBuf>,

    /// Path to the bd-worker binary; defaults to next to this executable
    #[arg(long, value_name = "PATH")]
    pub worker: Option<PathBuf>,
}

/// Resolves the requested duration against the initial configuration time.
///
/// With `--absolute-duration` the request names an absolute simulation
/// time, so the time already covered by the initial configuration is
/// subtracted; `None` means the run is already complete. A zero duration
/// always means "run forever".
pub fn effective_duration(duration: f64, absolute: bool, initial_time: f64) -> Option<f64> {
    if absolute && duration > 0.0 {
        let remaining = duration - initial_time;
        if remaining <= 0.0 {
            return None;
        }
        return Some(remaining);
    }
    Some(duration)
}

#[cfg(test)]
mod tests {
    use super::effective_duration;

    #[test]
    fn test_effective_duration_relative() {
        assert_eq!(effective_duration(1e-3, false, 5e-4), Some(1e-3));
        assert_eq!(effective_duration(0.0, false, 5e-4), Some(0.0));
    }

    #[test]
    fn test_effective_duration_absolute() {
        // the run continues for the remaining time only
        assert_eq!(effective_duration(1e-3, true, 4e-4), Some(6e-4));
        // a trajectory already past the target is complete
        assert_eq!(effective_duration(1e-3, true, 1e-3), None);
        assert_eq!(effective_duration(1e-3, true, 2e-3), None);
        // zero still means unbounded
        assert_eq!(effective_duration(0.0, true, 2e-3), Some(0.0));
    }
}
