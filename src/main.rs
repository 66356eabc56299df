//! Master front-end: simulate an ensemble of colloid particles using
//! Brownian Dynamics in a spawned worker process, streaming configurations
//! to a trajectory file.

use brownian_lib::channel::WorkerChannel;
use brownian_lib::cli::{effective_duration, Cli};
use brownian_lib::io::{self, TrajectoryEntry, TrajectoryWriter};
use brownian_lib::master::Simulator;
use brownian_lib::state::{Configuration, Parameters};
use clap::Parser;
use log::{info, warn};
use std::error::Error;
use std::path::{Path, PathBuf};

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if cli.save_rate <= 0.0 {
        return Err(format!("save rate {} must be positive", cli.save_rate).into());
    }
    let (parameters, configuration) = load_initial_state(&cli)?;
    parameters.validate()?;

    let duration = match effective_duration(cli.duration, cli.absolute_duration, configuration.time)
    {
        Some(duration) => {
            if cli.absolute_duration && cli.duration > 0.0 {
                info!(
                    "offsetting simulation duration of length {:.3e} ms by initial time {:.3e} ms",
                    1e3 * cli.duration,
                    1e3 * configuration.time
                );
            }
            duration
        }
        None => {
            info!("simulation complete");
            return Ok(());
        }
    };
    if duration < 0.0 {
        info!("simulation complete");
        return Ok(());
    }

    let channel = create_channel(&cli)?;
    let mut sim = Simulator::create(
        channel,
        parameters.clone(),
        &configuration,
        None,
        cli.random_seed,
    )?;
    let mut out = initialize_output_stream(&cli, &parameters, &configuration)?;

    let save_cycles = if duration > 0.0 {
        (duration / cli.save_rate).ceil() as u64
    } else {
        0
    };
    let integration_cycles = (cli.save_rate / parameters.time_step).ceil() as u64;
    info!(
        "simulating {} cycles of length {:.3e} mcs ({} integrations)",
        if save_cycles > 0 {
            save_cycles.to_string()
        } else {
            "oo".to_string()
        },
        cli.save_rate * 1e6,
        integration_cycles
    );

    let mut save_i = 0u64;
    loop {
        save_i += 1;
        if save_cycles > 0 && save_i > save_cycles {
            break;
        }
        sim.simulate(integration_cycles, cli.max_c_integrations)?;
        if save_cycles > 0 {
            info!("saving cycle {save_i} of {save_cycles}");
        } else {
            info!("saving cycle {save_i}");
        }
        let entry = if cli.thread_dump {
            TrajectoryEntry::ThreadDump(sim.state()?)
        } else {
            TrajectoryEntry::Configuration(sim.configuration()?)
        };
        out.write(&entry)?;
        out.flush()?;
    }

    sim.shutdown();
    Ok(())
}

/// Loads the run's parameters and starting configuration: from a TOML
/// parameters file (fresh start), from `--init-file`, or from the output
/// trajectory itself.
fn load_initial_state(cli: &Cli) -> Result<(Parameters, Configuration), Box<dyn Error>> {
    if let Some(params_file) = &cli.params_file {
        let text = std::fs::read_to_string(params_file)?;
        let parameters: Parameters = toml::from_str(&text)?;
        let n = cli.num_particles.unwrap_or(0);
        let configuration = Configuration::cubic_lattice(n, &parameters.box_vec());
        return Ok((parameters, configuration));
    }
    if let Some(init_file) = &cli.init_file {
        return Ok(io::load_initial_state(init_file)?);
    }
    if cli.outfile == "-" {
        return Err("no initial configuration file and output is a pipe".into());
    }
    Ok(io::load_initial_state(Path::new(&cli.outfile))?)
}

/// Opens the output stream. A fresh or clobbered file starts with the
/// Parameters header and the initial configuration; appending requires the
/// existing file to pass an integrity scan.
fn initialize_output_stream(
    cli: &Cli,
    parameters: &Parameters,
    configuration: &Configuration,
) -> Result<TrajectoryWriter, Box<dyn Error>> {
    if cli.outfile == "-" {
        let mut out = TrajectoryWriter::stdout();
        out.write(&TrajectoryEntry::Parameters(parameters.clone()))?;
        out.write(&TrajectoryEntry::Configuration(configuration.clone()))?;
        return Ok(out);
    }

    let path = Path::new(&cli.outfile);
    if cli.clobber || !path.exists() {
        let mut out = TrajectoryWriter::create(path)?;
        out.write(&TrajectoryEntry::Parameters(parameters.clone()))?;
        out.write(&TrajectoryEntry::Configuration(configuration.clone()))?;
        out.flush()?;
        return Ok(out);
    }

    // don't append to a file unless it is known to be free of defects
    if let Some(init_file) = &cli.init_file {
        let same = std::fs::canonicalize(init_file).ok() == std::fs::canonicalize(path).ok();
        if !same {
            warn!("appending to a different file than the initialization file");
        }
    }
    Ok(TrajectoryWriter::append(path)?)
}

/// Spawns the worker process, directly or through the configured launcher.
fn create_channel(cli: &Cli) -> Result<WorkerChannel, Box<dyn Error>> {
    let worker = match &cli.worker {
        Some(path) => path.clone(),
        None => default_worker_path()?,
    };
    let channel = match &cli.mpirun {
        Some(launcher) => {
            WorkerChannel::spawn_with_launcher(launcher, &cli.mpiargs, &worker, cli.nproc)?
        }
        None if !cli.mpiargs.is_empty() => {
            return Err("--mpi arguments require --mpirun".into());
        }
        None => WorkerChannel::spawn(&worker, cli.nproc)?,
    };
    Ok(channel)
}

fn default_worker_path() -> Result<PathBuf, Box<dyn Error>> {
    let mut path = std::env::current_exe()?;
    path.set_file_name("bd-worker");
    Ok(path)
}
