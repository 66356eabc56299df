//! Worker-process entry point.
//!
//! The master spawns this binary (directly or through a launcher) with the
//! two FIFO paths of the command channel; all further configuration arrives
//! over the wire protocol.

use brownian_lib::worker;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Brownian Dynamics simulation worker process")]
struct WorkerCli {
    /// FIFO carrying framed commands from the master
    command_fifo: PathBuf,

    /// FIFO carrying framed replies back to the master
    reply_fifo: PathBuf,

    /// Number of compute threads (worker ranks)
    #[arg(long, value_name = "N", default_value_t = 1)]
    threads: usize,
}

fn main() {
    env_logger::init();
    let cli = WorkerCli::parse();
    if let Err(err) = worker::run_worker(&cli.command_fifo, &cli.reply_fifo, cli.threads) {
        eprintln!("bd-worker: {err}");
        std::process::exit(1);
    }
}
