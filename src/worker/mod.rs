//! # Worker Module - Distributed Integration Runtime
//!
//! The `bd-worker` process hosts the compute side of the simulation: one
//! rank per cell of the domain decomposition. The main thread runs the
//! command router, which reads `(rank, length, bytes)` frames from the
//! master's FIFO and forwards each message to the addressed rank's mailbox;
//! the compute ranks live on their own threads and exchange ghost particles
//! and migrants directly over the compute-plane mesh in [`comm`].
//!
//! Two meta-commands are handled by the router itself on behalf of rank 0:
//! `send_msg` posts a submessage into a slave's mailbox without waiting for
//! the reply, and `recv_msg` awaits that reply. The master uses the pair to
//! overlap long slave operations (simulation bursts) with its own rank-0
//! command, which is how the whole ensemble integrates concurrently over a
//! single synchronous FIFO protocol.

// Compute-plane channel mesh between ranks
pub mod comm;
// Per-rank worker state and command dispatch
pub mod cell;
// Force evaluation, integration, and scheduled exchange
pub mod logic;
// Unit tests
pub mod tests;

use crate::vector::Vec3;
use crate::wire::{ReadMessage, WireError};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use thiserror::Error;

/// Errors terminating the worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("i/o failure on command fifo: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] WireError),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("command {0:?} requires rank {1}")]
    WrongRank(&'static str, usize),

    #[error("{0} arrived before system initialization")]
    Uninitialized(&'static str),

    #[error("invalid rank {0}")]
    BadRank(i64),

    #[error("invalid comm instruction {0}")]
    BadInstruction(i64),

    #[error("comm index {0} out of range")]
    BadCommIndex(i64),

    #[error("message from rank {peer} carries tag {got}; expected {expected}")]
    TagMismatch {
        peer: usize,
        expected: i64,
        got: i64,
    },

    #[error("unexpected compute-plane message from rank {0}")]
    UnexpectedPlaneMessage(usize),

    #[error("compute-plane peer {0} disconnected")]
    PeerDisconnected(usize),

    #[error("worker thread for rank {0} terminated")]
    WorkerDied(usize),

    #[error("no reply pending for rank {0}")]
    NoPendingReply(i64),

    #[error("rank {rank} lost particle {tag} at {position}; it crossed more than one cell")]
    ParticleEscaped {
        rank: usize,
        tag: i64,
        position: Vec3,
    },
}

/// A command routed to a compute rank, with the channel its reply bytes
/// travel back on.
pub(crate) struct Request {
    pub bytes: Vec<u8>,
    pub reply: mpsc::Sender<Vec<u8>>,
}

/// Runs the worker process: spawns the compute ranks and routes framed
/// commands between the master's FIFOs and their mailboxes until the master
/// sends `exit` (or hangs up).
pub fn run_worker(
    command_fifo: &Path,
    reply_fifo: &Path,
    n_threads: usize,
) -> Result<(), WorkerError> {
    if n_threads == 0 {
        return Err(WorkerError::BadRank(0));
    }
    // opening blocks until the master holds the opposite ends
    let mut requests = File::open(command_fifo)?;
    let mut replies = File::options().write(true).open(reply_fifo)?;
    log::debug!("worker process up with {n_threads} ranks");

    let mut mailboxes = Vec::with_capacity(n_threads);
    let mut threads = Vec::with_capacity(n_threads);
    for links in comm::build_mesh(n_threads) {
        let rank = links.rank;
        let (tx, rx) = mpsc::channel::<Request>();
        mailboxes.push(tx);
        let handle = thread::Builder::new()
            .name(format!("bd-rank{rank}"))
            .spawn(move || cell::worker_thread(rank, n_threads, rx, links))?;
        threads.push(handle);
    }

    let result = route_commands(&mut requests, &mut replies, &mailboxes, n_threads);

    // closing the mailboxes releases any rank still waiting for commands
    drop(mailboxes);
    for handle in threads {
        let _ = handle.join();
    }
    result
}

fn route_commands(
    requests: &mut File,
    replies: &mut File,
    mailboxes: &[mpsc::Sender<Request>],
    n_threads: usize,
) -> Result<(), WorkerError> {
    let mut pending: Vec<Option<mpsc::Receiver<Vec<u8>>>> =
        (0..n_threads).map(|_| None).collect();
    loop {
        let mut head = [0u8; 4];
        match requests.read_exact(&mut head) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                log::info!("master closed the command fifo");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        let rank = u32::from_be_bytes(head) as usize;
        let mut len_buf = [0u8; 4];
        requests.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut bytes = vec![0u8; len];
        requests.read_exact(&mut bytes)?;

        if rank >= mailboxes.len() {
            return Err(WorkerError::BadRank(rank as i64));
        }
        let (reply, exiting) = if rank == 0 {
            dispatch_rank0(bytes, mailboxes, &mut pending)?
        } else {
            (forward(mailboxes, rank, bytes)?, false)
        };
        replies.write_all(&(reply.len() as u32).to_be_bytes())?;
        replies.write_all(&reply)?;
        replies.flush()?;
        if exiting {
            return Ok(());
        }
    }
}

/// Handles a rank-0 frame: the two routing meta-commands are served here,
/// everything else goes to the rank-0 compute thread. The boolean marks the
/// final `exit` so the router stops after replying.
fn dispatch_rank0(
    bytes: Vec<u8>,
    mailboxes: &[mpsc::Sender<Request>],
    pending: &mut [Option<mpsc::Receiver<Vec<u8>>>],
) -> Result<(Vec<u8>, bool), WorkerError> {
    let mut peek = ReadMessage::new(bytes.clone());
    let command = peek.read_char_array()?;
    match command.as_str() {
        "send_msg" => {
            let target = peek.read_int()?;
            let submsg = peek.read_byte_array()?;
            peek.require_end()?;
            let slave = check_slave_rank(target, mailboxes.len())?;
            let (tx, rx) = mpsc::channel();
            mailboxes[slave]
                .send(Request {
                    bytes: submsg,
                    reply: tx,
                })
                .map_err(|_| WorkerError::WorkerDied(slave))?;
            if pending[slave].replace(rx).is_some() {
                log::warn!("discarding an unread reply from rank {slave}");
            }
            Ok((Vec::new(), false))
        }
        "recv_msg" => {
            let target = peek.read_int()?;
            peek.require_end()?;
            let slave = check_slave_rank(target, mailboxes.len())?;
            let rx = pending[slave]
                .take()
                .ok_or(WorkerError::NoPendingReply(target))?;
            let reply = rx.recv().map_err(|_| WorkerError::WorkerDied(slave))?;
            Ok((reply, false))
        }
        "exit" => Ok((forward(mailboxes, 0, bytes)?, true)),
        _ => Ok((forward(mailboxes, 0, bytes)?, false)),
    }
}

fn check_slave_rank(rank: i64, n_threads: usize) -> Result<usize, WorkerError> {
    match usize::try_from(rank) {
        Ok(r) if r > 0 && r < n_threads => Ok(r),
        _ => Err(WorkerError::BadRank(rank)),
    }
}

/// Forwards a command to a rank's mailbox and awaits the reply bytes. A
/// dropped reply channel means the rank's thread died on an error; the
/// router then brings the whole process down so the master can observe the
/// early exit.
fn forward(
    mailboxes: &[mpsc::Sender<Request>],
    rank: usize,
    bytes: Vec<u8>,
) -> Result<Vec<u8>, WorkerError> {
    let (tx, rx) = mpsc::channel();
    mailboxes[rank]
        .send(Request { bytes, reply: tx })
        .map_err(|_| WorkerError::WorkerDied(rank))?;
    rx.recv().map_err(|_| WorkerError::WorkerDied(rank))
}
