//! # Channel Module - Master/Worker Command Channel
//!
//! Duplex byte stream between the master process and the spawned worker
//! process, carried over a pair of named FIFOs in a scratch directory. The
//! worker is launched as a child process, optionally wrapped by a launcher
//! program (the `--mpirun` path), and receives the two FIFO paths as its
//! arguments.
//!
//! Every request is framed as `uint rank, uint length, bytes`; every reply
//! as `uint length, bytes`. Rank 0 addresses the master-local worker, which
//! also routes the two meta-commands `send_msg`/`recv_msg` used to overlap a
//! long slave operation (a simulation burst) with further master traffic.
//!
//! The channel owns the scratch directory and the child handle; both are
//! released on destruction along every exit path. Shutdown escalates through
//! a polite `exit` command, SIGTERM, and finally SIGKILL.

// Exercising this module requires the compiled worker binary; the coverage
// lives in tests/simulation_test.rs.

use crate::wire::{ReadMessage, WireError, WriteMessage};
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;

/// How long to wait for the worker to open its end of the FIFOs.
const FIFO_OPEN_TIMEOUT: Duration = Duration::from_secs(200);

/// Errors raised on the command channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("i/o failure on command channel: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] WireError),

    #[error("worker process exited early with code {code:?}")]
    ExitedEarly { code: Option<i32> },

    #[error("timed out opening command fifos after {0:?}")]
    OpenTimeout(Duration),

    #[error("need {need} slave messages; given {given}")]
    WrongMessageCount { need: usize, given: usize },
}

/// Interface to the worker process for parallel Brownian Dynamics
/// simulation.
pub struct WorkerChannel {
    child: Child,
    write_fifo: File,
    read_fifo: File,
    // owns the fifo files; removed recursively when the channel drops
    _scratch: TempDir,
    size: Option<u32>,
    active: bool,
    shutting_down: bool,
}

impl WorkerChannel {
    /// Spawns the worker binary directly with `nproc` compute threads.
    pub fn spawn(worker: &Path, nproc: u32) -> Result<Self, ChannelError> {
        let mut cmd = Command::new(worker);
        cmd.arg("--threads").arg(nproc.to_string());
        Self::spawn_command(cmd)
    }

    /// Spawns the worker wrapped by a launcher program, passing the
    /// launcher's own arguments through first.
    pub fn spawn_with_launcher(
        launcher: &Path,
        launcher_args: &[String],
        worker: &Path,
        nproc: u32,
    ) -> Result<Self, ChannelError> {
        let mut cmd = Command::new(launcher);
        cmd.args(launcher_args)
            .arg(worker)
            .arg("--threads")
            .arg(nproc.to_string());
        Self::spawn_command(cmd)
    }

    fn spawn_command(mut cmd: Command) -> Result<Self, ChannelError> {
        let scratch = make_scratch_dir()?;
        let write_path = scratch.path().join("master2worker-fifo");
        let read_path = scratch.path().join("worker2master-fifo");
        mkfifo(&write_path)?;
        mkfifo(&read_path)?;

        cmd.arg(&write_path).arg(&read_path);
        log::debug!("launching worker process: {cmd:?}");
        let mut child = cmd.spawn()?;

        match open_fifos(&write_path, &read_path) {
            Ok((write_fifo, read_fifo)) => Ok(WorkerChannel {
                child,
                write_fifo,
                read_fifo,
                _scratch: scratch,
                size: None,
                active: true,
                shutting_down: false,
            }),
            Err(err) => {
                force_child_exit(&mut child);
                Err(err)
            }
        }
    }

    /// Retrieves (and caches) the number of workers composing the
    /// simulation.
    pub fn size(&mut self) -> Result<u32, ChannelError> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let mut reply = self.perform_command(0, &WriteMessage::command("poll_size"))?;
        let size = reply.read_uint()?;
        reply.require_end()?;
        self.size = Some(size);
        Ok(size)
    }

    /// Sends a message to the worker of the given rank and awaits its reply.
    pub fn perform_command(
        &mut self,
        rank: u32,
        msg: &WriteMessage,
    ) -> Result<ReadMessage, ChannelError> {
        self.require_active()?;
        self.do_command(rank, msg.as_bytes())
    }

    /// Maps a sequence of messages across the slave ranks (1..N) and
    /// collects the replies, synchronously one rank at a time.
    pub fn map_slave(&mut self, msgs: &[WriteMessage]) -> Result<Vec<ReadMessage>, ChannelError> {
        self.check_slave_count(msgs)?;
        let mut replies = Vec::with_capacity(msgs.len());
        for (rank, msg) in msgs.iter().enumerate() {
            replies.push(self.perform_command(rank as u32 + 1, msg)?);
        }
        Ok(replies)
    }

    /// Sends the same message to every slave rank.
    pub fn on_each_slave(&mut self, msg: &WriteMessage) -> Result<Vec<ReadMessage>, ChannelError> {
        let n = self.size()? as usize - 1;
        self.map_slave(&vec![msg.clone(); n])
    }

    /// Maps one message per rank (0..N) and collects the replies.
    pub fn map_all(&mut self, msgs: &[WriteMessage]) -> Result<Vec<ReadMessage>, ChannelError> {
        self.require_active()?;
        let first = self.perform_command(0, &msgs[0])?;
        let mut replies = vec![first];
        replies.extend(self.map_slave(&msgs[1..])?);
        Ok(replies)
    }

    /// Sends the same message to every rank.
    pub fn on_each(&mut self, msg: &WriteMessage) -> Result<Vec<ReadMessage>, ChannelError> {
        let n = self.size()? as usize;
        self.map_all(&vec![msg.clone(); n])
    }

    /// Posts one message per slave through the rank-0 `send_msg`
    /// meta-command, then awaits all replies. The slaves process their
    /// messages concurrently while rank 0 stays responsive.
    pub fn map_slave_async(
        &mut self,
        msgs: &[WriteMessage],
    ) -> Result<Vec<ReadMessage>, ChannelError> {
        self.require_active()?;
        self.map_slave_async_send(msgs)?;
        self.map_slave_async_recv()
    }

    /// Posts the same message to every slave asynchronously.
    pub fn on_each_slave_async(
        &mut self,
        msg: &WriteMessage,
    ) -> Result<Vec<ReadMessage>, ChannelError> {
        let n = self.size()? as usize - 1;
        self.map_slave_async(&vec![msg.clone(); n])
    }

    /// Asynchronous fan-out across every rank: slave messages are posted
    /// first, rank 0 executes its message synchronously, then the slave
    /// replies are collected. This is how a simulation burst overlaps rank
    /// 0's own integration with the slaves'.
    pub fn map_all_async(
        &mut self,
        msgs: &[WriteMessage],
    ) -> Result<Vec<ReadMessage>, ChannelError> {
        self.require_active()?;
        self.map_slave_async_send(&msgs[1..])?;
        let first = self.do_command(0, msgs[0].as_bytes())?;
        let mut replies = vec![first];
        replies.extend(self.map_slave_async_recv()?);
        Ok(replies)
    }

    /// Sends the same message to every rank asynchronously.
    pub fn on_each_async(&mut self, msg: &WriteMessage) -> Result<Vec<ReadMessage>, ChannelError> {
        let n = self.size()? as usize;
        self.map_all_async(&vec![msg.clone(); n])
    }

    /// Shuts the worker process down: `exit` to every slave, then to rank
    /// 0, escalating to SIGTERM and SIGKILL if the process lingers.
    pub fn shutdown(&mut self) {
        if !self.check_active() || self.shutting_down {
            return;
        }
        self.shutting_down = true;
        let exit = WriteMessage::command("exit");
        let polite = self
            .on_each_slave_async(&exit)
            .and_then(|_| self.do_command(0, exit.as_bytes()));
        if let Err(err) = polite {
            log::warn!("polite worker shutdown failed: {err}");
        }
        self.active = false;
        force_child_exit(&mut self.child);
    }

    // -- internals --

    fn do_command(&mut self, rank: u32, bytes: &[u8]) -> Result<ReadMessage, ChannelError> {
        let result = self.do_command_io(rank, bytes);
        if result.is_err() && !self.check_active() {
            return Err(self.exited_early());
        }
        result
    }

    fn do_command_io(&mut self, rank: u32, bytes: &[u8]) -> Result<ReadMessage, ChannelError> {
        self.write_fifo.write_all(&rank.to_be_bytes())?;
        self.write_fifo.write_all(&(bytes.len() as u32).to_be_bytes())?;
        self.write_fifo.write_all(bytes)?;
        self.write_fifo.flush()?;

        let mut len_buf = [0u8; 4];
        self.read_fifo.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut reply = vec![0u8; len];
        self.read_fifo.read_exact(&mut reply)?;
        Ok(ReadMessage::new(reply))
    }

    /// Posts one message per slave without awaiting the replies; pair with
    /// [`WorkerChannel::map_slave_async_recv`]. Used directly when rank 0
    /// must act between the post and the collection.
    pub fn map_slave_async_send(&mut self, msgs: &[WriteMessage]) -> Result<(), ChannelError> {
        self.check_slave_count(msgs)?;
        for (i, msg) in msgs.iter().enumerate() {
            let rank = i as i64 + 1;
            let mut post = WriteMessage::command("send_msg");
            post.write_int(rank).write_submsg(msg);
            let reply = self.do_command(0, post.as_bytes())?;
            reply.require_end()?;
        }
        Ok(())
    }

    /// Awaits the replies to previously posted slave messages, in rank
    /// order.
    pub fn map_slave_async_recv(&mut self) -> Result<Vec<ReadMessage>, ChannelError> {
        let size = self.size()?;
        let mut replies = Vec::with_capacity(size as usize - 1);
        for rank in 1..size {
            let mut fetch = WriteMessage::command("recv_msg");
            fetch.write_int(rank as i64);
            replies.push(self.do_command(0, fetch.as_bytes())?);
        }
        Ok(replies)
    }

    fn check_slave_count(&mut self, msgs: &[WriteMessage]) -> Result<(), ChannelError> {
        let need = self.size()? as usize - 1;
        if msgs.len() != need {
            return Err(ChannelError::WrongMessageCount {
                need,
                given: msgs.len(),
            });
        }
        Ok(())
    }

    fn check_active(&mut self) -> bool {
        if self.active {
            self.active = matches!(self.child.try_wait(), Ok(None));
        }
        self.active
    }

    fn require_active(&mut self) -> Result<(), ChannelError> {
        if self.check_active() {
            Ok(())
        } else {
            Err(self.exited_early())
        }
    }

    fn exited_early(&mut self) -> ChannelError {
        let code = self
            .child
            .try_wait()
            .ok()
            .flatten()
            .and_then(|status| status.code());
        ChannelError::ExitedEarly { code }
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Creates the scratch directory holding the FIFOs, named from the user and
/// process id the way shared cluster filesystems expect.
fn make_scratch_dir() -> Result<TempDir, ChannelError> {
    let user = std::env::var("USER").unwrap_or_else(|_| "nobody".to_string());
    let prefix = format!("{user}P{}-bd-bridge-", std::process::id());
    Ok(tempfile::Builder::new().prefix(&prefix).tempdir()?)
}

fn mkfifo(path: &Path) -> Result<(), ChannelError> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .expect("scratch paths never contain NUL bytes");
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Opens both FIFOs, guarding against a dead child with a timeout.
///
/// Opening a FIFO blocks until the peer end is opened, so a child that died
/// before reaching its open would hang the master forever. The blocking
/// opens run on a helper thread and the result is awaited with a deadline.
fn open_fifos(write_path: &Path, read_path: &Path) -> Result<(File, File), ChannelError> {
    let write_path = PathBuf::from(write_path);
    let read_path = PathBuf::from(read_path);
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = (|| -> std::io::Result<(File, File)> {
            let write_fifo = File::options().write(true).open(&write_path)?;
            let read_fifo = File::open(&read_path)?;
            Ok((write_fifo, read_fifo))
        })();
        // the receiver may have timed out and gone away
        let _ = tx.send(result);
    });
    match rx.recv_timeout(FIFO_OPEN_TIMEOUT) {
        Ok(result) => Ok(result?),
        Err(_) => Err(ChannelError::OpenTimeout(FIFO_OPEN_TIMEOUT)),
    }
}

/// Escalating child termination: brief waits, then SIGTERM, then SIGKILL.
fn force_child_exit(child: &mut Child) {
    let exited = |child: &mut Child| matches!(child.try_wait(), Ok(Some(_)));
    for _ in 0..5 {
        if exited(child) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    for _ in 0..5 {
        if exited(child) {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    let _ = child.kill();
    let _ = child.wait();
}
