//! # IO Module - Trajectory Stream Persistence
//!
//! A trajectory is a sequence of length-framed bincode records: element [0]
//! is the run's [`Parameters`] and every later element is a
//! [`Configuration`] snapshot (or a [`SimulationState`] thread dump when
//! the front-end runs with `--thread-dump`).
//!
//! Appending to an existing trajectory requires a prior integrity scan of
//! the whole file; a truncated or undecodable record makes the file
//! corrupt, and the tool refuses to append rather than risk compounding
//! the damage. Standard streams can be written but never appended to.


use crate::state::{Configuration, Parameters, SimulationState};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Upper bound on a single record, guarding length-prefix corruption from
/// triggering absurd allocations.
const MAX_RECORD_BYTES: u64 = 1 << 30;

/// Errors raised by the trajectory stream.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    #[error("trajectory i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("trajectory encoding failure: {0}")]
    Encode(#[from] bincode::Error),

    #[error("corrupt trajectory at byte {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("trajectory is empty")]
    Empty,

    #[error("first trajectory entry must be Parameters")]
    BadLeadingEntry,

    #[error("last trajectory entry must be a Configuration")]
    BadFinalEntry,

    #[error("can't append to a standard stream")]
    StdStreamAppend,
}

/// One persisted element of a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrajectoryEntry {
    Parameters(Parameters),
    Configuration(Configuration),
    ThreadDump(SimulationState),
}

/// Writes length-framed trajectory entries to a file or standard output.
pub struct TrajectoryWriter {
    out: BufWriter<Box<dyn Write + Send>>,
}

impl TrajectoryWriter {
    /// Creates (or truncates) a trajectory file.
    pub fn create(path: &Path) -> Result<Self, TrajectoryError> {
        let file = File::create(path)?;
        Ok(TrajectoryWriter {
            out: BufWriter::new(Box::new(file)),
        })
    }

    /// Opens a trajectory for appending after verifying its integrity.
    pub fn append(path: &Path) -> Result<Self, TrajectoryError> {
        verify_integrity(path)?;
        let file = File::options().append(true).open(path)?;
        Ok(TrajectoryWriter {
            out: BufWriter::new(Box::new(file)),
        })
    }

    /// Streams entries to standard output.
    pub fn stdout() -> Self {
        TrajectoryWriter {
            out: BufWriter::new(Box::new(std::io::stdout())),
        }
    }

    /// Appends one entry.
    pub fn write(&mut self, entry: &TrajectoryEntry) -> Result<(), TrajectoryError> {
        let bytes = bincode::serialize(entry)?;
        self.out.write_all(&(bytes.len() as u64).to_le_bytes())?;
        self.out.write_all(&bytes)?;
        Ok(())
    }

    /// Flushes buffered records to the underlying stream.
    pub fn flush(&mut self) -> Result<(), TrajectoryError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Reads length-framed trajectory entries from a file.
pub struct TrajectoryReader {
    input: BufReader<File>,
    offset: u64,
}

impl TrajectoryReader {
    pub fn open(path: &Path) -> Result<Self, TrajectoryError> {
        Ok(TrajectoryReader {
            input: BufReader::new(File::open(path)?),
            offset: 0,
        })
    }

    /// Reads the next entry; `None` at a clean end of file. A partial
    /// frame or an undecodable record is corruption, reported with the
    /// byte offset of the failing record.
    pub fn read_entry(&mut self) -> Result<Option<TrajectoryEntry>, TrajectoryError> {
        let record_start = self.offset;
        let mut len_buf = [0u8; 8];
        match self.input.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let len = u64::from_le_bytes(len_buf);
        if len > MAX_RECORD_BYTES {
            return Err(TrajectoryError::Corrupt {
                offset: record_start,
                reason: format!("record length {len} exceeds the sanity bound"),
            });
        }
        let mut bytes = vec![0u8; len as usize];
        self.input.read_exact(&mut bytes).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                TrajectoryError::Corrupt {
                    offset: record_start,
                    reason: "truncated record".to_string(),
                }
            } else {
                TrajectoryError::Io(err)
            }
        })?;
        let entry = bincode::deserialize(&bytes).map_err(|err| TrajectoryError::Corrupt {
            offset: record_start,
            reason: err.to_string(),
        })?;
        self.offset += 8 + len;
        Ok(Some(entry))
    }

    /// Reads every remaining entry.
    pub fn read_all(&mut self) -> Result<Vec<TrajectoryEntry>, TrajectoryError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.read_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Scans a trajectory end to end, returning the entry count. Any framing
/// or decoding failure makes the file unfit for appending.
pub fn verify_integrity(path: &Path) -> Result<usize, TrajectoryError> {
    let mut reader = TrajectoryReader::open(path)?;
    let mut count = 0;
    while reader.read_entry()?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Loads the initial state for a run: the leading [`Parameters`] and the
/// final [`Configuration`] of an existing trajectory.
pub fn load_initial_state(path: &Path) -> Result<(Parameters, Configuration), TrajectoryError> {
    let mut reader = TrajectoryReader::open(path)?;
    let entries = reader.read_all()?;
    let mut iter = entries.into_iter();
    let parameters = match iter.next() {
        Some(TrajectoryEntry::Parameters(parameters)) => parameters,
        Some(_) => return Err(TrajectoryError::BadLeadingEntry),
        None => return Err(TrajectoryError::Empty),
    };
    let configuration = match iter.last() {
        Some(TrajectoryEntry::Configuration(configuration)) => configuration,
        Some(_) => return Err(TrajectoryError::BadFinalEntry),
        None => return Err(TrajectoryError::BadFinalEntry),
    };
    Ok((parameters, configuration))
}
