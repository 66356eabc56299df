//! Compute-plane communication between worker ranks.
//!
//! During a simulation burst the workers exchange ghost positions and
//! migrating particles directly with each other, conceptually MPI
//! point-to-point traffic. Inside the worker process the ranks live on
//! threads, and the plane is a full mesh of tagged mpsc channels: one
//! dedicated channel per ordered rank pair, so a receive from a given peer
//! can never observe another peer's traffic. Message tags are asserted on
//! every receive, which together with the master's communication schedule
//! keeps the rounds deadlock-free.

use super::WorkerError;
use crate::vector::Vec3;
use std::sync::mpsc::{channel, Receiver, Sender};

/// Tag reserved for control traffic (burst broadcasts from rank 0);
/// scheduled exchange tags start at 1.
pub const CONTROL_TAG: i64 = 0;

/// A particle changing owners: its position and its stable tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Migrant {
    pub position: Vec3,
    pub tag: i64,
}

/// Payload of a compute-plane message.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaneMsg {
    /// Rank 0 instructs a slave loop to run this many integration cycles.
    Burst(i64),
    /// Particles leaving the sender's extent for the receiver's.
    Migrants(Vec<Migrant>),
    /// Ghost copies of the sender's particles near the shared junction.
    Ghosts(Vec<Vec3>),
}

/// A tagged compute-plane message.
#[derive(Debug)]
pub struct Tagged {
    pub tag: i64,
    pub msg: PlaneMsg,
}

/// One rank's endpoints into the mesh: a sender toward every rank and a
/// receiver from every rank (the self slots exist but stay silent).
pub struct PlaneLinks {
    pub rank: usize,
    senders: Vec<Sender<Tagged>>,
    receivers: Vec<Receiver<Tagged>>,
}

impl PlaneLinks {
    /// Sends a tagged message to `peer`.
    pub fn send_to(&self, peer: usize, tag: i64, msg: PlaneMsg) -> Result<(), WorkerError> {
        self.senders[peer]
            .send(Tagged { tag, msg })
            .map_err(|_| WorkerError::PeerDisconnected(peer))
    }

    /// Receives the next message from `peer`, asserting its tag.
    pub fn recv_from(&self, peer: usize, expected_tag: i64) -> Result<PlaneMsg, WorkerError> {
        let tagged = self.receivers[peer]
            .recv()
            .map_err(|_| WorkerError::PeerDisconnected(peer))?;
        if tagged.tag != expected_tag {
            return Err(WorkerError::TagMismatch {
                peer,
                expected: expected_tag,
                got: tagged.tag,
            });
        }
        Ok(tagged.msg)
    }
}

/// Builds the full channel mesh for `n` ranks.
pub fn build_mesh(n: usize) -> Vec<PlaneLinks> {
    let mut senders: Vec<Vec<Sender<Tagged>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
    let mut receivers: Vec<Vec<Receiver<Tagged>>> =
        (0..n).map(|_| Vec::with_capacity(n)).collect();
    for src in 0..n {
        for dst in 0..n {
            let (tx, rx) = channel();
            senders[src].push(tx);
            receivers[dst].push(rx);
        }
    }
    // receivers[dst] was filled in src order, so receivers[dst][src] pairs
    // with senders[src][dst]
    senders
        .into_iter()
        .zip(receivers)
        .enumerate()
        .map(|(rank, (s, r))| PlaneLinks {
            rank,
            senders: s,
            receivers: r,
        })
        .collect()
}
