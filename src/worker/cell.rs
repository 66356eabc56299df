//! Per-rank worker state and command dispatch.
//!
//! Each compute rank owns one cell of the domain decomposition: its
//! particles (positions plus stable tags), ghost copies received from its
//! neighbors, the neighbor-pair tables, and the junction geometry and
//! communication rules the master derived for its cell. Commands arrive as
//! wire messages through the rank's mailbox; the reply message travels back
//! through the router to the master.

use super::comm::{PlaneLinks, PlaneMsg, CONTROL_TAG};
use super::{Request, WorkerError};
use crate::constants::KB;
use crate::forcefield::Linterp;
use crate::vector::Vec3;
use crate::wire::{ReadMessage, WriteMessage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Thread-independent simulation state broadcast by `initialize_system`.
///
/// Energies are in joules here: the master pre-multiplies the tables and
/// `du_max` by kT before broadcasting.
#[derive(Debug, Clone)]
pub struct SystemParams {
    pub box_size: Vec3,
    pub temperature: f64,
    pub dt: f64,
    pub du_max: f64,
    pub fric_gamma: f64,
    pub force_update: i64,
    pub r_pair_cutoff: f64,
    /// Pair potential table (J).
    pub pair_potential: Linterp,
    /// Pair force table pre-scaled by 1/r (J/m²), so the force vector is
    /// `table(r) * (r_i - r_j)` with no normalization.
    pub pair_force: Linterp,
    pub r_neighbor: f64,
}

impl SystemParams {
    pub fn kt(&self) -> f64 {
        KB * self.temperature
    }

    /// Diffusion coefficient D = kT/γ.
    pub fn diffusion(&self) -> f64 {
        self.kt() / self.fric_gamma
    }

    /// Displacement budget before neighbor lists must be rebuilt.
    pub fn half_skin(&self) -> f64 {
        0.5 * (self.r_neighbor - self.r_pair_cutoff)
    }
}

/// A neighboring cell as seen from this rank: its slot in the comm tables
/// and its extent, used to route migrating particles.
#[derive(Debug, Clone, Copy)]
pub struct JCell {
    pub comm_index: usize,
    pub min_extent: Vec3,
    pub max_extent: Vec3,
}

impl JCell {
    pub fn contains(&self, p: &Vec3) -> bool {
        (0..3).all(|a| p.axis(a) >= self.min_extent.axis(a) && p.axis(a) < self.max_extent.axis(a))
    }
}

/// One leg of the scheduled exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommInstruction {
    Send,
    Recv,
}

/// A scheduled exchange leg: which junctioned cell, and the message tag.
#[derive(Debug, Clone, Copy)]
pub struct CommRule {
    pub inst: CommInstruction,
    pub comm_index: usize,
    pub tag: i64,
}

/// Junction descriptors, used to select which owned particles to ghost
/// toward each neighbor. Coordinates are in this cell's own frame, so no
/// periodic arithmetic is needed during selection.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceJunction {
    pub comm_index: usize,
    pub axis: usize,
    pub dir: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LineJunction {
    pub comm_index: usize,
    pub axis: usize,
    pub offset1: f64,
    pub offset2: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PointJunction {
    pub comm_index: usize,
    pub offset: Vec3,
}

/// Reference from an owned particle to one interaction partner.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NeighborRef {
    Owned(usize),
    Ghost(usize),
}

/// The reply produced by one command.
#[derive(Debug)]
pub enum Reply {
    Message(WriteMessage),
    /// Final reply; the rank's thread stops after sending it.
    Exit(WriteMessage),
}

/// State of a single compute rank.
pub struct Worker {
    pub(crate) rank: usize,
    pub(crate) size: usize,
    name: String,
    pub(crate) links: PlaneLinks,
    pub(crate) system: Option<Arc<SystemParams>>,
    pub(crate) rng: StdRng,

    // cell state
    pub(crate) min_extent: Vec3,
    pub(crate) max_extent: Vec3,
    pub(crate) positions: Vec<Vec3>,
    pub(crate) tags: Vec<i64>,
    pub(crate) ghosts: Vec<Vec3>,

    // communication topology
    pub(crate) comm_ranks: Vec<usize>,
    pub(crate) comm_rules: Vec<CommRule>,
    pub(crate) jcells: Vec<JCell>,
    pub(crate) surface_junctions: Vec<SurfaceJunction>,
    pub(crate) line_junctions: Vec<LineJunction>,
    pub(crate) point_junctions: Vec<PointJunction>,

    // neighbor bookkeeping
    pub(crate) internal_pairs: Vec<(usize, usize)>,
    pub(crate) external_pairs: Vec<(usize, usize)>,
    pub(crate) adjacency: Vec<Vec<NeighborRef>>,
    pub(crate) rebuild_positions: Vec<Vec3>,
    pub(crate) step_counter: i64,

    /// Largest |ΔU| accepted in any sub-step, for verifying the energy
    /// budget under test.
    #[cfg(test)]
    pub(crate) max_accepted_du: f64,
}

impl Worker {
    pub fn new(rank: usize, size: usize, links: PlaneLinks) -> Self {
        Worker {
            rank,
            size,
            name: format!("rank{rank}"),
            links,
            system: None,
            rng: StdRng::seed_from_u64(rank as u64),
            min_extent: Vec3::zero(),
            max_extent: Vec3::zero(),
            positions: Vec::new(),
            tags: Vec::new(),
            ghosts: Vec::new(),
            comm_ranks: Vec::new(),
            comm_rules: Vec::new(),
            jcells: Vec::new(),
            surface_junctions: Vec::new(),
            line_junctions: Vec::new(),
            point_junctions: Vec::new(),
            internal_pairs: Vec::new(),
            external_pairs: Vec::new(),
            adjacency: Vec::new(),
            rebuild_positions: Vec::new(),
            step_counter: 0,
            #[cfg(test)]
            max_accepted_du: 0.0,
        }
    }

    /// Dispatches one command and produces its reply.
    pub fn handle(&mut self, bytes: &[u8]) -> Result<Reply, WorkerError> {
        let mut msg = ReadMessage::new(bytes.to_vec());
        let command = msg.read_char_array()?;
        let mut reply = WriteMessage::new();
        match command.as_str() {
            "exit" => {
                msg.require_end()?;
                log::debug!("{} exiting", self.name);
                return Ok(Reply::Exit(reply));
            }
            "poll_size" => {
                msg.require_end()?;
                reply.write_uint(self.size as u32);
            }
            "set_thread_name" => {
                self.name = msg.read_char_array()?;
                msg.require_end()?;
                log::debug!("rank {} named {:?}", self.rank, self.name);
            }
            "initialize_system" => self.initialize_system(&mut msg)?,
            "initialize_random" => {
                let seed = msg.read_uint()?;
                msg.require_end()?;
                self.rng = StdRng::seed_from_u64(u64::from(seed));
            }
            "initialize_cell_state" => self.initialize_cell_state(&mut msg)?,
            "initialize_cell_comm" => self.initialize_cell_comm(&mut msg)?,
            "initialize_cell_junctions" => self.initialize_cell_junctions(&mut msg)?,
            "thread_update_neighbors" => {
                msg.require_end()?;
                let sys = self.require_system("thread_update_neighbors")?;
                self.exchange_and_rebuild(&sys)?;
            }
            "collect_thread_positions_and_tags" => {
                msg.require_end()?;
                reply.write_vec_array(&self.positions);
                reply.write_int_array(&self.tags);
            }
            "collect_thread_state" => {
                msg.require_end()?;
                self.collect_state(&mut reply);
            }
            "slave_simulation_loop" => {
                msg.require_end()?;
                self.slave_simulation_loop()?;
            }
            "master_simulate_cycles" => {
                let steps = msg.read_int()?;
                msg.require_end()?;
                self.master_simulate_cycles(steps)?;
            }
            other => return Err(WorkerError::UnknownCommand(other.to_string())),
        }
        Ok(Reply::Message(reply))
    }

    pub(crate) fn require_system(
        &self,
        command: &'static str,
    ) -> Result<Arc<SystemParams>, WorkerError> {
        self.system
            .clone()
            .ok_or(WorkerError::Uninitialized(command))
    }

    fn initialize_system(&mut self, msg: &mut ReadMessage) -> Result<(), WorkerError> {
        msg.expect_field("box_size")?;
        let box_size = msg.read_vec()?;
        msg.expect_field("T")?;
        let temperature = msg.read_double()?;
        msg.expect_field("dt")?;
        let dt = msg.read_double()?;
        msg.expect_field("dU_max")?;
        let du_max = msg.read_double()?;
        msg.expect_field("fric_gamma")?;
        let fric_gamma = msg.read_double()?;
        msg.expect_field("force_update")?;
        let force_update = msg.read_int()?;
        msg.expect_field("r_pair_cutoff")?;
        let r_pair_cutoff = msg.read_double()?;
        msg.expect_field("pair_potential")?;
        let pair_potential = parse_linterp(msg)?;
        msg.expect_field("pair_force")?;
        let pair_force = parse_linterp(msg)?;
        msg.expect_field("r_neighbor")?;
        let r_neighbor = msg.read_double()?;
        msg.require_end()?;

        self.system = Some(Arc::new(SystemParams {
            box_size,
            temperature,
            dt,
            du_max,
            fric_gamma,
            force_update,
            r_pair_cutoff,
            pair_potential,
            pair_force,
            r_neighbor,
        }));
        Ok(())
    }

    fn initialize_cell_state(&mut self, msg: &mut ReadMessage) -> Result<(), WorkerError> {
        msg.expect_field("min_extent")?;
        self.min_extent = msg.read_vec()?;
        msg.expect_field("max_extent")?;
        self.max_extent = msg.read_vec()?;
        msg.expect_field("positions")?;
        self.positions = msg.read_vec_array()?;
        msg.expect_field("tags")?;
        self.tags = msg.read_int_array()?;
        msg.require_end()?;

        self.ghosts.clear();
        self.internal_pairs.clear();
        self.external_pairs.clear();
        self.adjacency.clear();
        self.rebuild_positions = self.positions.clone();
        self.step_counter = 0;
        Ok(())
    }

    fn initialize_cell_comm(&mut self, msg: &mut ReadMessage) -> Result<(), WorkerError> {
        msg.expect_field("comms")?;
        let n_comms = msg.read_uint()?;
        let mut comm_ranks = Vec::with_capacity(n_comms as usize);
        for _ in 0..n_comms {
            msg.expect_field("comm_rank")?;
            let rank = msg.read_int()?;
            comm_ranks.push(check_rank(rank, self.size)?);
        }

        msg.expect_field("comm_rules")?;
        let n_rules = msg.read_uint()?;
        let mut comm_rules = Vec::with_capacity(n_rules as usize);
        for _ in 0..n_rules {
            msg.expect_field("inst")?;
            let inst = match msg.read_int()? {
                1 => CommInstruction::Send,
                2 => CommInstruction::Recv,
                other => return Err(WorkerError::BadInstruction(other)),
            };
            msg.expect_field("comm_index")?;
            let comm_index = check_comm_index(msg.read_int()?, comm_ranks.len())?;
            msg.expect_field("tag")?;
            let tag = msg.read_int()?;
            comm_rules.push(CommRule {
                inst,
                comm_index,
                tag,
            });
        }
        msg.require_end()?;

        self.comm_ranks = comm_ranks;
        self.comm_rules = comm_rules;
        Ok(())
    }

    fn initialize_cell_junctions(&mut self, msg: &mut ReadMessage) -> Result<(), WorkerError> {
        let n_comms = self.comm_ranks.len();

        msg.expect_field("jcells")?;
        let n = msg.read_uint()?;
        let mut jcells = Vec::with_capacity(n as usize);
        for _ in 0..n {
            msg.expect_field("comm_index")?;
            let comm_index = check_comm_index(msg.read_int()?, n_comms)?;
            msg.expect_field("min_extent")?;
            let min_extent = msg.read_vec()?;
            msg.expect_field("max_extent")?;
            let max_extent = msg.read_vec()?;
            jcells.push(JCell {
                comm_index,
                min_extent,
                max_extent,
            });
        }

        msg.expect_field("surface_junctions")?;
        let n = msg.read_uint()?;
        let mut surface_junctions = Vec::with_capacity(n as usize);
        for _ in 0..n {
            msg.expect_field("cell_index")?;
            let comm_index = check_comm_index(msg.read_int()?, n_comms)?;
            msg.expect_field("axis")?;
            let axis = msg.read_int()? as usize;
            msg.expect_field("dir")?;
            let dir = msg.read_int()?;
            surface_junctions.push(SurfaceJunction {
                comm_index,
                axis,
                dir,
            });
        }

        msg.expect_field("line_junctions")?;
        let n = msg.read_uint()?;
        let mut line_junctions = Vec::with_capacity(n as usize);
        for _ in 0..n {
            msg.expect_field("cell_index")?;
            let comm_index = check_comm_index(msg.read_int()?, n_comms)?;
            msg.expect_field("axis")?;
            let axis = msg.read_int()? as usize;
            msg.expect_field("offset1")?;
            let offset1 = msg.read_double()?;
            msg.expect_field("offset2")?;
            let offset2 = msg.read_double()?;
            line_junctions.push(LineJunction {
                comm_index,
                axis,
                offset1,
                offset2,
            });
        }

        msg.expect_field("point_junctions")?;
        let n = msg.read_uint()?;
        let mut point_junctions = Vec::with_capacity(n as usize);
        for _ in 0..n {
            msg.expect_field("cell_index")?;
            let comm_index = check_comm_index(msg.read_int()?, n_comms)?;
            msg.expect_field("offset")?;
            let offset = msg.read_vec()?;
            point_junctions.push(PointJunction { comm_index, offset });
        }
        msg.require_end()?;

        self.jcells = jcells;
        self.surface_junctions = surface_junctions;
        self.line_junctions = line_junctions;
        self.point_junctions = point_junctions;
        Ok(())
    }

    fn collect_state(&self, reply: &mut WriteMessage) {
        let mut all_positions = self.positions.clone();
        all_positions.extend_from_slice(&self.ghosts);
        reply.write_vec_array(&all_positions);
        reply.write_int_array(&self.tags);

        let internal: Vec<i64> = self
            .internal_pairs
            .iter()
            .flat_map(|&(i, j)| [i as i64, j as i64])
            .collect();
        reply.write_int_array(&internal);

        // ghost endpoints index past the owned particles
        let n_owned = self.positions.len() as i64;
        let external: Vec<i64> = self
            .external_pairs
            .iter()
            .flat_map(|&(i, g)| [i as i64, n_owned + g as i64])
            .collect();
        reply.write_int_array(&external);
    }

    /// Slave side of a simulation burst: wait for rank 0 to broadcast the
    /// cycle count, integrate, and only then reply to the master.
    fn slave_simulation_loop(&mut self) -> Result<(), WorkerError> {
        if self.rank == 0 {
            return Err(WorkerError::WrongRank("slave_simulation_loop", 1));
        }
        match self.links.recv_from(0, CONTROL_TAG)? {
            PlaneMsg::Burst(steps) => self.run_steps(steps),
            _ => Err(WorkerError::UnexpectedPlaneMessage(0)),
        }
    }

    /// Rank-0 side of a simulation burst: broadcast the cycle count to
    /// every slave loop, then integrate this rank's own cell.
    fn master_simulate_cycles(&mut self, steps: i64) -> Result<(), WorkerError> {
        if self.rank != 0 {
            return Err(WorkerError::WrongRank("master_simulate_cycles", 0));
        }
        for rank in 1..self.size {
            self.links
                .send_to(rank, CONTROL_TAG, PlaneMsg::Burst(steps))?;
        }
        self.run_steps(steps)
    }
}

fn parse_linterp(msg: &mut ReadMessage) -> Result<Linterp, WorkerError> {
    msg.expect_field("x_min")?;
    let x_min = msg.read_double()?;
    msg.expect_field("x_prec")?;
    let x_prec = msg.read_double()?;
    msg.expect_field("table")?;
    let table = msg.read_double_array()?;
    Ok(Linterp {
        x_min,
        x_prec,
        table,
    })
}

fn check_rank(rank: i64, size: usize) -> Result<usize, WorkerError> {
    match usize::try_from(rank) {
        Ok(r) if r < size => Ok(r),
        _ => Err(WorkerError::BadRank(rank)),
    }
}

fn check_comm_index(index: i64, n_comms: usize) -> Result<usize, WorkerError> {
    match usize::try_from(index) {
        Ok(i) if i < n_comms => Ok(i),
        _ => Err(WorkerError::BadCommIndex(index)),
    }
}

/// Thread body for one compute rank: serve commands until `exit` or until
/// the router hangs up. A command failure logs and drops the reply channel,
/// which the router converts into a process-level early exit.
pub(crate) fn worker_thread(rank: usize, size: usize, mailbox: Receiver<Request>, links: PlaneLinks) {
    let mut worker = Worker::new(rank, size, links);
    while let Ok(request) = mailbox.recv() {
        match worker.handle(&request.bytes) {
            Ok(Reply::Message(reply)) => {
                let _ = request.reply.send(reply.into_bytes());
            }
            Ok(Reply::Exit(reply)) => {
                let _ = request.reply.send(reply.into_bytes());
                return;
            }
            Err(err) => {
                log::error!("worker rank {rank} failed: {err}");
                return;
            }
        }
    }
}
