//! Initialization of the worker ensemble.
//!
//! The master partitions the initial configuration into cells, derives the
//! communication schedule, and broadcasts everything through five wire
//! commands: `set_thread_name`, `initialize_system`, `initialize_random`,
//! and the per-rank `initialize_cell_state` / `initialize_cell_comm` /
//! `initialize_cell_junctions` triple. The message builders are plain
//! functions so the exact encodings can be exercised in tests without a
//! channel.

use super::MasterError;
use crate::cells::schedule::{setup_comm_rules, CommInst, CommRule};
use crate::cells::{check_cell_dimensions, divisions, partition_positions, Cell, JunctionGeometry};
use crate::channel::WorkerChannel;
use crate::forcefield::scale_force_table;
use crate::state::{Configuration, Parameters};
use crate::wire::WriteMessage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The partitioned system: cells in rank order, per-cell comm rules, and
/// per-cell junctioned-neighbor orderings (the comm-index spaces).
pub struct CellPlan {
    pub cells: Vec<Cell>,
    pub rules: Vec<Vec<CommRule>>,
    pub junctioned: Vec<Vec<usize>>,
}

/// Partitions positions into `divs` cells and derives the communication
/// schedule.
pub fn plan_cells(
    parameters: &Parameters,
    configuration: &Configuration,
    divs: [usize; 3],
) -> Result<CellPlan, MasterError> {
    let box_size = parameters.box_vec();
    check_cell_dimensions(&box_size, divs, parameters.r_neighbor)?;
    let cells = partition_positions(&box_size, &configuration.positions, divs)?;

    let counts: Vec<usize> = cells.iter().map(|c| c.positions.len()).collect();
    let mean = counts.iter().sum::<usize>() as f64 / counts.len() as f64;
    log::info!(
        "particle distribution min={}, max={}, mean={:.1}",
        counts.iter().min().unwrap(),
        counts.iter().max().unwrap(),
        mean
    );

    let rules = setup_comm_rules(&cells);
    let junctioned = cells
        .iter()
        .map(|cell| {
            let mut neighbors: Vec<usize> = cell.junctions.iter().map(|j| j.neighbor).collect();
            neighbors.sort_unstable();
            neighbors.dedup();
            neighbors
        })
        .collect();
    Ok(CellPlan {
        cells,
        rules,
        junctioned,
    })
}

/// Performs the full initialization fan-out on a fresh channel.
pub fn initialize(
    channel: &mut WorkerChannel,
    parameters: &Parameters,
    configuration: &Configuration,
    divs: Option<[usize; 3]>,
    random_seed: Option<u64>,
) -> Result<(), MasterError> {
    let size = channel.size()? as usize;

    let names: Vec<WriteMessage> = (0..size).map(thread_name_message).collect();
    for reply in channel.map_all_async(&names)? {
        reply.require_end()?;
    }

    for reply in channel.on_each_async(&system_message(parameters))? {
        reply.require_end()?;
    }

    initialize_random(channel, size, random_seed)?;

    let divs = match divs {
        Some(divs) => divs,
        None => divisions(size)?,
    };
    let n_threads = divs[0] * divs[1] * divs[2];
    if n_threads != size {
        return Err(MasterError::BadThreadCount {
            threads: n_threads,
            divisions: divs,
            world: size,
        });
    }
    log::info!("initializing cells for n={n_threads} with dimensions {divs:?}");
    let plan = plan_cells(parameters, configuration, divs)?;

    let states: Vec<WriteMessage> = plan.cells.iter().map(cell_state_message).collect();
    for reply in channel.map_all_async(&states)? {
        reply.require_end()?;
    }
    let comms: Vec<WriteMessage> = (0..size).map(|r| cell_comm_message(&plan, r)).collect();
    for reply in channel.map_all_async(&comms)? {
        reply.require_end()?;
    }
    let junctions: Vec<WriteMessage> = (0..size)
        .map(|r| cell_junctions_message(&plan, r))
        .collect();
    for reply in channel.map_all_async(&junctions)? {
        reply.require_end()?;
    }
    Ok(())
}

/// Seeds every rank's PRNG from a master PRNG, so a single seed reproduces
/// the whole ensemble.
fn initialize_random(
    channel: &mut WorkerChannel,
    size: usize,
    random_seed: Option<u64>,
) -> Result<(), MasterError> {
    let seed = random_seed.unwrap_or_else(|| rand::rng().random());
    log::info!("initializing random state with seed=0x{seed:X}");
    let mut master_rng = StdRng::seed_from_u64(seed);
    let msgs: Vec<WriteMessage> = (0..size)
        .map(|_| random_message(master_rng.random()))
        .collect();
    for reply in channel.map_all_async(&msgs)? {
        reply.require_end()?;
    }
    Ok(())
}

/// `set_thread_name` for one rank: rank 0 is the master, the rest are
/// numbered slaves.
pub fn thread_name_message(rank: usize) -> WriteMessage {
    let mut msg = WriteMessage::command("set_thread_name");
    if rank == 0 {
        msg.write_char_array("master");
    } else {
        msg.write_char_array(&format!("slave{rank}"));
    }
    msg
}

/// `initialize_random` carrying one rank's PRNG seed.
pub fn random_message(seed: u32) -> WriteMessage {
    let mut msg = WriteMessage::command("initialize_random");
    msg.write_uint(seed);
    msg
}

/// `initialize_system`: thread-independent state. Energies convert from kT
/// to joules here, and the force table is pre-scaled by 1/r because the
/// force kernel relies on the table being normalized for vector length.
pub fn system_message(parameters: &Parameters) -> WriteMessage {
    let kt = parameters.kt();
    let r_table_max = parameters.r_potential_cutoff * 1.05;

    let mut potential = parameters.pair_potential.make_potential_table(
        parameters.linterp_r_min,
        r_table_max,
        parameters.linterp_size,
    );
    potential.scale(kt);

    let mut force = parameters.pair_potential.make_force_table(
        parameters.linterp_r_min,
        r_table_max,
        parameters.linterp_size,
    );
    force.scale(kt);
    let force = scale_force_table(force);

    let mut msg = WriteMessage::command("initialize_system");
    // Size of the full ensemble cartesian space
    msg.write_field("box_size");
    msg.write_vec(&parameters.box_vec());
    // Integration constants
    msg.write_field("T");
    msg.write_double(parameters.temperature);
    msg.write_field("dt");
    msg.write_double(parameters.time_step);
    msg.write_field("dU_max");
    msg.write_double(parameters.du_max * kt);
    // friction from the Stokes-Einstein relationship
    msg.write_field("fric_gamma");
    msg.write_double(parameters.friction_gamma());
    // Force field
    msg.write_field("force_update");
    msg.write_int(parameters.force_update_rate);
    msg.write_field("r_pair_cutoff");
    msg.write_double(parameters.r_potential_cutoff);
    msg.write_field("pair_potential");
    write_linterp(&mut msg, &potential);
    msg.write_field("pair_force");
    write_linterp(&mut msg, &force);
    // Neighbor lists
    msg.write_field("r_neighbor");
    msg.write_double(parameters.r_neighbor);
    msg
}

fn write_linterp(msg: &mut WriteMessage, linterp: &crate::forcefield::Linterp) {
    msg.write_field("x_min");
    msg.write_double(linterp.x_min);
    msg.write_field("x_prec");
    msg.write_double(linterp.x_prec);
    msg.write_field("table");
    msg.write_double_array(&linterp.table);
}

/// `initialize_cell_state` for one cell: extent plus owned particles.
pub fn cell_state_message(cell: &Cell) -> WriteMessage {
    let mut msg = WriteMessage::command("initialize_cell_state");
    msg.write_field("min_extent");
    msg.write_vec(&cell.extent.min);
    msg.write_field("max_extent");
    msg.write_vec(&cell.extent.max);
    msg.write_field("positions");
    msg.write_vec_array(&cell.positions);
    msg.write_field("tags");
    msg.write_int_array(&cell.tags);
    msg
}

fn comm_index_of(plan: &CellPlan, rank: usize, neighbor: usize) -> i64 {
    plan.junctioned[rank]
        .iter()
        .position(|&n| n == neighbor)
        .expect("every scheduled peer is a junctioned cell") as i64
}

/// `initialize_cell_comm` for one rank: the junctioned peers (by rank) and
/// the ordered send/recv rules in the peers' comm-index space.
pub fn cell_comm_message(plan: &CellPlan, rank: usize) -> WriteMessage {
    let mut msg = WriteMessage::command("initialize_cell_comm");
    msg.write_field("comms");
    msg.write_struct_array(&plan.junctioned[rank], |m, &jcell| {
        m.write_field("comm_rank");
        m.write_int(jcell as i64);
    });
    msg.write_field("comm_rules");
    msg.write_struct_array(&plan.rules[rank], |m, rule| {
        m.write_field("inst");
        m.write_int(match rule.inst {
            CommInst::Send => 1,
            CommInst::Recv => 2,
        });
        m.write_field("comm_index");
        m.write_int(comm_index_of(plan, rank, rule.peer));
        m.write_field("tag");
        m.write_int(rule.tag);
    });
    msg
}

/// `initialize_cell_junctions` for one rank: neighbor extents plus the
/// surface/line/point junction descriptors in that rank's comm-index
/// space.
pub fn cell_junctions_message(plan: &CellPlan, rank: usize) -> WriteMessage {
    let cell = &plan.cells[rank];
    let mut surfaces = Vec::new();
    let mut lines = Vec::new();
    let mut points = Vec::new();
    for junction in &cell.junctions {
        let comm_index = comm_index_of(plan, rank, junction.neighbor);
        match junction.geometry {
            JunctionGeometry::Surface { axis, dir } => surfaces.push((comm_index, axis, dir)),
            JunctionGeometry::Line {
                axis,
                offset1,
                offset2,
            } => lines.push((comm_index, axis, offset1, offset2)),
            JunctionGeometry::Point { corner } => points.push((comm_index, corner)),
        }
    }

    let mut msg = WriteMessage::command("initialize_cell_junctions");
    msg.write_field("jcells");
    msg.write_struct_array(&plan.junctioned[rank], |m, &jcell| {
        m.write_field("comm_index");
        m.write_int(comm_index_of(plan, rank, jcell));
        m.write_field("min_extent");
        m.write_vec(&plan.cells[jcell].extent.min);
        m.write_field("max_extent");
        m.write_vec(&plan.cells[jcell].extent.max);
    });
    msg.write_field("surface_junctions");
    msg.write_struct_array(&surfaces, |m, &(comm_index, axis, dir)| {
        m.write_field("cell_index");
        m.write_int(comm_index);
        m.write_field("axis");
        m.write_int(axis as i64);
        m.write_field("dir");
        m.write_int(dir);
    });
    msg.write_field("line_junctions");
    msg.write_struct_array(&lines, |m, &(comm_index, axis, offset1, offset2)| {
        m.write_field("cell_index");
        m.write_int(comm_index);
        m.write_field("axis");
        m.write_int(axis as i64);
        m.write_field("offset1");
        m.write_double(offset1);
        m.write_field("offset2");
        m.write_double(offset2);
    });
    msg.write_field("point_junctions");
    msg.write_struct_array(&points, |m, &(comm_index, corner)| {
        m.write_field("cell_index");
        m.write_int(comm_index);
        m.write_field("offset");
        m.write_vec(&corner);
    });
    msg
}
