//! # Cell Partitioning Module - Spatial Domain Decomposition
//!
//! Routines for dividing the cubic periodic simulation box into uniform
//! rectangular cells, one per worker, and for enumerating the junctions
//! between neighboring cells under periodic wrap.
//!
//! The box is cut along each axis into an integer number of segments. The
//! division `(2, 1, 3)` halves the x-axis, leaves the y-axis whole, and cuts
//! the z-axis into thirds, producing six cells of uniform dimensions.
//! [`divisions`] computes the ideal cut for a requested cell count, where
//! ideal means the most cube-like cells (minimal spread between the three
//! divisors).
//!
//! Each cell sees up to 26 junctions grouped by how the neighboring cell
//! touches it: 6 surfaces (one signed axis), 12 lines (two signed axes), and
//! 8 points (all three axes). Junction descriptors carry the geometry of the
//! shared boundary region so a worker can select which of its particles to
//! ghost across each junction. Cells are referenced by flat index into the
//! cell table; junctions never hold back-pointers.

pub mod schedule;

use crate::vector::Vec3;
use thiserror::Error;

/// Errors raised while partitioning the simulation box.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// The worker count has no divisor triple within the per-axis cap.
    #[error(
        "cannot divide the box into {requested} cells with at most \
         {MAX_DIMENSION_DIVIDES} divisions per axis"
    )]
    Infeasible { requested: usize },

    /// The requested division produces cells thinner than the neighbor range.
    #[error(
        "cell dimension {cell_length:.3e} m along axis {axis} is below the \
         neighbor range {r_neighbor:.3e} m"
    )]
    CellTooSmall {
        axis: usize,
        cell_length: f64,
        r_neighbor: f64,
    },

    /// A particle position lies outside the box.
    #[error("particle {index} at {position} lies outside the box")]
    PositionOutsideBox { index: usize, position: Vec3 },
}

/// Largest number of segments a single axis may be divided into.
pub const MAX_DIMENSION_DIVIDES: usize = 10;

/// Axis-aligned extent of a cell: the half-open box `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub min: Vec3,
    pub max: Vec3,
}

impl Extent {
    /// True when the position lies inside the half-open extent on all axes.
    pub fn contains(&self, p: &Vec3) -> bool {
        (0..3).all(|a| p.axis(a) >= self.min.axis(a) && p.axis(a) < self.max.axis(a))
    }
}

/// How a neighboring cell touches this one, with the geometry of the shared
/// boundary region in this cell's own coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JunctionGeometry {
    /// Shared face: `dir` is +1 toward `max` and −1 toward `min` on `axis`.
    Surface { axis: usize, dir: i64 },
    /// Shared edge: `axis` is the unsplit axis; `offset1`/`offset2` are the
    /// boundary coordinates along the remaining two axes in axis order.
    Line {
        axis: usize,
        offset1: f64,
        offset2: f64,
    },
    /// Shared corner at `corner`.
    Point { corner: Vec3 },
}

impl JunctionGeometry {
    /// Communication precedence: surfaces carry the most data and schedule
    /// first, then lines, then points.
    pub fn precedence(&self) -> i32 {
        match self {
            JunctionGeometry::Surface { .. } => -3,
            JunctionGeometry::Line { .. } => -2,
            JunctionGeometry::Point { .. } => -1,
        }
    }
}

/// A neighbor relation between two cells under periodic wrap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Junction {
    /// Flat index of the neighboring cell in the cell table.
    pub neighbor: usize,
    pub geometry: JunctionGeometry,
}

/// One worker's sub-box: integer grid index, extent, owned particles with
/// their tags, and the junction list toward its neighbors.
#[derive(Debug, Clone)]
pub struct Cell {
    pub index: [usize; 3],
    pub extent: Extent,
    pub positions: Vec<Vec3>,
    pub tags: Vec<i64>,
    pub junctions: Vec<Junction>,
}

/// Spread measure of a divisor triple: nine times its squared population
/// variance, an exact integer that orders triples identically to their
/// standard deviation (0 for a perfect cube of cells).
fn spread_key(divs: [usize; 3]) -> i64 {
    let sum = divs.iter().sum::<usize>() as i64;
    divs.iter()
        .map(|&d| {
            let t = 3 * d as i64 - sum;
            t * t
        })
        .sum()
}

/// Picks the division triple for `n_cells` workers.
///
/// Searches `[1..=MAX_DIMENSION_DIVIDES]^3` for triples whose product is
/// `n_cells`, minimizing the spread of the divisors; among equally good
/// triples the lexically greatest wins, so `divisions(6)` is `(3, 2, 1)` and
/// `divisions(7)` is `(7, 1, 1)`.
pub fn divisions(n_cells: usize) -> Result<[usize; 3], PartitionError> {
    let mut best: Option<([usize; 3], i64)> = None;
    for x in 1..=MAX_DIMENSION_DIVIDES {
        for y in 1..=MAX_DIMENSION_DIVIDES {
            for z in 1..=MAX_DIMENSION_DIVIDES {
                if x * y * z != n_cells {
                    continue;
                }
                let div = [x, y, z];
                let s = spread_key(div);
                let better = match best {
                    None => true,
                    Some((b, bs)) => s < bs || (s == bs && div > b),
                };
                if better {
                    best = Some((div, s));
                }
            }
        }
    }
    best.map(|(div, _)| div).ok_or(PartitionError::Infeasible {
        requested: n_cells,
    })
}

/// The 26 junction offsets in enumeration order: 6 surfaces, 12 lines,
/// 8 points, each grouped by the L1 norm of the integer offset.
fn junction_offsets() -> Vec<[i64; 3]> {
    let mut offsets = Vec::with_capacity(26);
    // surfaces: one signed axis
    for axis in 0..3 {
        for dir in [-1i64, 1] {
            let mut off = [0i64; 3];
            off[axis] = dir;
            offsets.push(off);
        }
    }
    // lines: exactly two signed axes, lexicographic
    for x in [-1i64, 0, 1] {
        for y in [-1i64, 0, 1] {
            for z in [-1i64, 0, 1] {
                if x.abs() + y.abs() + z.abs() == 2 {
                    offsets.push([x, y, z]);
                }
            }
        }
    }
    // points: all three axes signed
    for x in [-1i64, 1] {
        for y in [-1i64, 1] {
            for z in [-1i64, 1] {
                offsets.push([x, y, z]);
            }
        }
    }
    offsets
}

/// Boundary coordinate of `extent` selected by an offset component:
/// −1 maps to the min face, +1 to the max face.
fn boundary_coordinate(extent: &Extent, axis: usize, off: i64) -> f64 {
    if off < 0 {
        extent.min.axis(axis)
    } else {
        extent.max.axis(axis)
    }
}

/// Builds the junction descriptor for an offset relative to a cell extent.
fn junction_geometry(extent: &Extent, off: [i64; 3]) -> JunctionGeometry {
    match off.iter().map(|o| o.abs()).sum::<i64>() {
        1 => {
            let axis = (0..3).find(|&a| off[a] != 0).unwrap();
            JunctionGeometry::Surface {
                axis,
                dir: off[axis],
            }
        }
        2 => {
            let axis = (0..3).find(|&a| off[a] == 0).unwrap();
            let signed: Vec<usize> = (0..3).filter(|&a| off[a] != 0).collect();
            JunctionGeometry::Line {
                axis,
                offset1: boundary_coordinate(extent, signed[0], off[signed[0]]),
                offset2: boundary_coordinate(extent, signed[1], off[signed[1]]),
            }
        }
        3 => {
            let mut corner = Vec3::zero();
            for a in 0..3 {
                *corner.axis_mut(a) = boundary_coordinate(extent, a, off[a]);
            }
            JunctionGeometry::Point { corner }
        }
        other => unreachable!("junction offset with L1 norm {other}"),
    }
}

/// Flat index of a grid position for divisions `divs`, x-major like the
/// sorted cell table.
fn flat_index(index: [usize; 3], divs: [usize; 3]) -> usize {
    (index[0] * divs[1] + index[1]) * divs[2] + index[2]
}

/// Partitions positions into cells for the given divisions.
///
/// Every cell in the grid is produced, even when empty. Particles keep a tag
/// equal to their index in `positions`, which stays attached to them across
/// later migrations so the master can reassemble trajectories in canonical
/// order. Cells are returned sorted by grid index (x-major), so the flat
/// index doubles as the worker rank.
pub fn partition_positions(
    box_size: &Vec3,
    positions: &[Vec3],
    divs: [usize; 3],
) -> Result<Vec<Cell>, PartitionError> {
    let mut cells = Vec::with_capacity(divs[0] * divs[1] * divs[2]);
    for x in 0..divs[0] {
        for y in 0..divs[1] {
            for z in 0..divs[2] {
                let index = [x, y, z];
                let mut min = Vec3::zero();
                let mut max = Vec3::zero();
                for a in 0..3 {
                    let length = box_size.axis(a) / divs[a] as f64;
                    *min.axis_mut(a) = index[a] as f64 * length;
                    *max.axis_mut(a) = (index[a] + 1) as f64 * length;
                }
                cells.push(Cell {
                    index,
                    extent: Extent { min, max },
                    positions: Vec::new(),
                    tags: Vec::new(),
                    junctions: Vec::new(),
                });
            }
        }
    }

    // Sort particles into cells; positions are strictly inside [0, L) so a
    // plain floor suffices (clamped against roundoff at the top face).
    for (tag, position) in positions.iter().enumerate() {
        let mut index = [0usize; 3];
        for a in 0..3 {
            let coord = position.axis(a);
            if coord < 0.0 || coord >= box_size.axis(a) {
                return Err(PartitionError::PositionOutsideBox {
                    index: tag,
                    position: *position,
                });
            }
            let i = (coord / box_size.axis(a) * divs[a] as f64).floor() as usize;
            index[a] = i.min(divs[a] - 1);
        }
        let cell = &mut cells[flat_index(index, divs)];
        cell.positions.push(*position);
        cell.tags.push(tag as i64);
    }

    // Enumerate junctions; wraps that identify a cell with itself are
    // discarded.
    let offsets = junction_offsets();
    for flat in 0..cells.len() {
        let index = cells[flat].index;
        let extent = cells[flat].extent;
        let mut junctions = Vec::new();
        for &off in &offsets {
            let mut neighbor = [0usize; 3];
            for a in 0..3 {
                let d = divs[a] as i64;
                neighbor[a] = (index[a] as i64 + off[a]).rem_euclid(d) as usize;
            }
            if neighbor == index {
                continue;
            }
            junctions.push(Junction {
                neighbor: flat_index(neighbor, divs),
                geometry: junction_geometry(&extent, off),
            });
        }
        cells[flat].junctions = junctions;
    }

    Ok(cells)
}

/// Checks that every cell is at least `r_neighbor` thick, the requirement
/// for single-shell ghost exchange to see all interacting pairs.
pub fn check_cell_dimensions(
    box_size: &Vec3,
    divs: [usize; 3],
    r_neighbor: f64,
) -> Result<(), PartitionError> {
    for axis in 0..3 {
        let cell_length = box_size.axis(axis) / divs[axis] as f64;
        if cell_length < r_neighbor {
            return Err(PartitionError::CellTooSmall {
                axis,
                cell_length,
                r_neighbor,
            });
        }
    }
    Ok(())
}
