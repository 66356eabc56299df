//! Communication scheduling between neighboring cells.
//!
//! Workers exchange ghost particles and migrants by pairwise point-to-point
//! messages. To do this without deadlock and without global synchronization,
//! the master precomputes an ordered sequence of *rounds* of links; within a
//! round no cell participates in two links, so every worker is free to serve
//! its single partner. Each link is then expanded into two (send, recv) leg
//! pairs with fresh message tags, and every worker receives its own ordered
//! rule list to execute.

use super::Cell;
use std::collections::BTreeMap;

/// An unordered pair of neighboring cells, the unit of scheduled
/// communication. The pair is stored in canonical order (`cell_i < cell_j`
/// by flat index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub cell_i: usize,
    pub cell_j: usize,
}

impl Link {
    fn new(a: usize, b: usize) -> Self {
        assert!(a != b, "a cell cannot link to itself");
        if a < b {
            Link {
                cell_i: a,
                cell_j: b,
            }
        } else {
            Link {
                cell_i: b,
                cell_j: a,
            }
        }
    }
}

/// One leg of a scheduled exchange, from the perspective of a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommInst {
    Send = 1,
    Recv = 2,
}

/// A scheduled communication instruction: the peer cell (flat index) and
/// the message tag that pairs this leg with the matching one on the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommRule {
    pub inst: CommInst,
    pub peer: usize,
    pub tag: i64,
}

/// Deduplicates the cells' junctions into links grouped by precedence.
///
/// A pair of cells can share several junctions (e.g. both x faces when an
/// axis is divided in two); the link takes the strongest class among them,
/// with precedence surface > line > point. Groups come back ordered
/// surface-first; links inside a group follow canonical pair order.
fn group_links(cells: &[Cell]) -> Vec<Vec<Link>> {
    let mut precedence: BTreeMap<(usize, usize), i32> = BTreeMap::new();
    for (flat, cell) in cells.iter().enumerate() {
        for junction in &cell.junctions {
            let link = Link::new(flat, junction.neighbor);
            let prec = junction.geometry.precedence();
            let entry = precedence.entry((link.cell_i, link.cell_j)).or_insert(0);
            *entry = (*entry).min(prec);
        }
    }
    let mut groups: BTreeMap<i32, Vec<Link>> = BTreeMap::new();
    for ((i, j), prec) in precedence {
        groups
            .entry(prec)
            .or_default()
            .push(Link { cell_i: i, cell_j: j });
    }
    groups.into_values().collect()
}

/// Produces the ordered rounds of non-conflicting links.
///
/// Greedy construction: links are placed group by group (surface, line,
/// point); whenever no remaining link of the current group fits the round in
/// progress, the round is emitted and a fresh one starts. A round in progress
/// carries over into the next group, and the final rounds are sorted largest
/// first to favor parallel utilization.
pub fn communication_rounds(cells: &[Cell]) -> Vec<Vec<Link>> {
    let groups = group_links(cells);
    let mut rounds: Vec<Vec<Link>> = Vec::new();
    let mut round: Vec<Link> = Vec::new();
    let mut busy: Vec<bool> = vec![false; cells.len()];

    for mut links in groups {
        while !links.is_empty() {
            let placeable = links
                .iter()
                .position(|l| !busy[l.cell_i] && !busy[l.cell_j]);
            match placeable {
                Some(at) => {
                    let link = links.remove(at);
                    busy[link.cell_i] = true;
                    busy[link.cell_j] = true;
                    round.push(link);
                }
                None => {
                    // everyone is busy; start another round
                    rounds.push(std::mem::take(&mut round));
                    busy.fill(false);
                }
            }
        }
    }
    if !round.is_empty() {
        rounds.push(round);
    }
    rounds.sort_by_key(|r| std::cmp::Reverse(r.len()));
    rounds
}

/// Expands the scheduled rounds into per-cell ordered rule lists.
///
/// For every link two fresh positive tags are drawn from a counter that
/// increases monotonically across the whole schedule. The first tag pairs
/// `cell_i`'s send with `cell_j`'s receive, the second the reverse, so each
/// linked pair exchanges complementary legs at distinct tags and no worker
/// can confuse messages from consecutive rounds.
pub fn assign_comm_rules(cells: &[Cell], rounds: &[Vec<Link>]) -> Vec<Vec<CommRule>> {
    let mut rules: Vec<Vec<CommRule>> = vec![Vec::new(); cells.len()];
    let mut next_tag = 1i64;
    for round in rounds {
        for link in round {
            let tag = next_tag;
            next_tag += 1;
            rules[link.cell_i].push(CommRule {
                inst: CommInst::Send,
                peer: link.cell_j,
                tag,
            });
            rules[link.cell_j].push(CommRule {
                inst: CommInst::Recv,
                peer: link.cell_i,
                tag,
            });
            let tag = next_tag;
            next_tag += 1;
            rules[link.cell_j].push(CommRule {
                inst: CommInst::Send,
                peer: link.cell_i,
                tag,
            });
            rules[link.cell_i].push(CommRule {
                inst: CommInst::Recv,
                peer: link.cell_j,
                tag,
            });
        }
    }
    rules
}

/// Convenience wrapper producing the per-cell rules straight from the cells.
pub fn setup_comm_rules(cells: &[Cell]) -> Vec<Vec<CommRule>> {
    let rounds = communication_rounds(cells);
    assign_comm_rules(cells, &rounds)
}
