//! # Force Field Module - Tabulated Pair Potentials
//!
//! The integrator never evaluates a potential analytically; it consumes two
//! uniform-grid linear interpolation tables, one for the pair potential and
//! one for its derivative divided by the separation distance. This module
//! provides the table type ([`Linterp`]), the named built-in pair potentials
//! the front-end can select ([`PairPotential`]), and the 1/r force-table
//! scaling the force kernel relies on.
//!
//! Potentials are defined in kT units as functions of the center-to-center
//! separation r; the master scales tables to joules before broadcasting them
//! to the workers.


use crate::constants::{NM, R_PARTICLE};
use serde::{Deserialize, Serialize};

/// A function tabulated on a uniform grid with linear interpolation between
/// the sample points.
#[derive(Debug, Clone, PartialEq)]
pub struct Linterp {
    /// Abscissa of the first sample.
    pub x_min: f64,
    /// Grid spacing between samples.
    pub x_prec: f64,
    /// Sample values.
    pub table: Vec<f64>,
}

impl Linterp {
    /// Builds a table by sampling `f` at `n_points` evenly spaced abscissas
    /// covering `[x_min, x_max]` inclusive.
    ///
    /// # Panics
    ///
    /// Panics if `n_points < 2` or the interval is empty; the parameter
    /// validation layer rejects such configurations earlier.
    pub fn from_fn(f: impl Fn(f64) -> f64, x_min: f64, x_max: f64, n_points: usize) -> Self {
        assert!(n_points >= 2, "interpolation table needs at least 2 points");
        assert!(x_max > x_min, "interpolation interval is empty");
        let x_prec = (x_max - x_min) / (n_points - 1) as f64;
        let table = (0..n_points)
            .map(|i| f(x_min + x_prec * i as f64))
            .collect();
        Linterp {
            x_min,
            x_prec,
            table,
        }
    }

    /// Number of sample points.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True for an empty table (never produced by the constructors).
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Abscissa of sample `i`.
    pub fn x_at(&self, i: usize) -> f64 {
        self.x_min + self.x_prec * i as f64
    }

    /// Linearly interpolated value at `x`, clamped to the table's range.
    ///
    /// Separations below `x_min` or beyond the last sample take the boundary
    /// value; the integrator cuts interactions off before the upper edge and
    /// the parameter validation keeps `x_min` below any physical separation,
    /// so clamping only guards against roundoff.
    pub fn interpolate(&self, x: f64) -> f64 {
        let t = (x - self.x_min) / self.x_prec;
        if t <= 0.0 {
            return self.table[0];
        }
        let last = self.table.len() - 1;
        if t >= last as f64 {
            return self.table[last];
        }
        let i = t.floor() as usize;
        let frac = t - i as f64;
        self.table[i] * (1.0 - frac) + self.table[i + 1] * frac
    }

    /// Multiplies every sample in place by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for y in &mut self.table {
            *y *= factor;
        }
    }
}

/// Divides a force table by its abscissa, producing the 1/r-normalized form
/// the force kernel expects.
///
/// The kernel computes `F = table(r) * (r_i - r_j)` without normalizing the
/// displacement, so the stored values absorb the 1/r factor. A sample at
/// exactly r = 0 would divide by zero; that entry divides by one instead,
/// since zero separation is outside the physical range of the table anyway.
pub fn scale_force_table(mut linterp: Linterp) -> Linterp {
    for i in 0..linterp.table.len() {
        let mut r = linterp.x_at(i);
        if r == 0.0 {
            r = 1.0;
        }
        linterp.table[i] /= r;
    }
    linterp
}

/// Named pairwise isotropic potentials selectable from the front-end.
///
/// `h` below is the surface separation `r - 2R`. Energies are in kT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairPotential {
    /// Ideal-gas control: no pair interaction.
    Zero,
    /// Double-exponential repulsion,
    /// `U(h) = u0 e^(-h/l0) + u1 e^(-h/l1)`
    /// with u0 = 20 kT, l0 = 3 nm, u1 = 10 kT, l1 = 0.5 nm.
    Repulsive,
}

// repulsive potential constants
const U0: f64 = 20.0;
const U1: f64 = 10.0;
const L0: f64 = 3.0 * NM;
const L1: f64 = 0.5 * NM;

impl PairPotential {
    /// Potential energy (kT) at separation `r`.
    pub fn potential(&self, r: f64) -> f64 {
        match self {
            PairPotential::Zero => 0.0,
            PairPotential::Repulsive => {
                let h = r - 2.0 * R_PARTICLE;
                U0 * (-h / L0).exp() + U1 * (-h / L1).exp()
            }
        }
    }

    /// Force magnitude (kT/m) at separation `r`: `-dU/dr`, positive for
    /// repulsion.
    pub fn force(&self, r: f64) -> f64 {
        match self {
            PairPotential::Zero => 0.0,
            PairPotential::Repulsive => {
                let h = r - 2.0 * R_PARTICLE;
                U0 / L0 * (-h / L0).exp() + U1 / L1 * (-h / L1).exp()
            }
        }
    }

    /// Tabulates the potential on `[r_min, r_max]` with `n_points` samples.
    pub fn make_potential_table(&self, r_min: f64, r_max: f64, n_points: usize) -> Linterp {
        Linterp::from_fn(|r| self.potential(r), r_min, r_max, n_points)
    }

    /// Tabulates the force on `[r_min, r_max]` with `n_points` samples.
    pub fn make_force_table(&self, r_min: f64, r_max: f64, n_points: usize) -> Linterp {
        Linterp::from_fn(|r| self.force(r), r_min, r_max, n_points)
    }
}

impl std::fmt::Display for PairPotential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairPotential::Zero => write!(f, "zero"),
            PairPotential::Repulsive => write!(f, "repulsive"),
        }
    }
}
