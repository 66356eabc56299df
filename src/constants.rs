//! Physical constants and unit prefixes used throughout the simulation.
//!
//! All quantities are SI: lengths in meters, times in seconds, energies in
//! joules. The natural energy unit of the simulation is kT; conversions happen
//! at the system boundary (see [`crate::state::Parameters`]).

/// Boltzmann constant (J/K)
pub const KB: f64 = 1.38e-23;

// meters
pub const NM: f64 = 1e-9;
pub const MCM: f64 = 1e-6;
pub const MM: f64 = 1e-3;

// seconds
pub const PS: f64 = 1e-12;
pub const NS: f64 = 1e-9;
pub const MCS: f64 = 1e-6;
pub const MS: f64 = 1e-3;

/// Colloid particle radius (m); the particles are monodisperse 135 nm spheres.
pub const R_PARTICLE: f64 = 0.5 * 135.0 * NM;
