//! Vector math operations for Vec3
//! Provides norms, normalization, and the periodic-boundary helpers used by
//! the cell decomposition and force evaluation.

use super::Vec3;

impl Vec3 {
    /// Calculates the squared magnitude of the vector.
    ///
    /// More efficient than `norm()` as it avoids the square root; use it for
    /// cutoff comparisons where only relative magnitudes matter.
    #[inline]
    pub fn norm_squared(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Calculates the magnitude (Euclidean norm) of the vector.
    #[inline]
    pub fn norm(&self) -> f64 {
        self.norm_squared().sqrt()
    }

    /// Returns a unit vector in the same direction as this vector.
    ///
    /// A zero or near-zero vector normalizes to the zero vector to avoid
    /// division-by-zero instability.
    pub fn normalize(&self) -> Self {
        let norm_sq = self.norm_squared();
        if norm_sq > f64::EPSILON * f64::EPSILON {
            let inv_norm = norm_sq.sqrt().recip();
            Vec3 {
                x: self.x * inv_norm,
                y: self.y * inv_norm,
                z: self.z * inv_norm,
            }
        } else {
            Vec3::zero()
        }
    }

    /// Wraps a position into the periodic box `[0, L)` per axis.
    ///
    /// `rem_euclid` keeps the result non-negative for positions that stepped
    /// below zero. When a coordinate sits within one rounding step below a
    /// boundary, `rem_euclid` can round to exactly `L`; the invariant is the
    /// half-open interval, so that case folds to zero.
    #[inline]
    pub fn wrap(&self, box_size: &Vec3) -> Self {
        #[inline]
        fn wrap_axis(x: f64, length: f64) -> f64 {
            let wrapped = x.rem_euclid(length);
            if wrapped >= length { 0.0 } else { wrapped }
        }
        Vec3 {
            x: wrap_axis(self.x, box_size.x),
            y: wrap_axis(self.y, box_size.y),
            z: wrap_axis(self.z, box_size.z),
        }
    }

    /// Maps a displacement onto its nearest periodic image.
    ///
    /// Each component is shifted by a whole number of box lengths into
    /// `[-L/2, L/2]`. Valid for pair interactions whenever the interaction
    /// range is below half the box length.
    #[inline]
    pub fn min_image(&self, box_size: &Vec3) -> Self {
        Vec3 {
            x: self.x - box_size.x * (self.x / box_size.x).round(),
            y: self.y - box_size.y * (self.y / box_size.y).round(),
            z: self.z - box_size.z * (self.z / box_size.z).round(),
        }
    }

    /// Largest absolute component, i.e. the infinity norm.
    #[inline]
    pub fn max_abs_component(&self) -> f64 {
        self.x.abs().max(self.y.abs()).max(self.z.abs())
    }

    /// Component-wise approximate equality within `tolerance`.
    pub fn approx_eq(&self, other: &Vec3, tolerance: f64) -> bool {
        (self.x - other.x).abs() <= tolerance
            && (self.y - other.y).abs() <= tolerance
            && (self.z - other.z).abs() <= tolerance
    }
}
