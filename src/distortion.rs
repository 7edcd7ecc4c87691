//! Radial lens distortion model
//!
//! Cardboard-style lenses apply a radially symmetric pincushion distortion.
//! Radii are measured in tangent-angle units from the lens axis. The forward
//! polynomial maps an undistorted radius to the radius seen through the lens;
//! a second, separately fitted polynomial approximates the way back.

use serde::{Deserialize, Serialize};

/// Largest number of polynomial coefficients a distortion carries.
pub const MAX_COEFFICIENTS: usize = 6;

/// Radial polynomial `r * (1 + k1*r^2 + k2*r^4 + ...)`.
///
/// Unused trailing coefficients are zero, which is equivalent to a shorter
/// polynomial.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct RadialDistortion {
    coefficients: [f32; MAX_COEFFICIENTS],
}

impl RadialDistortion {
    /// No distortion at all.
    pub const IDENTITY: Self = Self { coefficients: [0.0; MAX_COEFFICIENTS] };

    /// Two-term polynomial, the form device profiles are specified in.
    pub const fn new(k1: f32, k2: f32) -> Self {
        Self { coefficients: [k1, k2, 0.0, 0.0, 0.0, 0.0] }
    }

    /// Builds a polynomial from up to [`MAX_COEFFICIENTS`] terms; extra terms are ignored.
    pub fn from_coefficients(coefficients: &[f32]) -> Self {
        let mut out = Self::IDENTITY;
        for (dst, src) in out.coefficients.iter_mut().zip(coefficients) {
            *dst = *src;
        }
        out
    }

    pub fn k1(&self) -> f32 {
        self.coefficients[0]
    }

    pub fn k2(&self) -> f32 {
        self.coefficients[1]
    }

    /// All coefficient slots, zero padded.
    pub fn coefficients(&self) -> &[f32; MAX_COEFFICIENTS] {
        &self.coefficients
    }

    /// Number of meaningful coefficients (trailing zeros trimmed).
    pub fn len(&self) -> usize {
        self.coefficients
            .iter()
            .rposition(|c| *c != 0.0)
            .map_or(0, |i| i + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies the polynomial to a radius.
    pub fn distort(&self, r: f32) -> f32 {
        let r2 = r * r;
        let mut ret = 0.0;
        for c in self.coefficients[..self.len()].iter().rev() {
            ret = r2 * (ret + c);
        }
        (ret + 1.0) * r
    }

    /// Solves `distort(x) == radius` numerically with the secant method.
    ///
    /// This is the exact inverse of this polynomial (to 1e-4), as opposed to
    /// the fitted approximation a profile stores for per-frame use.
    pub fn invert(&self, radius: f32) -> f32 {
        const TOLERANCE: f32 = 0.0001;
        const MAX_ITERATIONS: usize = 64;

        let mut r0 = 0.0;
        let mut r1 = 1.0;
        let mut dr0 = radius - self.distort(r0);
        for _ in 0..MAX_ITERATIONS {
            if (r1 - r0).abs() <= TOLERANCE {
                break;
            }
            let dr1 = radius - self.distort(r1);
            let r2 = r1 - dr1 * ((r1 - r0) / (dr1 - dr0));
            r0 = r1;
            r1 = r2;
            dr0 = dr1;
        }
        r1
    }

    /// Fits an approximate inverse polynomial by least squares.
    ///
    /// Samples `r` in `(0, max_radius]`, distorts each sample to `R`, and
    /// solves `R + K1*R^3 + K2*R^5 + ... = r` for all six coefficients.
    pub fn approximate_inverse(&self, max_radius: f32, num_samples: usize) -> Self {
        let num_samples = num_samples.max(MAX_COEFFICIENTS);
        let mut mat_a = vec![[0.0f64; MAX_COEFFICIENTS]; num_samples];
        let mut vec_y = vec![0.0f64; num_samples];
        for (i, (row, y)) in mat_a.iter_mut().zip(vec_y.iter_mut()).enumerate() {
            let r = max_radius * (i + 1) as f32 / num_samples as f32;
            let rp = self.distort(r) as f64;
            let mut v = rp;
            for cell in row.iter_mut() {
                v *= rp * rp;
                *cell = v;
            }
            *y = r as f64 - rp;
        }

        let k = solve_least_squares(&mat_a, &vec_y);
        let mut out = Self::IDENTITY;
        for (dst, src) in out.coefficients.iter_mut().zip(k.iter()) {
            *dst = *src as f32;
        }
        out
    }
}

impl TryFrom<Vec<f32>> for RadialDistortion {
    type Error = String;

    fn try_from(value: Vec<f32>) -> Result<Self, Self::Error> {
        if value.len() > MAX_COEFFICIENTS {
            return Err(format!(
                "at most {MAX_COEFFICIENTS} distortion coefficients are supported, got {}",
                value.len()
            ));
        }
        Ok(Self::from_coefficients(&value))
    }
}

impl From<RadialDistortion> for Vec<f32> {
    fn from(value: RadialDistortion) -> Self {
        value.coefficients[..value.len()].to_vec()
    }
}

/// Normal equations `(AᵀA) x = Aᵀy` for a tall sample matrix.
fn solve_least_squares(mat_a: &[[f64; MAX_COEFFICIENTS]], vec_y: &[f64]) -> [f64; MAX_COEFFICIENTS] {
    let mut ata = [[0.0f64; MAX_COEFFICIENTS]; MAX_COEFFICIENTS];
    for (j, ata_row) in ata.iter_mut().enumerate() {
        for (k, cell) in ata_row.iter_mut().enumerate() {
            *cell = mat_a.iter().map(|row| row[j] * row[k]).sum();
        }
    }

    let mut aty = [0.0f64; MAX_COEFFICIENTS];
    for (j, cell) in aty.iter_mut().enumerate() {
        *cell = mat_a.iter().zip(vec_y).map(|(row, y)| row[j] * y).sum();
    }

    solve_linear(ata, aty)
}

/// Gaussian elimination without row exchange, then back substitution.
///
/// Only meant for the symmetric positive definite systems produced above,
/// whose pivots stay nonzero.
fn solve_linear(
    mut a: [[f64; MAX_COEFFICIENTS]; MAX_COEFFICIENTS],
    mut y: [f64; MAX_COEFFICIENTS],
) -> [f64; MAX_COEFFICIENTS] {
    let n = MAX_COEFFICIENTS;
    for j in 0..n - 1 {
        for k in j + 1..n {
            let p = a[k][j] / a[j][j];
            for i in j + 1..n {
                a[k][i] -= p * a[j][i];
            }
            y[k] -= p * y[j];
        }
    }

    let mut x = [0.0f64; MAX_COEFFICIENTS];
    for j in (0..n).rev() {
        let mut v = y[j];
        for i in j + 1..n {
            v -= a[j][i] * x[i];
        }
        x[j] = v / a[j][j];
    }
    x
}

/// Forward and inverse distortion of one viewer, as used per frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistortionModel {
    pub forward: RadialDistortion,
    pub inverse: RadialDistortion,
}

impl DistortionModel {
    pub fn new(forward: RadialDistortion, inverse: RadialDistortion) -> Self {
        Self { forward, inverse }
    }

    /// Undistorted radius to the radius seen through the lens.
    pub fn distort(&self, r: f32) -> f32 {
        self.forward.distort(r)
    }

    /// Approximate way back, using the fitted inverse coefficients.
    pub fn distort_inverse(&self, r: f32) -> f32 {
        self.inverse.distort(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORWARD: RadialDistortion = RadialDistortion::new(0.441, 0.156);
    const INVERSE: RadialDistortion = RadialDistortion::new(-0.423, 0.239);

    #[test]
    fn zero_radius_is_fixed_point() {
        let model = DistortionModel::new(FORWARD, INVERSE);
        assert_eq!(model.distort(0.0), 0.0);
        assert_eq!(model.distort_inverse(0.0), 0.0);
    }

    #[test]
    fn forward_matches_closed_form() {
        let r = 0.5f32;
        let expected = r * (1.0 + 0.441 * r * r + 0.156 * r.powi(4));
        assert!((FORWARD.distort(r) - expected).abs() < 1e-6);
    }

    #[test]
    fn calibrated_inverse_round_trip_baseline() {
        // Observed max error is about 1.3e-3 on [0, 0.6]; the fit degrades
        // quickly past that radius.
        let model = DistortionModel::new(FORWARD, INVERSE);
        let mut max_err = 0.0f32;
        for i in 0..=600 {
            let r = i as f32 / 1000.0;
            let err = (model.distort_inverse(model.distort(r)) - r).abs();
            max_err = max_err.max(err);
        }
        assert!(max_err < 1e-2, "max round-trip error {max_err}");
        assert!(max_err > 1e-4, "fitted inverse should not be exact ({max_err})");
    }

    #[test]
    fn fitted_inverse_is_close_over_unit_radius() {
        let inverse = FORWARD.approximate_inverse(1.0, 100);
        assert_eq!(inverse.len(), MAX_COEFFICIENTS);
        for i in 0..=100 {
            let r = i as f32 / 100.0;
            let err = (inverse.distort(FORWARD.distort(r)) - r).abs();
            assert!(err < 5e-3, "r={r} err={err}");
        }
    }

    #[test]
    fn secant_inverse_solves_polynomial() {
        for radius in [0.1f32, 0.5, 0.9, 1.2] {
            let r = FORWARD.invert(radius);
            assert!((FORWARD.distort(r) - radius).abs() < 1e-3, "radius {radius}");
        }
    }

    #[test]
    fn trailing_zeros_are_trimmed() {
        assert_eq!(RadialDistortion::new(0.3, 0.0).len(), 1);
        assert!(RadialDistortion::IDENTITY.is_empty());
        let coefs: Vec<f32> = RadialDistortion::new(0.34, 0.55).into();
        assert_eq!(coefs, vec![0.34, 0.55]);
    }

    #[test]
    fn rejects_too_many_coefficients() {
        assert!(RadialDistortion::try_from(vec![0.1; 7]).is_err());
    }
}
