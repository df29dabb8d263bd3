//! Polya-Gamma PG(b, c) variates for logistic-link data augmentation.
//!
//! Given `ω ~ PG(b, ψ)`, the binomial-logit likelihood `e^{ψ s} / (1 + e^ψ)^b` becomes
//! Gaussian in `ψ`, which is what makes the leaf-location update in
//! [`gibbs`](crate::gibbs) a conjugate Normal draw.
//!
//! Sampling strategy by shape `b`:
//! - `b == 0`: the point mass at zero (an empty class contributes nothing).
//! - integer `b`: the sum of `b` exact PG(1, c) draws (Devroye's alternating-series sampler).
//! - non-integer `b`: the truncated gamma-series representation.
//!
//! References:
//! - Polson, N.G., Scott, J.G., & Windle, J. (2013). Bayesian Inference for Logistic Models
//!   Using Polya-Gamma Latent Variables. *JASA*, 108(504): 1339–1349.
//! - Windle, J., Polson, N.G., & Scott, J.G. (2014). Sampling Pólya-Gamma random variates:
//!   alternate and approximate techniques. arXiv:1405.0506.

use crate::error::{DdtLcmError, Result, dist_err};
use rand::Rng;
use statrs::distribution::{Exp, Gamma, Normal, Uniform};
use std::f64::consts::PI;

mod devroye;

const PI_SQ: f64 = PI * PI;
const INV_TWO_PI_SQ: f64 = 1.0 / (2.0 * PI_SQ);
/// Relative size of the next gamma-series term below which the series is cut.
const SERIES_TOL: f64 = 1e-6;

/// Reusable Polya-Gamma sampler.
///
/// The sampler owns the standard distributions it draws from; the shape and tilt
/// are supplied per draw since every (class, item) cell has its own count.
///
/// # Example
/// ```rust
/// # use rand::SeedableRng;
/// # use rand_chacha::ChaCha8Rng;
/// use ddt_lcm::pg::PolyaGamma;
/// let pg = PolyaGamma::new();
/// let mut rng = ChaCha8Rng::seed_from_u64(0);
/// let w = pg.draw(&mut rng, 3.0, 0.7).unwrap();
/// assert!(w > 0.0);
/// ```
#[derive(Debug, Clone)]
pub struct PolyaGamma {
    exp: Exp,
    std_norm: Normal,
    unif: Uniform,
}

impl Default for PolyaGamma {
    fn default() -> Self {
        Self::new()
    }
}

impl PolyaGamma {
    pub fn new() -> Self {
        Self {
            exp: Exp::new(1.0).expect("Exp(1) is always valid"),
            std_norm: Normal::standard(),
            unif: Uniform::standard(),
        }
    }

    /// Draw a single PG(`shape`, `tilt`) variate.
    ///
    /// # Errors
    /// Returns [`DdtLcmError::InvalidInput`] if `shape` is negative or not finite.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R, shape: f64, tilt: f64) -> Result<f64> {
        if !shape.is_finite() || shape < 0.0 {
            return Err(DdtLcmError::invalid(format!(
                "Polya-Gamma shape must be a finite non-negative number, got {shape}"
            )));
        }
        if shape == 0.0 {
            return Ok(0.0);
        }
        if shape.fract() == 0.0 {
            return Ok(self.draw_integer_shape(rng, shape as usize, tilt));
        }
        self.draw_gamma_series(rng, shape, tilt)
    }

    /// Draw one variate per tilt, all with the same shape.
    pub fn draw_vec<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        shape: f64,
        tilts: &[f64],
    ) -> Result<Vec<f64>> {
        tilts.iter().map(|&c| self.draw(rng, shape, c)).collect()
    }

    /// Sum of `count` independent PG(1, c) variates, i.e. one auxiliary variable
    /// per Bernoulli observation sharing the logit `c`.
    fn draw_integer_shape<R: Rng + ?Sized>(&self, rng: &mut R, count: usize, tilt: f64) -> f64 {
        (0..count).map(|_| self.draw_unit(rng, tilt)).sum()
    }

    /// PG(b, c) for non-integer `b` via `(1 / 2π²) Σ_k g_k / ((k - ½)² + c² / 4π²)`,
    /// `g_k ~ Gamma(b, 1)`, truncated once the expected next term drops below tolerance.
    fn draw_gamma_series<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        shape: f64,
        tilt: f64,
    ) -> Result<f64> {
        let gamma = Gamma::new(shape, 1.0).map_err(dist_err("PG gamma series"))?;
        let tilt_term = (tilt / (2.0 * PI)).powi(2);

        let mut acc = 0.0;
        let mut k = 1usize;
        loop {
            let half_k = k as f64 - 0.5;
            acc += rng.sample(&gamma) / (half_k * half_k + tilt_term);

            let next = half_k + 1.0;
            if shape / (next * next + tilt_term) < SERIES_TOL {
                break;
            }
            k += 1;
        }
        Ok(acc * INV_TWO_PI_SQ)
    }
}

/// `E[PG(b, c)] = b·tanh(c/2) / (2c)`, with the limit `b/4` at `c = 0`.
pub fn pg_mean(shape: f64, tilt: f64) -> f64 {
    if tilt.abs() < 1e-12 {
        shape / 4.0
    } else {
        shape * (0.5 * tilt).tanh() / (2.0 * tilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn empirical_mean(shape: f64, tilt: f64, n: usize, seed: u64) -> f64 {
        let pg = PolyaGamma::new();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n).map(|_| pg.draw(&mut rng, shape, tilt).unwrap()).sum::<f64>() / n as f64
    }

    #[test]
    fn zero_shape_is_point_mass() {
        let pg = PolyaGamma::new();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for c in [-2.0, 0.0, 4.5] {
            assert_eq!(pg.draw(&mut rng, 0.0, c).unwrap(), 0.0);
        }
    }

    #[test]
    fn negative_shape_is_rejected() {
        let pg = PolyaGamma::new();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert!(matches!(
            pg.draw(&mut rng, -1.0, 0.0),
            Err(DdtLcmError::InvalidInput(_))
        ));
    }

    #[test]
    fn integer_shape_mean_matches_theory() {
        for (shape, tilt) in [(1.0, 0.0), (1.0, 2.0), (4.0, -1.5), (12.0, 0.3)] {
            let emp = empirical_mean(shape, tilt, 20_000, 11);
            let th = pg_mean(shape, tilt);
            assert!(
                (emp - th).abs() / th < 0.05,
                "PG({shape}, {tilt}): empirical {emp}, theory {th}"
            );
        }
    }

    #[test]
    fn non_integer_shape_mean_matches_theory() {
        let shape = 1.7;
        for (tilt, seed) in [(0.0, 1), (1.0, 2)] {
            let emp = empirical_mean(shape, tilt, 25_000, seed);
            let th = pg_mean(shape, tilt);
            assert!(
                (emp - th).abs() / th < 0.10,
                "PG({shape}, {tilt}): empirical {emp}, theory {th}"
            );
        }
    }

    #[test]
    fn same_seed_same_draws() {
        let pg = PolyaGamma::new();
        let tilts = [0.1, -0.4, 2.0, 5.0];
        let a = pg
            .draw_vec(&mut ChaCha8Rng::seed_from_u64(9), 3.0, &tilts)
            .unwrap();
        let b = pg
            .draw_vec(&mut ChaCha8Rng::seed_from_u64(9), 3.0, &tilts)
            .unwrap();
        assert_eq!(a, b);
    }
}
