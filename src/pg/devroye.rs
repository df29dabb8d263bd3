//! Exact PG(1, c) draws by Devroye's alternating-series rejection sampler.
//!
//! The proposal for `X = 4·ω` is a two-piece mixture split at `t = 2/π`: a
//! truncated inverse Gaussian on `(0, t]` and a shifted exponential on `(t, ∞)`.
//! Acceptance is decided by bracketing the Jacobi density between partial sums
//! of its alternating series (Polson, Scott & Windle 2013, Algorithm 1).

use super::{PI_SQ, PolyaGamma};
use rand::Rng;
use statrs::distribution::ContinuousCDF;
use std::f64::consts::{FRAC_2_PI, FRAC_PI_2, PI};

/// Split point `t` of the two proposal pieces.
const SPLIT: f64 = FRAC_2_PI;

impl PolyaGamma {
    /// One PG(1, `tilt`) variate.
    pub(crate) fn draw_unit<R: Rng + ?Sized>(&self, rng: &mut R, tilt: f64) -> f64 {
        let z = 0.5 * tilt.abs();
        let rate = 0.125 * PI_SQ + 0.5 * z * z;
        let p_exp = self.exponential_piece_mass(z, rate);

        loop {
            let x = if rng.sample(&self.unif) < p_exp {
                SPLIT + rng.sample(&self.exp) / rate
            } else {
                self.truncated_inverse_gaussian(rng, z)
            };

            let mut s = series_term(0, x);
            let y = rng.sample(&self.unif) * s;
            let mut n = 0usize;
            loop {
                n += 1;
                let a_n = series_term(n, x);
                if n % 2 == 1 {
                    s -= a_n;
                    if y <= s {
                        return 0.25 * x;
                    }
                } else {
                    s += a_n;
                    if y > s {
                        break;
                    }
                }
            }
        }
    }

    /// Probability `p / (p + q)` of proposing from the exponential piece, where `p`
    /// and `q` are the (tilted) masses of the two proposal pieces.
    fn exponential_piece_mass(&self, z: f64, rate: f64) -> f64 {
        let inv_sqrt_t = FRAC_PI_2.sqrt();
        let upper = inv_sqrt_t * (SPLIT * z - 1.0);
        let lower = -inv_sqrt_t * (SPLIT * z + 1.0);

        let log_scale = rate.ln() + rate * SPLIT;
        let log_upper = log_scale - z + self.std_norm.cdf(upper).ln();
        let log_lower = log_scale + z + self.std_norm.cdf(lower).ln();

        let q_over_p = (4.0 / PI) * (log_upper.exp() + log_lower.exp());
        1.0 / (1.0 + q_over_p)
    }

    /// Inverse Gaussian IG(1/z, 1) truncated to `(0, SPLIT]`.
    fn truncated_inverse_gaussian<R: Rng + ?Sized>(&self, rng: &mut R, z: f64) -> f64 {
        if z < 1.0 / SPLIT {
            self.truncated_ig_small_tilt(rng, z)
        } else {
            self.truncated_ig_large_tilt(rng, 1.0 / z)
        }
    }

    /// Mean above the split: draw from the `z = 0` law by the inverse-chi-square
    /// construction and thin with `exp(-z² x / 2)`.
    fn truncated_ig_small_tilt<R: Rng + ?Sized>(&self, rng: &mut R, z: f64) -> f64 {
        loop {
            let e = loop {
                let e1 = rng.sample(&self.exp);
                let e2 = rng.sample(&self.exp);
                if e1 * e1 <= 2.0 * e2 / SPLIT {
                    break e1;
                }
            };
            let denom = 1.0 + e * SPLIT;
            let x = SPLIT / (denom * denom);
            if rng.sample(&self.unif) <= (-0.5 * z * z * x).exp() {
                return x;
            }
        }
    }

    /// Mean below the split: plain IG(mean, 1) draws (Michael, Schucany & Haas)
    /// rejected until they land under the split.
    fn truncated_ig_large_tilt<R: Rng + ?Sized>(&self, rng: &mut R, mean: f64) -> f64 {
        loop {
            let n: f64 = rng.sample(&self.std_norm);
            let my = mean * n * n;
            let mut x = mean + 0.5 * mean * my - 0.5 * mean * (4.0 * my + my * my).sqrt();
            if rng.sample(&self.unif) > mean / (mean + x) {
                x = mean * mean / x;
            }
            if x <= SPLIT {
                return x;
            }
        }
    }
}

/// n-th coefficient `a_n(x)` of the Jacobi density's alternating series, using the
/// piecewise form that is monotone in `n` on each side of the split.
fn series_term(n: usize, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let k = n as f64 + 0.5;
    if x <= SPLIT {
        PI * k * (2.0 / (PI * x)).powf(1.5) * (-2.0 * k * k / x).exp()
    } else {
        PI * k * (-0.5 * k * k * PI_SQ * x).exp()
    }
}
