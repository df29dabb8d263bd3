//! Two-moment goodness-of-fit test for the PG(b, c) draws used by the leaf update

use ddt_lcm::pg::{PolyaGamma, pg_mean};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

/// Analytic variance of PG(b,c)
fn pg_var(b: f64, c: f64) -> f64 {
    if c == 0.0 {
        b / 24.0
    } else {
        let num = b * (c.sinh() - c) * (1.0 - (c / 2.0).tanh().powi(2));
        num / (4.0 * c.powi(3))
    }
}

/// Returns (passed?, z-score, chi-square)
fn pg_gof(sample: &[f64], b: f64, c: f64, alpha: f64) -> (bool, f64, f64) {
    let n = sample.len();
    assert!(n > 1, "Need at least two observations");

    let mean_hat: f64 = sample.iter().sum::<f64>() / n as f64;
    let ss: f64 = sample.iter().map(|x| (x - mean_hat).powi(2)).sum();
    let var_hat = ss / (n as f64 - 1.0);

    let mu = pg_mean(b, c);
    let sigma2 = pg_var(b, c);

    // ---- mean test (Z) ----
    let z = (mean_hat - mu) / (sigma2 / n as f64).sqrt();
    let z_crit = Normal::standard().inverse_cdf(1.0 - alpha / 2.0);
    let mean_ok = z.abs() < z_crit;
    if !mean_ok {
        eprintln!(
            "mean test failed with (b={b:.3}, c={c:.3}): got {mean_hat:.5}, expected {mu:.5}, z = {z:.3}"
        );
    }

    // ---- variance test (Chi-square), with a relative tolerance fallback ----
    let chi = (n as f64 - 1.0) * var_hat / sigma2;
    let chi_dist = ChiSquared::new(n as f64 - 1.0).unwrap();
    let chi_low = chi_dist.inverse_cdf(alpha / 2.0);
    let chi_hi = chi_dist.inverse_cdf(1.0 - alpha / 2.0);
    let rel_diff = (var_hat - sigma2).abs() / sigma2;
    let var_ok = (chi > chi_low && chi < chi_hi) || rel_diff < 0.01;
    if !var_ok {
        eprintln!(
            "variance test failed with (b={b:.3}, c={c:.3}): got {var_hat:.5}, expected {sigma2:.5}, rel_diff = {:.3}%",
            rel_diff * 100.0
        );
    }

    (mean_ok && var_ok, z, chi)
}

const N: usize = 20_000;

#[test]
fn polya_gamma_sampler_matches_moments() {
    // Class-item counts and a non-integer shape; tilts span typical leaf logits.
    let bs = [1.0, 1.3, 2.0, 3.5, 7.0];
    let cs = [-3.0, 0.0, 0.5, 1.5, 4.0];
    let alpha = 0.05;
    let pg = PolyaGamma::new();

    let corrected_alpha = alpha / (bs.len() * cs.len()) as f64;
    let mut failures = Vec::new();
    let mut rng = ChaCha8Rng::seed_from_u64(100);
    for &b in &bs {
        for &c in &cs {
            let sample = pg.draw_vec(&mut rng, b, &vec![c; N]).unwrap();
            let (passed, z, chi) = pg_gof(&sample, b, c, corrected_alpha);
            if !passed {
                failures.push(format!("b={b:.3}, c={c:.3}: z={z:.3}, chi²={chi:.3}"));
            }
        }
    }

    // One failure in 25 Bonferroni-corrected tests is within noise.
    if failures.len() > 1 {
        panic!(
            "Polya-Gamma GOF tests failed for the following (b, c) pairs with (z, chi²):\n  {}",
            failures.join("\n  ")
        );
    }
}

#[test]
fn draws_are_symmetric_in_tilt() {
    let pg = PolyaGamma::new();
    let mut a = ChaCha8Rng::seed_from_u64(3);
    let mut b = ChaCha8Rng::seed_from_u64(3);
    let pos = pg.draw_vec(&mut a, 4.0, &[2.5; 64]).unwrap();
    let neg = pg.draw_vec(&mut b, 4.0, &[-2.5; 64]).unwrap();
    assert_eq!(pos, neg);
}
