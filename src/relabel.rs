//! Label-switching correction.
//!
//! Each retained sample is matched to a reference `K × J` response-probability matrix
//! by the permutation minimizing `Σ_j (θ_kj - θ_ref_{perm(k) j})²`. The reference
//! starts at the MAP sample and is then replaced by the mean of the relabeled
//! samples until the permutations stop changing.

use crate::chain::PosteriorSample;
use crate::error::{DdtLcmError, Result};
use log::debug;
use ndarray::Array2;

/// Upper bound on reference updates.
pub const MAX_ROUNDS: usize = 50;

/// Minimum-cost perfect assignment of rows to columns of a square cost matrix
/// (Hungarian method with potentials, `O(n³)`). Entry `k` of the result is the
/// column assigned to row `k`.
pub fn hungarian(cost: &Array2<f64>) -> Result<Vec<usize>> {
    let n = cost.nrows();
    if cost.ncols() != n {
        return Err(DdtLcmError::invalid(format!(
            "assignment needs a square cost matrix, got {} x {}",
            n,
            cost.ncols()
        )));
    }
    if cost.iter().any(|c| !c.is_finite()) {
        return Err(DdtLcmError::numeric("assignment cost matrix is not finite"));
    }

    // 1-based potentials; column 0 is a sentinel.
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; n + 1];
    let mut row_of = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];
    for i in 1..=n {
        row_of[0] = i;
        let mut j0 = 0;
        let mut min_v = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[j0] = true;
            let i0 = row_of[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let cur = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if cur < min_v[j] {
                    min_v[j] = cur;
                    way[j] = j0;
                }
                if min_v[j] < delta {
                    delta = min_v[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[row_of[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_v[j] -= delta;
                }
            }
            j0 = j1;
            if row_of[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            row_of[j0] = row_of[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![0; n];
    for j in 1..=n {
        assignment[row_of[j] - 1] = j - 1;
    }
    Ok(assignment)
}

/// Squared-distance cost of mapping row `k` of `theta` onto row `l` of `reference`.
fn matching_cost(theta: &Array2<f64>, reference: &Array2<f64>) -> Array2<f64> {
    let k = theta.nrows();
    Array2::from_shape_fn((k, k), |(a, b)| {
        theta
            .row(a)
            .iter()
            .zip(reference.row(b))
            .map(|(x, y)| (x - y) * (x - y))
            .sum()
    })
}

/// One permutation per sample aligning it to a common labeling, starting from
/// `samples[reference]`. Apply them with [`PosteriorSample::permuted`].
pub fn relabel_permutations(
    samples: &[PosteriorSample],
    reference: usize,
) -> Result<Vec<Vec<usize>>> {
    let Some(start) = samples.get(reference) else {
        return Err(DdtLcmError::Usage(format!(
            "reference sample {reference} out of range for {} samples",
            samples.len()
        )));
    };
    let thetas: Vec<Array2<f64>> = samples
        .iter()
        .map(PosteriorSample::response_probs)
        .collect();
    let mut reference = start.response_probs();
    let mut perms: Vec<Vec<usize>> = Vec::new();

    for round in 0..MAX_ROUNDS {
        let next = thetas
            .iter()
            .map(|theta| hungarian(&matching_cost(theta, &reference)))
            .collect::<Result<Vec<_>>>()?;

        let mut mean = Array2::<f64>::zeros(reference.raw_dim());
        for (theta, perm) in thetas.iter().zip(&next) {
            for (k, &l) in perm.iter().enumerate() {
                let mut row = mean.row_mut(l);
                row += &theta.row(k);
            }
        }
        mean /= thetas.len() as f64;
        reference = mean;

        if next == perms {
            debug!("relabeling converged after {round} rounds");
            return Ok(next);
        }
        perms = next;
    }
    debug!("relabeling stopped after {MAX_ROUNDS} rounds");
    Ok(perms)
}
