#![allow(dead_code)]

use ddt_lcm::{DdtLcm, DdtLcmConfig, ItemGroups, Posterior, ResponseData};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run a full chain.
pub fn fit(data: ResponseData, config: DdtLcmConfig) -> Posterior {
    DdtLcm::new(data, config).unwrap().fit().unwrap()
}

/// Responses simulated from a latent class model with known profiles.
pub struct Simulated {
    pub matrix: Array2<f64>,
    pub data: ResponseData,
    pub labels: Vec<usize>,
    pub theta: Array2<f64>,
}

/// `n` subjects in `k` balanced classes answering `j` items split into `g` contiguous
/// groups. Each class profile is `high` or `1 - high` per item; a share `missing` of
/// entries is blanked out.
pub fn simulate(
    n: usize,
    j: usize,
    g: usize,
    k: usize,
    high: f64,
    missing: f64,
    seed: u64,
) -> Simulated {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let flips = Array2::from_shape_fn((k, j), |_| rng.r#gen::<bool>());
    let theta = flips.mapv(|up| if up { high } else { 1.0 - high });
    let labels: Vec<usize> = (0..n).map(|i| i % k).collect();
    let matrix = Array2::from_shape_fn((n, j), |(i, item)| {
        if rng.r#gen::<f64>() < missing {
            f64::NAN
        } else if rng.r#gen::<f64>() < theta[[labels[i], item]] {
            1.0
        } else {
            0.0
        }
    });
    let names = (0..g).map(|h| format!("group_{h}")).collect();
    let membership = (0..j).map(|item| item * g / j).collect();
    let groups = ItemGroups::new(names, membership).unwrap();
    let data = ResponseData::new(&matrix, groups).unwrap();
    Simulated {
        matrix,
        data,
        labels,
        theta,
    }
}
