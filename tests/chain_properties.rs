mod common;

use approx::assert_relative_eq;
use common::{fit, init_logging, simulate};
use ddt_lcm::{DdtLcm, DdtLcmConfig, DdtLcmError, DivergencePrior};

fn small_config(total_iters: usize) -> DdtLcmConfig {
    DdtLcmConfig::new(3, total_iters).with_seed(11)
}

#[test]
fn every_sample_is_a_valid_state() {
    init_logging();
    let sim = simulate(90, 10, 2, 3, 0.85, 0.0, 1);
    let posterior = fit(sim.data, small_config(30));
    assert_eq!(posterior.len(), 30);
    for (i, s) in posterior.samples().iter().enumerate() {
        assert_eq!(s.iteration, i);
        s.tree.validate().unwrap();
        assert_eq!(s.tree.n_leaves(), 3);
        assert_relative_eq!(s.class_probs.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(s.assignments.iter().all(|&z| z < 3));
        assert!(s.diffusion_variances.iter().all(|&v| v > 0.0));
        assert!(s.divergence > 0.0);
        assert!(s.log_prior.is_finite() && s.log_likelihood.is_finite());
    }
    let stats = posterior.run_stats();
    assert_eq!(stats.iterations, 30);
    assert_eq!(stats.accepted + stats.rejected + stats.degenerate, 30);
}

#[test]
fn summary_has_expected_shape() {
    let sim = simulate(90, 10, 2, 3, 0.85, 0.0, 2);
    let posterior = fit(sim.data, small_config(20));
    let summary = posterior.summarize(5, true).unwrap();

    assert_eq!(summary.n_retained, 15);
    assert_eq!(summary.response_probs_summary.len(), 3 * 10);
    assert_eq!(summary.class_probs_summary.len(), 3);
    assert_eq!(summary.diffusion_variance_summary.len(), 2);
    assert_eq!(summary.map_tree.n_leaves(), 3);
    let total: f64 = summary.class_prob_means().iter().sum();
    assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    for (r, row) in summary.response_probs_summary.iter().enumerate() {
        assert_eq!((row.class, row.item), (r / 10, r % 10));
        assert_eq!(row.group, row.item * 2 / 10);
        assert!(row.lower <= row.mean && row.mean <= row.upper);
    }
    assert!(summary.map_iteration >= 5);
}

#[test]
fn runs_are_deterministic_under_seed() {
    let sim = simulate(60, 8, 2, 3, 0.8, 0.05, 3);
    let a = fit(sim.data.clone(), small_config(15));
    let b = fit(sim.data.clone(), small_config(15));
    assert_eq!(a.samples(), b.samples());

    let c = fit(sim.data, small_config(15).with_seed(12));
    assert_ne!(a.samples(), c.samples());
}

#[test]
fn summarize_is_idempotent() {
    let sim = simulate(60, 8, 1, 3, 0.8, 0.0, 4);
    let posterior = fit(sim.data, small_config(15));
    for relabel in [true, false] {
        let first = posterior.summarize(5, relabel).unwrap();
        assert_eq!(first, posterior.summarize(5, relabel).unwrap());
    }
}

#[test]
fn burnin_boundaries() {
    let sim = simulate(60, 8, 1, 3, 0.8, 0.0, 5);
    let posterior = fit(sim.data, small_config(10));

    let last = posterior.summarize(9, true).unwrap();
    assert_eq!(last.n_retained, 1);
    let map = &posterior.samples()[9];
    assert_eq!(last.map_iteration, 9);
    for row in &last.response_probs_summary {
        assert_eq!(row.lower, row.mean);
        assert_eq!(row.upper, row.mean);
    }
    assert_eq!(last.map_tree.n_leaves(), map.tree.n_leaves());

    for (burnin, relabel) in [(10, true), (50, false)] {
        assert!(matches!(
            posterior.summarize(burnin, relabel),
            Err(DdtLcmError::Usage(_))
        ));
    }
}

#[test]
fn missing_responses_are_tolerated() {
    let sim = simulate(80, 12, 3, 3, 0.85, 0.3, 6);
    let posterior = fit(sim.data, small_config(15));
    let summary = posterior.summarize(5, true).unwrap();
    assert!(
        summary
            .response_probs_summary
            .iter()
            .all(|r| (0.0..=1.0).contains(&r.mean))
    );
}

#[test]
fn fixed_divergence_is_kept() {
    let sim = simulate(60, 8, 1, 3, 0.8, 0.0, 7);
    let config = small_config(10).with_divergence(DivergencePrior::Fixed(0.4));
    let posterior = fit(sim.data, config);
    assert!(posterior.samples().iter().all(|s| s.divergence == 0.4));
    let summary = posterior.summarize(0, false).unwrap();
    assert_relative_eq!(summary.divergence_summary.mean, 0.4, epsilon = 1e-12);
}

#[test]
fn sparse_class_concentration_runs_to_completion() {
    // Six classes for data with two: most classes stay empty under a tiny α.
    let sim = simulate(200, 10, 2, 2, 0.9, 0.0, 10);
    for seed in 0..3 {
        let config = DdtLcmConfig::new(6, 60)
            .with_seed(seed)
            .with_class_concentration(0.005);
        let posterior = fit(sim.data.clone(), config);
        assert_eq!(posterior.len(), 60);
        for s in posterior.samples() {
            assert!(s.class_probs.iter().all(|&p| p > 0.0));
            assert!(s.log_prior.is_finite());
        }
        posterior.summarize(30, true).unwrap();
    }
}

#[test]
fn invalid_inputs_fail_before_sampling() {
    let sim = simulate(30, 6, 1, 2, 0.8, 0.0, 8);
    assert!(matches!(
        DdtLcm::new(sim.data.clone(), DdtLcmConfig::new(1, 10)),
        Err(DdtLcmError::InvalidInput(_))
    ));
    assert!(matches!(
        DdtLcm::new(sim.data, DdtLcmConfig::new(3, 0)),
        Err(DdtLcmError::InvalidInput(_))
    ));

    let mut bad = sim.matrix.clone();
    bad[[0, 0]] = 2.0;
    let groups = ddt_lcm::ItemGroups::single(6).unwrap();
    assert!(matches!(
        ddt_lcm::ResponseData::new(&bad, groups),
        Err(DdtLcmError::InvalidInput(_))
    ));
}

#[cfg(feature = "rayon")]
#[test]
fn parallel_chains_match_sequential_runs() {
    let sim = simulate(60, 8, 2, 3, 0.8, 0.0, 9);
    let config = small_config(8);
    let chains = ddt_lcm::run_chains(&sim.data, &config, 3).unwrap();
    assert_eq!(chains.len(), 3);
    for (i, chain) in chains.iter().enumerate() {
        let seeded = config.clone().with_seed(config.seed + i as u64);
        let seq = fit(sim.data.clone(), seeded);
        assert_eq!(chain.samples(), seq.samples());
    }
    assert_ne!(chains[0].samples(), chains[1].samples());
}
