mod common;

use approx::assert_relative_eq;
use common::{fit, init_logging, simulate};
use ddt_lcm::predict::{predict_point, predict_posterior};
use ddt_lcm::{DdtLcmConfig, DdtLcmError, FittedModel, Responses};
use ndarray::Array2;

#[test]
fn dietary_scale_fit() {
    init_logging();
    // 496 subjects, 78 items in 7 groups, 6 classes.
    let sim = simulate(496, 78, 7, 6, 0.8, 0.02, 2024);
    let config = DdtLcmConfig::new(6, 100).with_seed(1);
    let posterior = fit(sim.data, config);
    let summary = posterior.summarize(50, true).unwrap();

    assert_eq!(summary.n_retained, 50);
    assert_eq!(summary.response_probs_summary.len(), 6 * 78);
    assert_eq!(summary.map_tree.n_leaves(), 6);
    assert_eq!(summary.class_probs_summary.len(), 6);
    let total: f64 = summary.class_prob_means().iter().sum();
    assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    assert_eq!(summary.diffusion_variance_summary.len(), 7);
    assert_eq!(summary.config.groups.n_groups(), 7);
    summary.map_tree.validate().unwrap();
}

#[test]
fn prediction_paths_agree_on_separated_classes() {
    init_logging();
    let sim = simulate(150, 20, 2, 3, 0.95, 0.0, 31);
    let responses = sim.data.responses().clone();
    let config = DdtLcmConfig::new(3, 60).with_seed(5);
    let posterior = fit(sim.data, config);
    let summary = posterior.summarize(30, true).unwrap();

    let point = predict_point(&summary, &responses).unwrap();
    let full = predict_posterior(&posterior, 30, true, &responses).unwrap();
    for pred in [&point, &full] {
        assert_eq!(pred.labels.len(), 150);
        assert_eq!(pred.probabilities.dim(), (150, 3));
        assert!(pred.labels.iter().all(|&z| z < 3));
        for row in pred.probabilities.rows() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
    }
    let agree = point
        .labels
        .iter()
        .zip(&full.labels)
        .filter(|(a, b)| a == b)
        .count();
    assert!(agree >= 135, "only {agree} of 150 labels agree");

    // The final sample's modal assignments tell the same story.
    let last = posterior.aligned_samples(30, true).unwrap().0;
    let modal = &last[last.len() - 1].assignments;
    let labels = &full.labels;
    let agree_modal = modal.iter().zip(labels).filter(|(a, b)| a == b).count();
    assert!(
        agree_modal >= 120,
        "only {agree_modal} of 150 modal labels agree"
    );

    let model = FittedModel::Summary(summary);
    assert_eq!(model.predict(&responses, 30).unwrap(), point);
}

#[test]
fn prediction_rejects_item_mismatch() {
    let sim = simulate(40, 6, 1, 2, 0.9, 0.0, 3);
    let posterior = fit(sim.data, DdtLcmConfig::new(2, 6));
    let summary = posterior.summarize(2, false).unwrap();
    let other = Responses::new(&Array2::zeros((5, 7))).unwrap();
    assert!(matches!(
        predict_point(&summary, &other),
        Err(DdtLcmError::InvalidInput(_))
    ));
    assert!(matches!(
        predict_posterior(&posterior, 2, false, &other),
        Err(DdtLcmError::InvalidInput(_))
    ));
}
