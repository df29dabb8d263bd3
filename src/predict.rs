//! Class membership of (new) subjects under a fitted model.

use crate::chain::Posterior;
use crate::data::{LeafLogProbs, Responses, log_sum_exp};
use crate::error::{DdtLcmError, Result};
use crate::summary::PosteriorSummary;
use ndarray::Array2;

/// Posterior class-membership probabilities (`N × K`) and the most probable class
/// of each subject. Labels are zero-based; see [`Prediction::class_numbers`] for
/// labels in `1..=K`.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Most probable class per subject, in `0..K`.
    pub labels: Vec<usize>,
    /// `P(z_i = k | y_i)`, one row per subject.
    pub probabilities: Array2<f64>,
}

/// Either a full chain or its summary, for callers holding one or the other.
#[derive(Debug, Clone)]
pub enum FittedModel {
    /// All recorded samples.
    Chain(Posterior),
    /// Posterior means only.
    Summary(PosteriorSummary),
}

impl FittedModel {
    /// Point prediction from the summary, or the posterior average over the chain's
    /// relabeled draws after `burnin`.
    pub fn predict(&self, responses: &Responses, burnin: usize) -> Result<Prediction> {
        match self {
            FittedModel::Chain(chain) => predict_posterior(chain, burnin, true, responses),
            FittedModel::Summary(summary) => predict_point(summary, responses),
        }
    }
}

/// Plug in the posterior mean response and class probabilities.
pub fn predict_point(summary: &PosteriorSummary, responses: &Responses) -> Result<Prediction> {
    check_items(summary.config.groups.n_items(), responses)?;
    let probs = LeafLogProbs::from_probs(&summary.response_prob_means());
    let mut membership = Array2::zeros((responses.n_subjects(), summary.config.n_classes));
    let class_probs = summary.class_prob_means();
    accumulate_membership(&mut membership, responses, &class_probs, &probs);
    Ok(Prediction::from_probabilities(membership))
}

/// Average each subject's class-membership probabilities over the retained draws.
pub fn predict_posterior(
    posterior: &Posterior,
    burnin: usize,
    relabel: bool,
    responses: &Responses,
) -> Result<Prediction> {
    check_items(posterior.groups().n_items(), responses)?;
    let (samples, _) = posterior.aligned_samples(burnin, relabel)?;
    let mut membership = Array2::zeros((responses.n_subjects(), posterior.config().n_classes));
    for s in &samples {
        let leaf_probs = s.tree.leaf_log_probs();
        accumulate_membership(&mut membership, responses, &s.class_probs, &leaf_probs);
    }
    membership /= samples.len() as f64;
    Ok(Prediction::from_probabilities(membership))
}

fn check_items(n_items: usize, responses: &Responses) -> Result<()> {
    if responses.n_items() != n_items {
        return Err(DdtLcmError::invalid(format!(
            "model was fit on {n_items} items, got {}",
            responses.n_items()
        )));
    }
    Ok(())
}

/// Add `P(z_i = k | y_i)` to `out[[i, k]]` for every subject.
fn accumulate_membership(
    out: &mut Array2<f64>,
    responses: &Responses,
    class_probs: &[f64],
    probs: &LeafLogProbs,
) {
    for (i, mut row) in out.rows_mut().into_iter().enumerate() {
        let log_w: Vec<f64> = responses
            .subject_log_likelihoods(i, probs)
            .iter()
            .zip(class_probs)
            .map(|(ll, p)| ll + p.ln())
            .collect();
        let norm = log_sum_exp(&log_w);
        for (cell, w) in row.iter_mut().zip(&log_w) {
            *cell += (w - norm).exp();
        }
    }
}

impl Prediction {
    /// Most probable class per subject, numbered `1..=K`.
    pub fn class_numbers(&self) -> Vec<usize> {
        self.labels.iter().map(|&k| k + 1).collect()
    }

    fn from_probabilities(probabilities: Array2<f64>) -> Self {
        let labels = probabilities
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map_or(0, |(k, _)| k)
            })
            .collect();
        Self {
            labels,
            probabilities,
        }
    }
}
