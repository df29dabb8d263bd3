//! Posterior summaries over the retained samples of a chain.

use crate::chain::{Posterior, PosteriorSample};
use crate::data::ItemGroups;
use crate::error::{DdtLcmError, Result};
use crate::relabel::relabel_permutations;
use crate::tree::DiffusionTree;
use log::info;
use ndarray::Array2;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lower and upper probabilities of the reported credible intervals.
pub const INTERVAL: (f64, f64) = (0.025, 0.975);

/// Posterior mean with a 95% equal-tailed credible interval.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Interval {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    /// Summarize draws of one scalar. `values` must be non-empty.
    fn from_draws(mut values: Vec<f64>) -> Self {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        values.sort_unstable_by(f64::total_cmp);
        Self {
            mean,
            lower: quantile_sorted(&values, INTERVAL.0),
            upper: quantile_sorted(&values, INTERVAL.1),
        }
    }
}

/// One row of the `K × J` response-probability table.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResponseProbRow {
    pub class: usize,
    pub item: usize,
    /// Index of the item's group.
    pub group: usize,
    /// Posterior mean of `P(y_ij = 1 | z_i = class)`.
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

/// One row of the class-probability table.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClassProbRow {
    pub class: usize,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Diffusion variance of one item group.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VarianceRow {
    /// Group name.
    pub group: String,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Settings the summary was computed under.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SummaryConfig {
    pub n_classes: usize,
    pub burnin: usize,
    pub total_iters: usize,
    pub relabeled: bool,
    pub groups: ItemGroups,
}

/// Posterior summary of one chain.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PosteriorSummary {
    /// `K·J` rows, class-major.
    pub response_probs_summary: Vec<ResponseProbRow>,
    /// One row per class.
    pub class_probs_summary: Vec<ClassProbRow>,
    /// One row per item group.
    pub diffusion_variance_summary: Vec<VarianceRow>,
    pub divergence_summary: Interval,
    /// Tree of the retained sample with the highest log posterior.
    pub map_tree: DiffusionTree,
    /// Iteration the MAP tree was recorded at.
    pub map_iteration: usize,
    pub map_log_posterior: f64,
    /// Samples left after burn-in.
    pub n_retained: usize,
    pub config: SummaryConfig,
}

impl Posterior {
    /// Retained samples `samples[burnin..]`, relabeled onto a common labeling when
    /// `relabel` is set, with the position of the MAP sample among them.
    ///
    /// # Errors
    /// [`DdtLcmError::Usage`] if `burnin` leaves no samples.
    pub fn aligned_samples(
        &self,
        burnin: usize,
        relabel: bool,
    ) -> Result<(Vec<PosteriorSample>, usize)> {
        if burnin >= self.len() {
            return Err(DdtLcmError::Usage(format!(
                "burn-in {burnin} leaves no samples out of {}",
                self.len()
            )));
        }
        let retained = &self.samples()[burnin..];
        let map_index = retained
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.log_posterior().total_cmp(&b.log_posterior()))
            .map_or(0, |(i, _)| i);

        let aligned = if relabel {
            relabel_permutations(retained, map_index)?
                .iter()
                .zip(retained)
                .map(|(perm, s)| s.permuted(perm))
                .collect::<Result<Vec<_>>>()?
        } else {
            retained.to_vec()
        };
        Ok((aligned, map_index))
    }

    /// Summarize the samples after `burnin`, optionally correcting label switching.
    ///
    /// # Arguments
    /// * `burnin` - Number of leading samples to discard
    /// * `relabel` - Align the retained samples to the MAP labeling before averaging
    ///
    /// # Returns
    /// Means and 95% intervals of the response probabilities, class probabilities,
    /// diffusion variances and `c`, with the MAP tree.
    ///
    /// # Errors
    /// [`DdtLcmError::Usage`] if `burnin >= self.len()`.
    pub fn summarize(&self, burnin: usize, relabel: bool) -> Result<PosteriorSummary> {
        let (samples, map_index) = self.aligned_samples(burnin, relabel)?;
        let k = self.config().n_classes;
        let groups = self.groups();
        let thetas: Vec<Array2<f64>> = samples
            .iter()
            .map(PosteriorSample::response_probs)
            .collect();

        let mut response_probs_summary = Vec::with_capacity(k * groups.n_items());
        for class in 0..k {
            for item in 0..groups.n_items() {
                let iv = Interval::from_draws(thetas.iter().map(|t| t[[class, item]]).collect());
                response_probs_summary.push(ResponseProbRow {
                    class,
                    item,
                    group: groups.group_of(item),
                    mean: iv.mean,
                    lower: iv.lower,
                    upper: iv.upper,
                });
            }
        }

        let class_probs_summary = (0..k)
            .map(|class| {
                let draws = samples.iter().map(|s| s.class_probs[class]).collect();
                let iv = Interval::from_draws(draws);
                ClassProbRow {
                    class,
                    mean: iv.mean,
                    lower: iv.lower,
                    upper: iv.upper,
                }
            })
            .collect();

        let diffusion_variance_summary = groups
            .names()
            .iter()
            .enumerate()
            .map(|(g, name)| {
                let draws = samples.iter().map(|s| s.diffusion_variances[g]).collect();
                let iv = Interval::from_draws(draws);
                VarianceRow {
                    group: name.clone(),
                    mean: iv.mean,
                    lower: iv.lower,
                    upper: iv.upper,
                }
            })
            .collect();

        let divergences = samples.iter().map(|s| s.divergence).collect();
        let map = &samples[map_index];
        info!(
            "summarized {} samples after burn-in {burnin}; MAP at iteration {}",
            samples.len(),
            map.iteration
        );
        Ok(PosteriorSummary {
            response_probs_summary,
            class_probs_summary,
            diffusion_variance_summary,
            divergence_summary: Interval::from_draws(divergences),
            map_tree: map.tree.clone(),
            map_iteration: map.iteration,
            map_log_posterior: map.log_posterior(),
            n_retained: samples.len(),
            config: SummaryConfig {
                n_classes: k,
                burnin,
                total_iters: self.config().total_iters,
                relabeled: relabel,
                groups: groups.clone(),
            },
        })
    }
}

impl PosteriorSummary {
    /// Posterior mean response probabilities, `K × J`.
    pub fn response_prob_means(&self) -> Array2<f64> {
        let k = self.config.n_classes;
        let j = self.config.groups.n_items();
        let mut out = Array2::zeros((k, j));
        for row in &self.response_probs_summary {
            out[[row.class, row.item]] = row.mean;
        }
        out
    }

    /// Posterior mean class probabilities.
    pub fn class_prob_means(&self) -> Vec<f64> {
        self.class_probs_summary.iter().map(|r| r.mean).collect()
    }

    /// Print a summary of the posterior
    pub fn summary(&self) {
        println!(
            "{} retained samples (burn-in {} of {}), MAP at iteration {} (log posterior {:.3})",
            self.n_retained,
            self.config.burnin,
            self.config.total_iters,
            self.map_iteration,
            self.map_log_posterior
        );
        println!("MAP tree: {}", self.map_tree.newick());
        println!();

        println!(
            "{:<10} {:<12} {:<12} {:<12}",
            "Class", "Mean", "2.5%", "97.5%"
        );
        println!("{}", "-".repeat(46));
        for row in &self.class_probs_summary {
            println!(
                "{:<10} {:<12.4} {:<12.4} {:<12.4}",
                format!("π{}", row.class),
                row.mean,
                row.lower,
                row.upper
            );
        }
        println!();

        println!(
            "{:<16} {:<12} {:<12} {:<12}",
            "Group", "Mean", "2.5%", "97.5%"
        );
        println!("{}", "-".repeat(52));
        for row in &self.diffusion_variance_summary {
            println!(
                "{:<16} {:<12.4} {:<12.4} {:<12.4}",
                row.group, row.mean, row.lower, row.upper
            );
        }
        let c = &self.divergence_summary;
        println!(
            "{:<16} {:<12.4} {:<12.4} {:<12.4}",
            "c", c.mean, c.lower, c.upper
        );
        println!();

        println!(
            "{:<8} {:<8} {:<8} {:<12} {:<12} {:<12}",
            "Class", "Item", "Group", "Mean", "2.5%", "97.5%"
        );
        println!("{}", "-".repeat(64));
        for row in &self.response_probs_summary {
            println!(
                "{:<8} {:<8} {:<8} {:<12.4} {:<12.4} {:<12.4}",
                row.class, row.item, row.group, row.mean, row.lower, row.upper
            );
        }
    }
}

/// Quantile of sorted draws by linear interpolation between order statistics.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    let idx = (q * (n - 1) as f64).clamp(0.0, (n - 1) as f64);
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}
