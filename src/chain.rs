//! Chain driver: state, iteration loop, and the recorded posterior samples.
//!
//! Every iteration runs
//! 1. a Metropolis-Hastings topology move on the diffusion tree, followed by a Gibbs
//!    refresh of the branching-node locations;
//! 2. a Polya-Gamma augmented Gibbs sweep over the latent class model
//!    ([`LcmGibbs::sweep`]);
//! 3. a snapshot of the full state into a [`PosteriorSample`].
//!
//! The random number generator is owned by the chain and threaded explicitly through
//! every draw, so a run is a pure function of its data, configuration and seed.

use crate::config::DdtLcmConfig;
use crate::data::{ItemGroups, ResponseData};
use crate::error::{DdtLcmError, Result};
use crate::gibbs::{
    LcmGibbs, draw_dirichlet, dirichlet_ln_pdf, divergence_prior_ln_pdf, variance_prior_ln_pdf,
};
use crate::tree::DiffusionTree;
use crate::tree::prior::{DiffusionVariances, DivergenceFunction};
use crate::tree::proposal::{
    DiffusionParams, TreeMove, propose_and_accept, refresh_branch_locations, sample_prior_tree,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Warn when more than this share of tree proposals were degenerate.
const DEGENERATE_WARN_RATE: f64 = 0.25;

/// The full Markov chain state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChainState {
    pub tree: DiffusionTree,
    /// One σ² per item group.
    pub variances: DiffusionVariances,
    pub divergence: DivergenceFunction,
    /// π, one entry per class.
    pub class_probs: Vec<f64>,
    /// Zero-based class label per subject.
    pub assignments: Vec<usize>,
}

impl ChainState {
    /// Random initial state: a tree from the DDT prior at the initial hyperparameters,
    /// class probabilities from their Dirichlet prior, and assignments drawn from
    /// their full conditional given both.
    pub fn initialize<R: Rng + ?Sized>(
        data: &ResponseData,
        config: &DdtLcmConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let groups = data.groups();
        let divergence = DivergenceFunction::new(config.divergence.initial())?;
        let variances = DiffusionVariances::new(vec![config.initial_variance; groups.n_groups()])?;
        let params = DiffusionParams {
            divergence,
            variances: &variances,
            groups,
        };
        let tree = sample_prior_tree(config.n_classes, &params, rng)?;
        let class_probs = draw_dirichlet(
            &vec![0.0; config.n_classes],
            config.class_concentration,
            rng,
        )?;
        let assignments = LcmGibbs::new(data.responses(), groups, config)
            .draw_assignments(&tree, &class_probs, rng)?;
        Ok(Self {
            tree,
            variances,
            divergence,
            class_probs,
            assignments,
        })
    }

    /// Check a user-supplied state against the data and configuration. Diffusion
    /// variances and class probabilities must be strictly positive.
    pub fn validate(&self, data: &ResponseData, config: &DdtLcmConfig) -> Result<()> {
        self.tree.validate()?;
        let k = config.n_classes;
        if self.tree.n_leaves() != k || self.tree.n_items() != data.n_items() {
            return Err(DdtLcmError::invalid(format!(
                "tree has {} leaves over {} items, expected {k} over {}",
                self.tree.n_leaves(),
                self.tree.n_items(),
                data.n_items()
            )));
        }
        if self.variances.len() != data.groups().n_groups() {
            return Err(DdtLcmError::invalid(format!(
                "{} diffusion variances for {} item groups",
                self.variances.len(),
                data.groups().n_groups()
            )));
        }
        if let Some(v) = self.variances.as_slice().iter().find(|&&v| v <= 0.0) {
            return Err(DdtLcmError::invalid(format!(
                "initial diffusion variances must be positive, got {v}"
            )));
        }
        let total: f64 = self.class_probs.iter().sum();
        if self.class_probs.len() != k
            || self.class_probs.iter().any(|&p| !(p > 0.0 && p <= 1.0))
            || (total - 1.0).abs() > 1e-8
        {
            return Err(DdtLcmError::invalid(format!(
                "class probabilities {:?} are not a distribution over {k} classes",
                self.class_probs
            )));
        }
        if self.assignments.len() != data.n_subjects()
            || self.assignments.iter().any(|&z| z >= k)
        {
            return Err(DdtLcmError::invalid(format!(
                "need one class label in 0..{k} per subject ({} subjects)",
                data.n_subjects()
            )));
        }
        Ok(())
    }

    /// DDT prior of the tree plus the hyperpriors on σ², π and c.
    pub fn log_prior(&self, groups: &ItemGroups, config: &DdtLcmConfig) -> Result<f64> {
        let params = DiffusionParams {
            divergence: self.divergence,
            variances: &self.variances,
            groups,
        };
        let tree = params.log_prior(&self.tree)?;
        let variances = variance_prior_ln_pdf(&self.variances, &config.variance_prior)?;
        let class_probs = dirichlet_ln_pdf(&self.class_probs, config.class_concentration);
        let divergence = divergence_prior_ln_pdf(&self.divergence, &config.divergence)?;
        Ok(tree + variances + class_probs + divergence)
    }
}

/// Snapshot of the chain after one completed iteration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PosteriorSample {
    /// Zero-based iteration this snapshot was taken after.
    pub iteration: usize,
    pub tree: DiffusionTree,
    /// One σ² per item group.
    pub diffusion_variances: Vec<f64>,
    /// The divergence parameter `c`.
    pub divergence: f64,
    pub class_probs: Vec<f64>,
    /// Zero-based class label per subject.
    pub assignments: Vec<usize>,
    /// Log prior of the full state, see [`ChainState::log_prior`].
    pub log_prior: f64,
    /// Marginal LCM log likelihood, class assignments summed out.
    pub log_likelihood: f64,
}

impl PosteriorSample {
    /// Unnormalized log posterior, the MAP criterion.
    pub fn log_posterior(&self) -> f64 {
        self.log_prior + self.log_likelihood
    }

    /// `K × J` leaf response probabilities.
    pub fn response_probs(&self) -> Array2<f64> {
        self.tree.leaf_response_probs()
    }

    /// Relabel classes: class `k` becomes class `perm[k]`.
    pub fn permuted(&self, perm: &[usize]) -> Result<Self> {
        let tree = self.tree.permute_leaves(perm)?;
        let mut class_probs = vec![0.0; self.class_probs.len()];
        for (k, &p) in self.class_probs.iter().enumerate() {
            class_probs[perm[k]] = p;
        }
        Ok(Self {
            iteration: self.iteration,
            tree,
            diffusion_variances: self.diffusion_variances.clone(),
            divergence: self.divergence,
            class_probs,
            assignments: self.assignments.iter().map(|&z| perm[z]).collect(),
            log_prior: self.log_prior,
            log_likelihood: self.log_likelihood,
        })
    }
}

/// Tree-move diagnostics accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunStats {
    pub iterations: usize,
    /// Accepted tree moves.
    pub accepted: usize,
    /// Rejected tree moves.
    pub rejected: usize,
    /// Tree proposals discarded before the acceptance ratio, see [`TreeMove::Degenerate`].
    pub degenerate: usize,
    /// Wall-clock time spent sampling.
    pub elapsed: Duration,
}

impl RunStats {
    fn record(&mut self, tree_move: &TreeMove) {
        self.iterations += 1;
        match tree_move {
            TreeMove::Accepted { .. } => self.accepted += 1,
            TreeMove::Rejected { .. } => self.rejected += 1,
            TreeMove::Degenerate => self.degenerate += 1,
        }
    }

    /// Share of iterations whose tree move was accepted.
    pub fn acceptance_rate(&self) -> f64 {
        ratio(self.accepted, self.iterations)
    }

    /// Share of iterations whose tree proposal was degenerate.
    pub fn degenerate_rate(&self) -> f64 {
        ratio(self.degenerate, self.iterations)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} iterations in {:.2?}, tree acceptance {:.1}%, {} degenerate proposals",
            self.iterations,
            self.elapsed,
            100.0 * self.acceptance_rate(),
            self.degenerate
        )
    }
}

/// Recorded samples of a finished (or aborted) chain. Read-only.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Posterior {
    samples: Vec<PosteriorSample>,
    config: DdtLcmConfig,
    groups: ItemGroups,
    run_stats: RunStats,
}

impl Posterior {
    /// Samples in iteration order.
    pub fn samples(&self) -> &[PosteriorSample] {
        &self.samples
    }

    /// Number of completed iterations.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the run stopped before its first iteration.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Configuration the chain ran with.
    pub fn config(&self) -> &DdtLcmConfig {
        &self.config
    }

    /// Item groups of the fitted data.
    pub fn groups(&self) -> &ItemGroups {
        &self.groups
    }

    /// Tree-move diagnostics of the run.
    pub fn run_stats(&self) -> &RunStats {
        &self.run_stats
    }
}

/// Tree-regularized Bayesian latent class model sampler.
///
/// # Type Parameters
/// * `R` - The random number generator type (defaults to `ChaCha8Rng`)
///
/// # Example
/// ```rust
/// use ddt_lcm::{DdtLcm, DdtLcmConfig, ItemGroups, ResponseData};
/// use ndarray::Array2;
///
/// let y = Array2::from_shape_fn((40, 6), |(i, j)| ((i < 20) ^ (j < 3)) as u8 as f64);
/// let groups = ItemGroups::new(vec!["a".into(), "b".into()], vec![0, 0, 0, 1, 1, 1])?;
/// let data = ResponseData::new(&y, groups)?;
///
/// let posterior = DdtLcm::new(data, DdtLcmConfig::new(2, 20))?.fit()?;
/// let summary = posterior.summarize(10, true)?;
/// assert_eq!(summary.response_probs_summary.len(), 2 * 6);
/// # Ok::<(), ddt_lcm::DdtLcmError>(())
/// ```
#[derive(Debug, Clone)]
pub struct DdtLcm<R = ChaCha8Rng> {
    data: ResponseData,
    config: DdtLcmConfig,
    state: ChainState,
    rng: R,
    samples: Vec<PosteriorSample>,
    stats: RunStats,
}

impl DdtLcm<ChaCha8Rng> {
    /// Validate inputs and draw a random initial state, seeded from `config.seed`.
    ///
    /// # Arguments
    /// * `data` - Binary responses with their item groups
    /// * `config` - Sampler configuration; `n_classes` fixes the number of tree leaves
    ///
    /// # Returns
    /// A chain ready to [`step`](DdtLcm::step) or [`fit`](DdtLcm::fit), with no samples yet.
    ///
    /// # Errors
    /// [`DdtLcmError::InvalidInput`] if the configuration does not fit the data.
    pub fn new(data: ResponseData, config: DdtLcmConfig) -> Result<Self> {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self::from_rng(rng, data, config)
    }
}

impl<R: Rng> DdtLcm<R> {
    /// Like [`DdtLcm::new`], drawing everything from `rng` instead.
    pub fn from_rng(mut rng: R, data: ResponseData, config: DdtLcmConfig) -> Result<Self> {
        config.validate(data.groups().n_groups())?;
        let state = ChainState::initialize(&data, &config, &mut rng)?;
        Ok(Self {
            data,
            config,
            state,
            rng,
            samples: Vec::new(),
            stats: RunStats::default(),
        })
    }

    /// Replace the random initial state before the first iteration.
    pub fn with_initial_state(mut self, state: ChainState) -> Result<Self> {
        if !self.samples.is_empty() {
            return Err(DdtLcmError::Usage(
                "the initial state can only be set before the first iteration".into(),
            ));
        }
        state.validate(&self.data, &self.config)?;
        self.state = state;
        Ok(self)
    }

    /// Current chain state.
    pub fn state(&self) -> &ChainState {
        &self.state
    }

    /// Samples recorded so far.
    pub fn samples(&self) -> &[PosteriorSample] {
        &self.samples
    }

    /// Tree-move diagnostics so far.
    pub fn run_stats(&self) -> &RunStats {
        &self.stats
    }

    /// Run one full iteration and record its snapshot.
    ///
    /// # Errors
    /// [`DdtLcmError::Usage`] once `total_iters` iterations have run;
    /// [`DdtLcmError::NumericDomain`] if the state leaves its domain.
    pub fn step(&mut self) -> Result<&PosteriorSample> {
        let iteration = self.samples.len();
        if iteration >= self.config.total_iters {
            return Err(DdtLcmError::Usage(format!(
                "chain already ran its {} iterations",
                self.config.total_iters
            )));
        }

        let tree_move = {
            let params = DiffusionParams {
                divergence: self.state.divergence,
                variances: &self.state.variances,
                groups: self.data.groups(),
            };
            let responses = self.data.responses();
            let class_probs = &self.state.class_probs;
            let tree_move = propose_and_accept(
                &mut self.state.tree,
                &params,
                |tree| responses.marginal_log_likelihood(class_probs, &tree.leaf_log_probs()),
                &mut self.rng,
            )?;
            refresh_branch_locations(&mut self.state.tree, &params, &mut self.rng)?;
            tree_move
        };

        LcmGibbs::new(self.data.responses(), self.data.groups(), &self.config)
            .sweep(&mut self.state, &mut self.rng)?;
        self.stats.record(&tree_move);

        let sample = self.snapshot(iteration)?;
        debug!(
            "iteration {iteration}: tree move {tree_move:?}, log posterior {:.3}, c = {:.3}",
            sample.log_posterior(),
            sample.divergence
        );
        self.samples.push(sample);
        Ok(&self.samples[iteration])
    }

    fn snapshot(&self, iteration: usize) -> Result<PosteriorSample> {
        let log_prior = self.state.log_prior(self.data.groups(), &self.config)?;
        let log_likelihood = self
            .data
            .responses()
            .marginal_log_likelihood(&self.state.class_probs, &self.state.tree.leaf_log_probs());
        if !log_prior.is_finite() || !log_likelihood.is_finite() {
            return Err(DdtLcmError::numeric(format!(
                "iteration {iteration}: log prior {log_prior}, log likelihood {log_likelihood}"
            )));
        }
        Ok(PosteriorSample {
            iteration,
            tree: self.state.tree.clone(),
            diffusion_variances: self.state.variances.as_slice().to_vec(),
            divergence: self.state.divergence.c(),
            class_probs: self.state.class_probs.clone(),
            assignments: self.state.assignments.clone(),
            log_prior,
            log_likelihood,
        })
    }

    /// Run all remaining iterations.
    pub fn fit(self) -> Result<Posterior> {
        self.fit_until(&AtomicBool::new(false))
    }

    /// Run the remaining iterations, stopping early at the first iteration boundary
    /// where `abort` is set. Only completed iterations are kept.
    pub fn fit_until(mut self, abort: &AtomicBool) -> Result<Posterior> {
        let total = self.config.total_iters;
        info!(
            "fitting DDT-LCM: {} subjects, {} items in {} groups, {} classes, {} iterations",
            self.data.n_subjects(),
            self.data.n_items(),
            self.data.groups().n_groups(),
            self.config.n_classes,
            total
        );

        let pb = ProgressBar::new(total as u64).with_style(
            ProgressStyle::with_template("Sampling {bar:40} {pos}/{len} iterations ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        if !self.config.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        pb.set_position(self.samples.len() as u64);

        let start = Instant::now();
        while self.samples.len() < total {
            if abort.load(Ordering::Relaxed) {
                info!("abort requested after {} iterations", self.samples.len());
                break;
            }
            self.step()?;
            pb.inc(1);
        }
        pb.finish_and_clear();
        self.stats.elapsed += start.elapsed();

        info!("{}", self.stats);
        if self.stats.degenerate_rate() > DEGENERATE_WARN_RATE {
            warn!(
                "{:.1}% of tree proposals were degenerate",
                100.0 * self.stats.degenerate_rate()
            );
        }
        Ok(self.into_posterior())
    }

    /// Stop sampling and keep the samples recorded so far.
    pub fn into_posterior(self) -> Posterior {
        Posterior {
            samples: self.samples,
            config: self.config,
            groups: self.data.groups().clone(),
            run_stats: self.stats,
        }
    }
}

/// Run `n_chains` independent chains in parallel; chain `i` is seeded with
/// `config.seed + i`.
#[cfg(feature = "rayon")]
pub fn run_chains(
    data: &ResponseData,
    config: &DdtLcmConfig,
    n_chains: usize,
) -> Result<Vec<Posterior>> {
    use rayon::prelude::*;

    if n_chains == 0 {
        return Err(DdtLcmError::invalid("need at least one chain"));
    }
    (0..n_chains)
        .into_par_iter()
        .map(|i| {
            let config = config.clone().with_seed(config.seed.wrapping_add(i as u64));
            DdtLcm::new(data.clone(), config)?.fit()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::four_leaf_tree;
    use approx::assert_relative_eq;

    fn toy_data() -> ResponseData {
        let y = Array2::from_shape_fn((30, 4), |(i, j)| ((i % 4 == 0) ^ (j % 2 == 0)) as u8 as f64);
        ResponseData::new(&y, ItemGroups::single(4).unwrap()).unwrap()
    }

    #[test]
    fn step_records_one_sample_per_iteration() {
        let mut chain = DdtLcm::new(toy_data(), DdtLcmConfig::new(3, 5)).unwrap();
        for i in 0..5 {
            let s = chain.step().unwrap();
            assert_eq!(s.iteration, i);
            assert_relative_eq!(s.class_probs.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        }
        assert!(matches!(chain.step(), Err(DdtLcmError::Usage(_))));
        assert_eq!(chain.run_stats().iterations, 5);
    }

    #[test]
    fn abort_flag_stops_before_first_iteration() {
        let chain = DdtLcm::new(toy_data(), DdtLcmConfig::new(3, 50)).unwrap();
        let posterior = chain.fit_until(&AtomicBool::new(true)).unwrap();
        assert!(posterior.is_empty());
    }

    #[test]
    fn abort_mid_run_keeps_completed_iterations() {
        let mut chain = DdtLcm::new(toy_data(), DdtLcmConfig::new(3, 20)).unwrap();
        for _ in 0..4 {
            chain.step().unwrap();
        }
        let taken = chain.samples().to_vec();
        let posterior = chain.fit_until(&AtomicBool::new(true)).unwrap();
        assert_eq!(posterior.len(), 4);
        assert_eq!(posterior.samples(), &taken[..]);
        assert_eq!(posterior.run_stats().iterations, 4);
        assert!(posterior.summarize(2, true).is_ok());
    }

    #[test]
    fn run_stats_count_every_move_kind() {
        let mut stats = RunStats::default();
        stats.record(&TreeMove::Accepted { log_ratio: 0.5 });
        stats.record(&TreeMove::Rejected { log_ratio: -3.0 });
        stats.record(&TreeMove::Degenerate);
        stats.record(&TreeMove::Degenerate);
        assert_eq!(
            (stats.iterations, stats.accepted, stats.rejected, stats.degenerate),
            (4, 1, 1, 2)
        );
        assert_relative_eq!(stats.acceptance_rate(), 0.25);
        assert_relative_eq!(stats.degenerate_rate(), 0.5);
        assert!(stats.degenerate_rate() > DEGENERATE_WARN_RATE);
        assert!(stats.to_string().contains("2 degenerate proposals"));
    }

    #[test]
    fn initial_state_rejects_zero_variances_and_class_probs() {
        let data = toy_data();
        let config = DdtLcmConfig::new(3, 3);
        let chain = DdtLcm::new(data.clone(), config.clone()).unwrap();
        let state = chain.state().clone();

        let mut zero_var = state.clone();
        zero_var.variances = DiffusionVariances::new(vec![0.0]).unwrap();
        assert!(matches!(
            chain.with_initial_state(zero_var),
            Err(DdtLcmError::InvalidInput(_))
        ));

        let mut zero_prob = state;
        zero_prob.class_probs = vec![0.0, 0.5, 0.5];
        let chain = DdtLcm::new(data, config).unwrap();
        assert!(matches!(
            chain.with_initial_state(zero_prob),
            Err(DdtLcmError::InvalidInput(_))
        ));
    }

    #[test]
    fn initial_state_must_match_data() {
        let data = toy_data();
        let config = DdtLcmConfig::new(4, 3);
        let chain = DdtLcm::new(data.clone(), config.clone()).unwrap();
        let mut state = chain.state().clone();
        state.tree = four_leaf_tree(4);
        let chain = chain.with_initial_state(state.clone()).unwrap();
        assert_eq!(chain.state().tree, four_leaf_tree(4));

        let mut bad = state;
        bad.assignments[0] = 9;
        let chain = DdtLcm::new(data, config).unwrap();
        assert!(matches!(
            chain.with_initial_state(bad),
            Err(DdtLcmError::InvalidInput(_))
        ));
    }

    #[test]
    fn permuted_sample_moves_everything_consistently() {
        let mut chain = DdtLcm::new(toy_data(), DdtLcmConfig::new(3, 1)).unwrap();
        let s = chain.step().unwrap().clone();
        let perm = [2, 0, 1];
        let p = s.permuted(&perm).unwrap();
        let (theta, theta_p) = (s.response_probs(), p.response_probs());
        for k in 0..3 {
            assert_eq!(p.class_probs[perm[k]], s.class_probs[k]);
            assert_eq!(theta_p.row(perm[k]), theta.row(k));
        }
        for (z, zp) in s.assignments.iter().zip(&p.assignments) {
            assert_eq!(perm[*z], *zp);
        }
        assert_eq!(p.log_posterior(), s.log_posterior());
    }

    #[test]
    fn mismatched_config_is_rejected_before_sampling() {
        assert!(matches!(
            DdtLcm::new(toy_data(), DdtLcmConfig::new(1, 5)),
            Err(DdtLcmError::InvalidInput(_))
        ));
    }
}
