//! Gibbs updates of the latent class model given the tree.
//!
//! # Model
//! - Likelihood: \( y_{ij} \mid z_i = k \sim \mathrm{Bernoulli}(\sigma(x_{kj})) \), with
//!   \( x_k \) the location of leaf \( k \).
//! - Leaf prior: \( x_{kj} \mid x_{\mathrm{pa}(k)} \sim \mathcal{N}(x_{\mathrm{pa}(k),j},
//!   \sigma^2_{g(j)} (1 - t_{\mathrm{pa}(k)})) \).
//! - Augmentation: \( \omega_{kj} \sim \mathrm{PG}(n_{kj}, x_{kj}) \), the sum of one
//!   \( \mathrm{PG}(1, x_{kj}) \) per subject of class \( k \) observed on item \( j \).
//!
//! One sweep draws, in order: \( \omega \), leaf locations, diffusion variances, the
//! divergence parameter (when it has a Gamma prior), class probabilities and class
//! assignments.
//!
//! # References
//! - Polson, N. G., Scott, J. G., & Windle, J. (2013). Bayesian inference for logistic models
//!   using Pólya–Gamma latent variables. Journal of the American Statistical Association.
//! - Li, M., Wu, Z., et al. (2023). Tree-regularized Bayesian latent class analysis for
//!   improving weakly separated dietary pattern subtyping in small-sized subpopulations.

use crate::PolyaGamma;
use crate::chain::ChainState;
use crate::config::{DdtLcmConfig, DivergencePrior, VariancePriors};
use crate::data::{ClassItemCounts, ItemGroups, Responses, log_sum_exp};
use crate::error::{DdtLcmError, Result, dist_err};
use crate::tree::DiffusionTree;
use crate::tree::prior::{self, DiffusionVariances, DivergenceFunction};
use ndarray::Array2;
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use statrs::distribution::{Gamma, InverseGamma, Normal};

/// Full conditionals of the LCM parameters for one data set.
#[derive(Debug, Clone)]
pub struct LcmGibbs<'a> {
    responses: &'a Responses,
    groups: &'a ItemGroups,
    config: &'a DdtLcmConfig,
    /// Reusable Polya-Gamma sampler
    pg: PolyaGamma,
}

impl<'a> LcmGibbs<'a> {
    pub fn new(responses: &'a Responses, groups: &'a ItemGroups, config: &'a DdtLcmConfig) -> Self {
        Self {
            responses,
            groups,
            config,
            pg: PolyaGamma::new(),
        }
    }

    /// One systematic-scan sweep over every LCM parameter, updating `state` in place.
    pub fn sweep<R: Rng + ?Sized>(&self, state: &mut ChainState, rng: &mut R) -> Result<()> {
        let k = self.config.n_classes;
        let counts = self.responses.class_item_counts(&state.assignments, k);

        let omega = self.draw_auxiliary(&state.tree, &counts, rng)?;
        self.update_leaf_locations(&mut state.tree, &omega, &counts, &state.variances, rng)?;
        state.variances = self.draw_variances(&state.tree, rng)?;
        if let Some(divergence) = self.draw_divergence(&state.tree, rng)? {
            state.divergence = divergence;
        }
        state.class_probs = self.draw_class_probs(&state.assignments, rng)?;
        state.assignments = self.draw_assignments(&state.tree, &state.class_probs, rng)?;
        Ok(())
    }

    /// `ω_kj ~ PG(n_kj, x_kj)`; classes with no observations on an item get 0.
    pub fn draw_auxiliary<R: Rng + ?Sized>(
        &self,
        tree: &DiffusionTree,
        counts: &ClassItemCounts,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        let mut omega = Array2::zeros(counts.observed.raw_dim());
        for ((k, j), w) in omega.indexed_iter_mut() {
            *w = self
                .pg
                .draw(rng, counts.observed[[k, j]], tree.node(k).location[j])?;
        }
        Ok(omega)
    }

    /// Conjugate Normal update of every leaf location given `ω` and the parent location.
    pub fn update_leaf_locations<R: Rng + ?Sized>(
        &self,
        tree: &mut DiffusionTree,
        omega: &Array2<f64>,
        counts: &ClassItemCounts,
        variances: &DiffusionVariances,
        rng: &mut R,
    ) -> Result<()> {
        let std_norm = Normal::standard();
        for leaf in tree.leaves() {
            let pa = tree.parent_of(leaf)?;
            let len = 1.0 - tree.node(pa).time;
            let parent_loc = tree.node(pa).location.clone();
            let location = &mut tree.node_mut(leaf).location;
            for j in 0..location.len() {
                let prior_var = variances.for_item(self.groups, j) * len;
                if prior_var <= 0.0 {
                    location[j] = parent_loc[j];
                    continue;
                }
                let kappa = counts.positive[[leaf, j]] - 0.5 * counts.observed[[leaf, j]];
                let var = 1.0 / (omega[[leaf, j]] + 1.0 / prior_var);
                let mean = var * (kappa + parent_loc[j] / prior_var);
                location[j] = mean + var.sqrt() * rng.sample(&std_norm);
            }
        }
        Ok(())
    }

    /// `σ²_g ~ InvGamma(a_g + E |J_g| / 2, b_g + Σ_edges Σ_{j∈g} (Δx_j)² / (2 len))`.
    pub fn draw_variances<R: Rng + ?Sized>(
        &self,
        tree: &DiffusionTree,
        rng: &mut R,
    ) -> Result<DiffusionVariances> {
        let n_edges = tree.edges().len() as f64;
        let sums = prior::scaled_increment_sums(tree, self.groups);
        let values = sums
            .iter()
            .enumerate()
            .map(|(g, &sum)| {
                let p = self.config.variance_prior.for_group(g);
                let shape = p.shape + 0.5 * n_edges * self.groups.items(g).len() as f64;
                let dist = InverseGamma::new(shape, p.rate + sum)
                    .map_err(dist_err("diffusion variance posterior"))?;
                Ok(rng.sample(&dist))
            })
            .collect::<Result<Vec<f64>>>()?;
        DiffusionVariances::new(values)
    }

    /// `c ~ Gamma(a_c + K - 1, b_c + Σ_v H_{m_v-1} ln((1 - t_u) / (1 - t_v)))`, or
    /// `None` when `c` is fixed.
    pub fn draw_divergence<R: Rng + ?Sized>(
        &self,
        tree: &DiffusionTree,
        rng: &mut R,
    ) -> Result<Option<DivergenceFunction>> {
        let DivergencePrior::Gamma { shape, rate, .. } = self.config.divergence else {
            return Ok(None);
        };
        let stat = prior::divergence_statistic(tree)?;
        let n_branching = tree.branching_nodes().len() as f64;
        let dist = Gamma::new(shape + n_branching, rate + stat)
            .map_err(dist_err("divergence posterior"))?;
        DivergenceFunction::new(rng.sample(&dist)).map(Some)
    }

    /// `π ~ Dirichlet(α + class sizes)` via normalized Gamma draws.
    pub fn draw_class_probs<R: Rng + ?Sized>(
        &self,
        assignments: &[usize],
        rng: &mut R,
    ) -> Result<Vec<f64>> {
        let mut sizes = vec![0.0; self.config.n_classes];
        for &z in assignments {
            sizes[z] += 1.0;
        }
        draw_dirichlet(&sizes, self.config.class_concentration, rng)
    }

    /// `z_i ~ Categorical(π_k p(y_i | k))` over observed items. A subject with no
    /// observed items is drawn from `π`.
    pub fn draw_assignments<R: Rng + ?Sized>(
        &self,
        tree: &DiffusionTree,
        class_probs: &[f64],
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        let probs = tree.leaf_log_probs();
        let log_pi: Vec<f64> = class_probs.iter().map(|p| p.ln()).collect();
        (0..self.responses.n_subjects())
            .map(|i| {
                let log_w: Vec<f64> = self
                    .responses
                    .subject_log_likelihoods(i, &probs)
                    .iter()
                    .zip(&log_pi)
                    .map(|(ll, lp)| ll + lp)
                    .collect();
                sample_log_weights(&log_w, rng)
            })
            .collect()
    }
}

/// Draw from `Dirichlet(alpha + counts)`.
///
/// The Gamma draws are taken on the log scale: a shape `s < 1` uses
/// `ln G(s + 1) + ln(U) / s`, so sparse classes with a small `alpha` do not underflow to
/// zero. Each probability is floored at `f64::MIN_POSITIVE`.
pub(crate) fn draw_dirichlet<R: Rng + ?Sized>(
    counts: &[f64],
    alpha: f64,
    rng: &mut R,
) -> Result<Vec<f64>> {
    let log_draws = counts
        .iter()
        .map(|&n| log_gamma_draw(alpha + n, rng))
        .collect::<Result<Vec<f64>>>()?;
    let log_total = log_sum_exp(&log_draws);
    if !log_total.is_finite() {
        return Err(DdtLcmError::numeric(format!(
            "Dirichlet draw log normalizer is {log_total}"
        )));
    }
    Ok(log_draws
        .iter()
        .map(|lg| (lg - log_total).exp().max(f64::MIN_POSITIVE))
        .collect())
}

/// `ln G` for `G ~ Gamma(shape, 1)`.
fn log_gamma_draw<R: Rng + ?Sized>(shape: f64, rng: &mut R) -> Result<f64> {
    if shape >= 1.0 {
        let dist = Gamma::new(shape, 1.0).map_err(dist_err("class probability posterior"))?;
        return Ok(rng.sample(&dist).ln());
    }
    let dist = Gamma::new(shape + 1.0, 1.0).map_err(dist_err("class probability posterior"))?;
    let g = rng.sample(&dist);
    // u in (0, 1]
    let u = 1.0 - rng.r#gen::<f64>();
    Ok(g.ln() + u.ln() / shape)
}

/// Index drawn with probability proportional to `exp(log_w)`.
pub(crate) fn sample_log_weights<R: Rng + ?Sized>(log_w: &[f64], rng: &mut R) -> Result<usize> {
    let max = log_w.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return Err(DdtLcmError::numeric(format!(
            "class weights have maximum log weight {max}"
        )));
    }
    let weights: Vec<f64> = log_w.iter().map(|w| (w - max).exp()).collect();
    let dist = WeightedIndex::new(&weights).map_err(dist_err("class assignment weights"))?;
    Ok(dist.sample(rng))
}

/// `ln Dir(π; α 1)`; terms with `α = 1` vanish, so zero entries are fine then.
pub(crate) fn dirichlet_ln_pdf(probs: &[f64], alpha: f64) -> f64 {
    use statrs::function::gamma::ln_gamma;
    let k = probs.len() as f64;
    let norm = ln_gamma(alpha * k) - k * ln_gamma(alpha);
    if alpha == 1.0 {
        return norm;
    }
    norm + (alpha - 1.0) * probs.iter().map(|p| p.ln()).sum::<f64>()
}

/// `Σ_g ln InvGamma(σ²_g; a_g, b_g)`.
pub(crate) fn variance_prior_ln_pdf(
    variances: &DiffusionVariances,
    priors: &VariancePriors,
) -> Result<f64> {
    use statrs::distribution::Continuous;
    variances
        .as_slice()
        .iter()
        .enumerate()
        .map(|(g, &v)| {
            let p = priors.for_group(g);
            let dist =
                InverseGamma::new(p.shape, p.rate).map_err(dist_err("diffusion variance prior"))?;
            Ok(dist.ln_pdf(v))
        })
        .sum()
}

/// `ln Gamma(c; a_c, b_c)` for a sampled `c`, 0 for a fixed one.
pub(crate) fn divergence_prior_ln_pdf(
    divergence: &DivergenceFunction,
    prior: &DivergencePrior,
) -> Result<f64> {
    use statrs::distribution::Continuous;
    match *prior {
        DivergencePrior::Fixed(_) => Ok(0.0),
        DivergencePrior::Gamma { shape, rate, .. } => {
            let dist = Gamma::new(shape, rate).map_err(dist_err("divergence prior"))?;
            Ok(dist.ln_pdf(divergence.c()))
        }
    }
}
