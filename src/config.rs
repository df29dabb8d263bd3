//! Sampler configuration and hyperparameters.

use crate::error::{DdtLcmError, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Prior on the divergence parameter `c` of `a(t) = c / (1 - t)`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DivergencePrior {
    /// `c` is held at this value for the whole run.
    Fixed(f64),
    /// `c ~ Gamma(shape, rate)`, resampled every iteration from its conjugate
    /// posterior and started at `initial`.
    Gamma { shape: f64, rate: f64, initial: f64 },
}

impl DivergencePrior {
    pub fn initial(&self) -> f64 {
        match *self {
            DivergencePrior::Fixed(c) => c,
            DivergencePrior::Gamma { initial, .. } => initial,
        }
    }
}

/// `InvGamma(shape, rate)` prior on one diffusion variance.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InverseGammaPrior {
    pub shape: f64,
    pub rate: f64,
}

/// Diffusion-variance priors, shared by all groups or given per group.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VariancePriors {
    Shared(InverseGammaPrior),
    PerGroup(Vec<InverseGammaPrior>),
}

impl VariancePriors {
    pub fn for_group(&self, group: usize) -> InverseGammaPrior {
        match self {
            VariancePriors::Shared(p) => *p,
            VariancePriors::PerGroup(ps) => ps[group],
        }
    }
}

/// Configuration of one chain.
///
/// Defaults from [`DdtLcmConfig::new`]:
/// - `c ~ Gamma(1, 1)`, started at 1;
/// - every diffusion variance `~ InvGamma(3, 1)`, started at 1;
/// - symmetric Dirichlet concentration 1 on the class probabilities;
/// - seed 42, no progress bar.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DdtLcmConfig {
    /// Number of latent classes `K` (tree leaves).
    pub n_classes: usize,
    /// Number of MCMC iterations to run.
    pub total_iters: usize,
    pub seed: u64,
    pub divergence: DivergencePrior,
    pub variance_prior: VariancePriors,
    /// Starting value of every diffusion variance.
    pub initial_variance: f64,
    /// Symmetric Dirichlet concentration on the class probabilities.
    pub class_concentration: f64,
    pub show_progress: bool,
}

impl DdtLcmConfig {
    pub fn new(n_classes: usize, total_iters: usize) -> Self {
        Self {
            n_classes,
            total_iters,
            seed: 42,
            divergence: DivergencePrior::Gamma {
                shape: 1.0,
                rate: 1.0,
                initial: 1.0,
            },
            variance_prior: VariancePriors::Shared(InverseGammaPrior {
                shape: 3.0,
                rate: 1.0,
            }),
            initial_variance: 1.0,
            class_concentration: 1.0,
            show_progress: false,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_divergence(mut self, divergence: DivergencePrior) -> Self {
        self.divergence = divergence;
        self
    }

    pub fn with_variance_prior(mut self, prior: VariancePriors) -> Self {
        self.variance_prior = prior;
        self
    }

    pub fn with_initial_variance(mut self, variance: f64) -> Self {
        self.initial_variance = variance;
        self
    }

    pub fn with_class_concentration(mut self, alpha: f64) -> Self {
        self.class_concentration = alpha;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Check the configuration against a data set with `n_groups` item groups.
    pub fn validate(&self, n_groups: usize) -> Result<()> {
        if self.n_classes < 2 {
            return Err(DdtLcmError::invalid(format!(
                "need at least 2 latent classes, got {}",
                self.n_classes
            )));
        }
        if self.total_iters == 0 {
            return Err(DdtLcmError::invalid("total_iters must be positive"));
        }
        match self.divergence {
            DivergencePrior::Fixed(c) => positive("divergence parameter c", c)?,
            DivergencePrior::Gamma {
                shape,
                rate,
                initial,
            } => {
                positive("divergence prior shape", shape)?;
                positive("divergence prior rate", rate)?;
                positive("initial divergence parameter", initial)?;
            }
        }
        if let VariancePriors::PerGroup(ps) = &self.variance_prior {
            if ps.len() != n_groups {
                return Err(DdtLcmError::invalid(format!(
                    "{} variance priors for {n_groups} item groups",
                    ps.len()
                )));
            }
        }
        for g in 0..n_groups {
            let p = self.variance_prior.for_group(g);
            positive("variance prior shape", p.shape)?;
            positive("variance prior rate", p.rate)?;
        }
        positive("initial diffusion variance", self.initial_variance)?;
        positive("class concentration", self.class_concentration)?;
        Ok(())
    }
}

fn positive(what: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DdtLcmError::invalid(format!(
            "{what} must be positive and finite, got {value}"
        )))
    }
}
