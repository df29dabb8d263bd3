//! Error taxonomy for model fitting.

use thiserror::Error;

/// Errors raised while validating inputs, sampling, or summarizing a chain.
///
/// Degenerate tree proposals are not errors: they are rejected inside the
/// Metropolis-Hastings step and counted in [`RunStats`](crate::chain::RunStats).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DdtLcmError {
    /// Malformed data, configuration, or hyperparameters. Raised before any iteration runs.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A quantity left its mathematical domain (negative variance, divergence time
    /// outside `[0, 1)`, non-finite log density of the current state).
    #[error("numeric domain error: {0}")]
    NumericDomain(String),

    /// The caller asked for something the posterior cannot provide, such as a burn-in
    /// that leaves no retained samples.
    #[error("usage error: {0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, DdtLcmError>;

impl DdtLcmError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn numeric(msg: impl Into<String>) -> Self {
        Self::NumericDomain(msg.into())
    }
}

/// Turn a statrs constructor failure into a numeric-domain error.
pub(crate) fn dist_err<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> DdtLcmError {
    move |e| DdtLcmError::NumericDomain(format!("{what}: {e}"))
}
