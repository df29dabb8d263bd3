//! Validated model inputs: the binary response matrix and the item-group partition.

use crate::error::{DdtLcmError, Result};
use nalgebra::DVector;
use ndarray::Array2;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Partition of the `J` items into `G` named major groups.
///
/// Each group shares one diffusion variance along the tree.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ItemGroups {
    names: Vec<String>,
    /// Group index of every item.
    membership: Vec<usize>,
    /// Items of every group, ascending.
    items: Vec<Vec<usize>>,
}

impl ItemGroups {
    /// Build from a per-item group index.
    ///
    /// # Errors
    /// [`DdtLcmError::InvalidInput`] if there are no items, an index is out of range,
    /// or a named group has no items.
    pub fn new(names: Vec<String>, membership: Vec<usize>) -> Result<Self> {
        if membership.is_empty() {
            return Err(DdtLcmError::invalid("item group membership is empty"));
        }
        let n_groups = names.len();
        let mut items = vec![Vec::new(); n_groups];
        for (j, &g) in membership.iter().enumerate() {
            if g >= n_groups {
                return Err(DdtLcmError::invalid(format!(
                    "item {j} assigned to group {g}, but only {n_groups} groups are named"
                )));
            }
            items[g].push(j);
        }
        if let Some(g) = items.iter().position(Vec::is_empty) {
            return Err(DdtLcmError::invalid(format!(
                "group '{}' contains no items",
                names[g]
            )));
        }
        Ok(Self {
            names,
            membership,
            items,
        })
    }

    /// Build from explicit item lists, checking that they cover `0..n_items`
    /// exactly once.
    pub fn from_partition(
        names: Vec<String>,
        groups: &[Vec<usize>],
        n_items: usize,
    ) -> Result<Self> {
        if names.len() != groups.len() {
            return Err(DdtLcmError::invalid(format!(
                "{} group names for {} groups",
                names.len(),
                groups.len()
            )));
        }
        let mut membership = vec![None; n_items];
        for (g, members) in groups.iter().enumerate() {
            for &j in members {
                let slot = membership.get_mut(j).ok_or_else(|| {
                    DdtLcmError::invalid(format!("item {j} out of range for {n_items} items"))
                })?;
                if slot.replace(g).is_some() {
                    return Err(DdtLcmError::invalid(format!(
                        "item {j} belongs to more than one group"
                    )));
                }
            }
        }
        let membership = membership
            .into_iter()
            .enumerate()
            .map(|(j, g)| g.ok_or_else(|| DdtLcmError::invalid(format!("item {j} has no group"))))
            .collect::<Result<Vec<_>>>()?;
        Self::new(names, membership)
    }

    /// A single group holding every item.
    pub fn single(n_items: usize) -> Result<Self> {
        Self::new(vec!["all".to_string()], vec![0; n_items])
    }

    pub fn n_groups(&self) -> usize {
        self.names.len()
    }

    pub fn n_items(&self) -> usize {
        self.membership.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn group_of(&self, item: usize) -> usize {
        self.membership[item]
    }

    pub fn membership(&self) -> &[usize] {
        &self.membership
    }

    pub fn items(&self, group: usize) -> &[usize] {
        &self.items[group]
    }
}

/// Binary responses with optional missing entries, `N × J`.
#[derive(Debug, Clone, PartialEq)]
pub struct Responses {
    values: Array2<Option<bool>>,
}

impl Responses {
    /// Validate a numeric matrix: entries must be exactly `0.0` or `1.0`; `NaN` marks
    /// a missing response.
    pub fn new(matrix: &Array2<f64>) -> Result<Self> {
        if matrix.nrows() == 0 || matrix.ncols() == 0 {
            return Err(DdtLcmError::invalid(format!(
                "response matrix must be non-empty, got {} x {}",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        let mut values = Array2::from_elem(matrix.dim(), None);
        for ((i, j), &y) in matrix.indexed_iter() {
            values[[i, j]] = match y {
                y if y.is_nan() => None,
                y if y == 0.0 => Some(false),
                y if y == 1.0 => Some(true),
                other => {
                    return Err(DdtLcmError::invalid(format!(
                        "response ({i}, {j}) = {other} is not binary"
                    )));
                }
            };
        }
        Ok(Self { values })
    }

    pub fn n_subjects(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_items(&self) -> usize {
        self.values.ncols()
    }

    pub fn get(&self, subject: usize, item: usize) -> Option<bool> {
        self.values[[subject, item]]
    }

    /// True if the subject answered no item at all.
    pub fn all_missing(&self, subject: usize) -> bool {
        self.values.row(subject).iter().all(Option::is_none)
    }

    /// `ln p(y_i | class k)` for every class, skipping missing items.
    pub fn subject_log_likelihoods(&self, subject: usize, probs: &LeafLogProbs) -> Vec<f64> {
        let row = self.values.row(subject);
        (0..probs.n_classes())
            .map(|k| {
                row.iter()
                    .enumerate()
                    .map(|(j, y)| match y {
                        Some(true) => probs.log_p[[k, j]],
                        Some(false) => probs.log_q[[k, j]],
                        None => 0.0,
                    })
                    .sum()
            })
            .collect()
    }

    /// Per (class, item) observed counts `n_kj` and positive counts `s_kj`.
    pub fn class_item_counts(&self, assignments: &[usize], n_classes: usize) -> ClassItemCounts {
        let j = self.n_items();
        let mut observed = Array2::zeros((n_classes, j));
        let mut positive = Array2::zeros((n_classes, j));
        for (row, &k) in self.values.rows().into_iter().zip(assignments) {
            for (item, y) in row.iter().enumerate() {
                if let Some(y) = y {
                    observed[[k, item]] += 1.0;
                    if *y {
                        positive[[k, item]] += 1.0;
                    }
                }
            }
        }
        ClassItemCounts { observed, positive }
    }

    /// `Σ_i ln Σ_k π_k p(y_i | k)`, the likelihood with assignments integrated out.
    pub fn marginal_log_likelihood(&self, class_probs: &[f64], probs: &LeafLogProbs) -> f64 {
        let log_pi: Vec<f64> = class_probs.iter().map(|p| p.ln()).collect();
        (0..self.n_subjects())
            .map(|i| {
                let terms: Vec<f64> = self
                    .subject_log_likelihoods(i, probs)
                    .iter()
                    .zip(&log_pi)
                    .map(|(ll, lp)| ll + lp)
                    .collect();
                log_sum_exp(&terms)
            })
            .sum()
    }
}

/// Per (class, item) sufficient statistics of the responses.
#[derive(Debug, Clone)]
pub struct ClassItemCounts {
    pub observed: Array2<f64>,
    pub positive: Array2<f64>,
}

/// Responses paired with the item groups they were collected under.
#[derive(Debug, Clone)]
pub struct ResponseData {
    responses: Responses,
    groups: ItemGroups,
}

impl ResponseData {
    /// # Errors
    /// [`DdtLcmError::InvalidInput`] on non-binary entries or if the partition does
    /// not describe exactly the matrix's columns.
    pub fn new(matrix: &Array2<f64>, groups: ItemGroups) -> Result<Self> {
        let responses = Responses::new(matrix)?;
        if groups.n_items() != responses.n_items() {
            return Err(DdtLcmError::invalid(format!(
                "group membership covers {} items, response matrix has {}",
                groups.n_items(),
                responses.n_items()
            )));
        }
        Ok(Self { responses, groups })
    }

    pub fn responses(&self) -> &Responses {
        &self.responses
    }

    pub fn groups(&self) -> &ItemGroups {
        &self.groups
    }

    pub fn n_subjects(&self) -> usize {
        self.responses.n_subjects()
    }

    pub fn n_items(&self) -> usize {
        self.responses.n_items()
    }
}

/// `ln θ_kj` and `ln (1 - θ_kj)` for every leaf, computed stably from logits.
#[derive(Debug, Clone)]
pub struct LeafLogProbs {
    log_p: Array2<f64>,
    log_q: Array2<f64>,
}

impl LeafLogProbs {
    pub fn from_logits<'a>(logits: impl ExactSizeIterator<Item = &'a DVector<f64>>) -> Self {
        let rows: Vec<&DVector<f64>> = logits.collect();
        let n_items = rows.first().map_or(0, |r| r.len());
        let log_p = Array2::from_shape_fn((rows.len(), n_items), |(k, j)| -softplus(-rows[k][j]));
        let log_q = Array2::from_shape_fn((rows.len(), n_items), |(k, j)| -softplus(rows[k][j]));
        Self { log_p, log_q }
    }

    /// From response probabilities directly (used with posterior means).
    pub fn from_probs(probs: &Array2<f64>) -> Self {
        let clamp = |p: f64| p.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON);
        Self {
            log_p: probs.mapv(|p| clamp(p).ln()),
            log_q: probs.mapv(|p| (1.0 - clamp(p)).ln()),
        }
    }

    pub fn n_classes(&self) -> usize {
        self.log_p.nrows()
    }
}

/// `ln(1 + e^x)` without overflow.
pub(crate) fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

pub fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub(crate) fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}
