//! Dirichlet diffusion tree prior.
//!
//! With divergence function `a(t) = c / (1 - t)` and cumulative hazard
//! `A(t) = -c ln(1 - t)`, a branching node `v` below `u` with `l` and `r` leaves
//! under its two subtrees (`m = l + r`) contributes
//!
//! ```text
//! ln a(t_v) + (A(t_u) - A(t_v)) H_{m-1} + ln Γ(l) + ln Γ(r) - ln Γ(m)
//! ```
//!
//! and every edge `u -> v` contributes the Brownian increment density
//! `N(x_v | x_u, σ²_g (t_v - t_u))` per item. Leaf edges carry no divergence
//! term since `H_0 = 0`.

use super::{DiffusionTree, NodeId};
use crate::data::ItemGroups;
use crate::error::{DdtLcmError, Result};
use nalgebra::DVector;
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The divergence function `a(t) = c / (1 - t)`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DivergenceFunction {
    c: f64,
}

impl DivergenceFunction {
    /// Divergence function with parameter `c`.
    ///
    /// # Errors
    /// [`DdtLcmError::NumericDomain`] unless `c` is finite and positive.
    pub fn new(c: f64) -> Result<Self> {
        if !(c.is_finite() && c > 0.0) {
            return Err(DdtLcmError::numeric(format!(
                "divergence parameter c must be positive, got {c}"
            )));
        }
        Ok(Self { c })
    }

    /// The divergence parameter.
    pub fn c(&self) -> f64 {
        self.c
    }

    /// `ln a(t)`.
    pub fn ln_rate(&self, t: f64) -> f64 {
        self.c.ln() - (-t).ln_1p()
    }

    /// `A(t)`.
    pub fn cumulative_hazard(&self, t: f64) -> f64 {
        -self.c * (-t).ln_1p()
    }

    /// `ln` of the probability that one of `m` shared paths survives from `t_from` to
    /// `t_to` without diverging: `(c/m) ln((1 - t_to) / (1 - t_from))`.
    pub fn ln_survival(&self, t_from: f64, t_to: f64, m: usize) -> f64 {
        (self.c / m as f64) * ((-t_to).ln_1p() - (-t_from).ln_1p())
    }
}

/// One diffusion variance per item group.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiffusionVariances(Vec<f64>);

impl DiffusionVariances {
    /// Zero is allowed and means a point-mass increment.
    ///
    /// # Errors
    /// [`DdtLcmError::NumericDomain`] if any variance is negative or not finite.
    pub fn new(values: Vec<f64>) -> Result<Self> {
        if let Some(v) = values.iter().find(|v| !(v.is_finite() && **v >= 0.0)) {
            return Err(DdtLcmError::numeric(format!(
                "diffusion variance must be finite and non-negative, got {v}"
            )));
        }
        Ok(Self(values))
    }

    /// Variances in group order.
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Number of item groups.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Variance applying to `item`.
    pub fn for_item(&self, groups: &ItemGroups, item: usize) -> f64 {
        self.0[groups.group_of(item)]
    }
}

/// `H_n = Σ_{i=1}^{n} 1/i`.
pub fn harmonic(n: usize) -> f64 {
    (1..=n).map(|i| 1.0 / i as f64).sum()
}

/// Log-density of a Gaussian increment; a zero variance gives the point mass,
/// 0 when the value equals the mean and `-∞` otherwise.
pub(crate) fn gaussian_ln_pdf(x: f64, mean: f64, var: f64) -> f64 {
    if var <= 0.0 {
        return if x == mean { 0.0 } else { f64::NEG_INFINITY };
    }
    let d = x - mean;
    -0.5 * (2.0 * PI * var).ln() - 0.5 * d * d / var
}

/// Log-density of topology and divergence times.
pub fn structure_log_density(tree: &DiffusionTree, divergence: &DivergenceFunction) -> Result<f64> {
    let counts = tree.leaf_counts();
    let mut total = 0.0;
    for v in tree.branching_nodes() {
        let node = tree.node(v);
        let u = tree.parent_of(v)?;
        check_time(v, node.time)?;
        let (l, r) = (counts[node.children[0]], counts[node.children[1]]);
        let m = l + r;
        let hazard = divergence.cumulative_hazard(tree.node(u).time)
            - divergence.cumulative_hazard(node.time);
        total += divergence.ln_rate(node.time)
            + hazard * harmonic(m - 1)
            + ln_gamma(l as f64)
            + ln_gamma(r as f64)
            - ln_gamma(m as f64);
    }
    Ok(total)
}

/// Log-density of every node location given its parent, over all edges.
pub fn location_log_density(
    tree: &DiffusionTree,
    variances: &DiffusionVariances,
    groups: &ItemGroups,
) -> Result<f64> {
    check_dims(tree, variances, groups)?;
    let mut total = 0.0;
    for (u, v) in tree.edges() {
        total += edge_log_density(tree, u, v, variances, groups);
    }
    Ok(total)
}

/// Full DDT log prior of a tree with its locations.
pub fn log_prior(
    tree: &DiffusionTree,
    divergence: &DivergenceFunction,
    variances: &DiffusionVariances,
    groups: &ItemGroups,
) -> Result<f64> {
    let structure = structure_log_density(tree, divergence)?;
    Ok(structure + location_log_density(tree, variances, groups)?)
}

fn edge_log_density(
    tree: &DiffusionTree,
    u: NodeId,
    v: NodeId,
    variances: &DiffusionVariances,
    groups: &ItemGroups,
) -> f64 {
    let (pu, pv) = (tree.node(u), tree.node(v));
    let len = pv.time - pu.time;
    increment_log_density(&pu.location, &pv.location, len, variances, groups)
}

pub(crate) fn increment_log_density(
    from: &DVector<f64>,
    to: &DVector<f64>,
    len: f64,
    variances: &DiffusionVariances,
    groups: &ItemGroups,
) -> f64 {
    (0..to.len())
        .map(|j| gaussian_ln_pdf(to[j], from[j], variances.for_item(groups, j) * len))
        .sum()
}

/// Per-group sums `Σ_edges Σ_{j∈g} (Δx_j)² / (2 len)`, the sufficient statistic of
/// the diffusion variances. Zero-length edges are skipped.
pub(crate) fn scaled_increment_sums(tree: &DiffusionTree, groups: &ItemGroups) -> Vec<f64> {
    let mut sums = vec![0.0; groups.n_groups()];
    for (u, v) in tree.edges() {
        let (pu, pv) = (tree.node(u), tree.node(v));
        let len = pv.time - pu.time;
        if len <= 0.0 {
            continue;
        }
        for j in 0..pv.location.len() {
            let d = pv.location[j] - pu.location[j];
            sums[groups.group_of(j)] += d * d / (2.0 * len);
        }
    }
    sums
}

/// `Σ_v H_{m_v - 1} ln((1 - t_u) / (1 - t_v))` over branching nodes: the rate term
/// of `c` in the structure density, which is `c^{K-1} exp(-c · this)`.
pub(crate) fn divergence_statistic(tree: &DiffusionTree) -> Result<f64> {
    let counts = tree.leaf_counts();
    let mut total = 0.0;
    for v in tree.branching_nodes() {
        let u = tree.parent_of(v)?;
        let (tu, tv) = (tree.node(u).time, tree.node(v).time);
        check_time(v, tv)?;
        total += harmonic(counts[v] - 1) * ((-tu).ln_1p() - (-tv).ln_1p());
    }
    Ok(total)
}

fn check_time(id: NodeId, t: f64) -> Result<()> {
    if (0.0..1.0).contains(&t) {
        Ok(())
    } else {
        Err(DdtLcmError::numeric(format!(
            "divergence time {t} of node {id} outside [0, 1)"
        )))
    }
}

fn check_dims(
    tree: &DiffusionTree,
    variances: &DiffusionVariances,
    groups: &ItemGroups,
) -> Result<()> {
    if variances.len() != groups.n_groups() || tree.n_items() != groups.n_items() {
        return Err(DdtLcmError::invalid(format!(
            "tree has {} items and {} variances for {} groups over {} items",
            tree.n_items(),
            variances.len(),
            groups.n_groups(),
            groups.n_items()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Node;
    use crate::tree::tests::four_leaf_tree;
    use approx::assert_relative_eq;

    fn two_leaf_tree(t: f64, x: [f64; 3]) -> DiffusionTree {
        // leaves 0, 1; origin 2; branching 3
        let nodes = vec![
            Node {
                time: 1.0,
                parent: Some(3),
                children: vec![],
                location: DVector::from_vec(vec![x[1]]),
            },
            Node {
                time: 1.0,
                parent: Some(3),
                children: vec![],
                location: DVector::from_vec(vec![x[2]]),
            },
            Node {
                time: 0.0,
                parent: None,
                children: vec![3],
                location: DVector::zeros(1),
            },
            Node {
                time: t,
                parent: Some(2),
                children: vec![0, 1],
                location: DVector::from_vec(vec![x[0]]),
            },
        ];
        DiffusionTree::from_nodes(nodes, 2).unwrap()
    }

    #[test]
    fn two_leaf_structure_matches_hand_computation() {
        // One branching node with l = r = 1: ln a(t) + (A(0) - A(t)) H_1.
        let c = 1.5;
        let t = 0.4;
        let tree = two_leaf_tree(t, [0.0, 0.0, 0.0]);
        let div = DivergenceFunction::new(c).unwrap();
        let expected = (c / (1.0 - t)).ln() + c * (1.0 - t).ln();
        assert_relative_eq!(
            structure_log_density(&tree, &div).unwrap(),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn two_leaf_locations_match_hand_computation() {
        let tree = two_leaf_tree(0.25, [0.5, 1.0, -0.5]);
        let groups = ItemGroups::single(1).unwrap();
        let var = DiffusionVariances::new(vec![2.0]).unwrap();
        let expected = gaussian_ln_pdf(0.5, 0.0, 2.0 * 0.25)
            + gaussian_ln_pdf(1.0, 0.5, 2.0 * 0.75)
            + gaussian_ln_pdf(-0.5, 0.5, 2.0 * 0.75);
        assert_relative_eq!(
            location_log_density(&tree, &var, &groups).unwrap(),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn four_leaf_topology_factor() {
        // Node 5 splits 2 | 2: Γ(2)Γ(2)/Γ(4) = 1/6.
        let tree = four_leaf_tree(1);
        let div = DivergenceFunction::new(1.0).unwrap();
        let a = |t: f64| (1.0 / (1.0 - t)).ln();
        let big_a = |t: f64| -(1.0 - t).ln();
        let expected = a(0.3)
            + (big_a(0.0) - big_a(0.3)) * harmonic(3)
            + (1.0f64 / 6.0).ln()
            + a(0.6)
            + (big_a(0.3) - big_a(0.6)) * harmonic(1)
            + a(0.5)
            + (big_a(0.3) - big_a(0.5)) * harmonic(1);
        assert_relative_eq!(
            structure_log_density(&tree, &div).unwrap(),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn divergence_statistic_recovers_c_dependence() {
        let tree = four_leaf_tree(1);
        let stat = divergence_statistic(&tree).unwrap();
        let at = |c: f64| {
            let div = DivergenceFunction::new(c).unwrap();
            structure_log_density(&tree, &div).unwrap()
        };
        // ln p(c) - ln p(1) = (K-1) ln c - (c - 1) stat
        let c = 2.7;
        assert_relative_eq!(
            at(c) - at(1.0),
            3.0 * c.ln() - (c - 1.0) * stat,
            epsilon = 1e-10
        );
    }

    #[test]
    fn degenerate_variance_is_not_nan() {
        assert_eq!(gaussian_ln_pdf(1.0, 1.0, 0.0), 0.0);
        assert_eq!(gaussian_ln_pdf(1.0, 2.0, 0.0), f64::NEG_INFINITY);
        let tree = four_leaf_tree(2);
        let groups = ItemGroups::single(2).unwrap();
        let var = DiffusionVariances::new(vec![0.0]).unwrap();
        let lp = location_log_density(&tree, &var, &groups).unwrap();
        assert!(!lp.is_nan());
    }

    #[test]
    fn bad_parameters_are_domain_errors() {
        assert!(matches!(
            DiffusionVariances::new(vec![1.0, -0.1]),
            Err(DdtLcmError::NumericDomain(_))
        ));
        assert!(matches!(
            DivergenceFunction::new(0.0),
            Err(DdtLcmError::NumericDomain(_))
        ));
    }

    #[test]
    fn harmonic_numbers() {
        assert_eq!(harmonic(0), 0.0);
        assert_relative_eq!(harmonic(3), 11.0 / 6.0);
    }
}
