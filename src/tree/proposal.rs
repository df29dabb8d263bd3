//! Metropolis-Hastings moves on the diffusion tree.
//!
//! The topology move detaches a subtree and lets a fresh DDT particle choose where to
//! re-attach it:
//!
//! 1. Pick `v` uniformly among nodes whose parent is a branching node, and unlink its
//!    parent `p` (the sibling is spliced onto `p`'s parent). Call the result `T₋`.
//! 2. Walk a particle from the origin of `T₋`. On an edge `a -> b` with `m` leaves
//!    below `b` it diverges at rate `a(t) / m`. If the edge reaches past `t_v`, the
//!    particle is forced to diverge before `t_v`. On reaching `b` it follows a child
//!    with probability proportional to that child's leaf count.
//! 3. The new node's location is drawn from its Gaussian full conditional given the
//!    edge endpoints and `v`.
//!
//! The backward density re-attaches at `p`'s old edge, time and location in the same
//! `T₋`, so the Hastings correction is exact. The detach choice cancels: the number
//! of candidates is `2K - 2` in every tree.

use super::prior::{self, DiffusionVariances, DivergenceFunction, gaussian_ln_pdf};
use super::{DiffusionTree, NodeId};
use crate::data::ItemGroups;
use crate::error::{DdtLcmError, Result};
use log::trace;
use nalgebra::DVector;
use rand::Rng;
use statrs::distribution::Normal;

/// Give up on drawing an initial tree after this many degenerate particle walks in a row.
const MAX_GROWTH_ATTEMPTS: usize = 1_000;

/// Diffusion parameters shared by every tree move in one iteration.
#[derive(Debug, Clone, Copy)]
pub struct DiffusionParams<'a> {
    pub divergence: DivergenceFunction,
    pub variances: &'a DiffusionVariances,
    pub groups: &'a ItemGroups,
}

impl DiffusionParams<'_> {
    /// Full DDT log prior of `tree` under these parameters.
    pub fn log_prior(&self, tree: &DiffusionTree) -> Result<f64> {
        prior::log_prior(tree, &self.divergence, self.variances, self.groups)
    }
}

/// Outcome of one Metropolis-Hastings topology move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TreeMove {
    /// The proposal replaced the current tree.
    Accepted { log_ratio: f64 },
    /// The current tree was kept.
    Rejected { log_ratio: f64 },
    /// The proposal broke the tree invariants (or had zero prior density) and was
    /// discarded before the acceptance ratio was formed.
    Degenerate,
}

impl TreeMove {
    /// Whether the proposal was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, TreeMove::Accepted { .. })
    }
}

/// Where a particle diverged: on the edge above `edge_child`, at `time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DivergencePoint {
    pub edge_child: NodeId,
    pub time: f64,
}

/// Propose a detach-and-reattach move and accept or reject it in place.
///
/// # Arguments
/// * `tree` - The current tree; replaced by the proposal on acceptance, untouched otherwise
/// * `params` - Divergence function and diffusion variances of this iteration
/// * `log_likelihood` - Scores the LCM data against a tree
/// * `rng` - Random number generator
///
/// # Returns
/// The [`TreeMove`] outcome, carrying the log acceptance ratio unless the proposal
/// was degenerate.
///
/// # Errors
/// [`DdtLcmError::NumericDomain`] if the current tree has a non-finite log prior,
/// or if the acceptance ratio is NaN.
pub fn propose_and_accept<R, F>(
    tree: &mut DiffusionTree,
    params: &DiffusionParams<'_>,
    log_likelihood: F,
    rng: &mut R,
) -> Result<TreeMove>
where
    R: Rng + ?Sized,
    F: Fn(&DiffusionTree) -> f64,
{
    let candidates = detachable(tree);
    let v = candidates[rng.gen_range(0..candidates.len())];
    let (t_v, x_v) = (tree.node(v).time, tree.node(v).location.clone());

    let mut proposed = tree.clone();
    let detached = proposed.detach(v)?;
    let counts = proposed.leaf_counts();

    let Some(point) = sample_divergence_point(&proposed, &counts, t_v, &params.divergence, rng)
    else {
        trace!("tree move on node {v}: particle walk degenerated");
        return Ok(TreeMove::Degenerate);
    };
    debug_assert!(!proposed.is_ancestor_or_self(v, point.edge_child));

    let divergence = &params.divergence;
    let location = sample_bridge_location(&proposed, point, t_v, &x_v, params, rng)?;
    let log_q_forward = divergence_point_ln_density(&proposed, &counts, t_v, divergence, point)
        + bridge_ln_density(&proposed, point, t_v, &x_v, &location, params)?;

    let back = DivergencePoint {
        edge_child: detached.sibling,
        time: detached.time,
    };
    let log_q_backward = divergence_point_ln_density(&proposed, &counts, t_v, divergence, back)
        + bridge_ln_density(&proposed, back, t_v, &x_v, &detached.location, params)?;

    proposed.attach(detached.slot, v, point.edge_child, point.time, location)?;
    if proposed.validate().is_err() {
        return Ok(TreeMove::Degenerate);
    }

    let lp_new = params.log_prior(&proposed)?;
    if !lp_new.is_finite() || !log_q_forward.is_finite() {
        return Ok(TreeMove::Degenerate);
    }
    let lp_cur = params.log_prior(tree)?;
    if !lp_cur.is_finite() {
        return Err(DdtLcmError::numeric(format!(
            "current tree has log prior {lp_cur}"
        )));
    }

    let log_ratio = (lp_new - lp_cur)
        + (log_likelihood(&proposed) - log_likelihood(tree))
        + log_q_backward
        - log_q_forward;
    if log_ratio.is_nan() {
        return Err(DdtLcmError::numeric("tree acceptance ratio is NaN"));
    }
    trace!(
        "tree move on node {v}: edge above {} at t = {:.4}, log ratio {log_ratio:.4}",
        point.edge_child,
        point.time
    );

    if rng.r#gen::<f64>().ln() < log_ratio {
        *tree = proposed;
        Ok(TreeMove::Accepted { log_ratio })
    } else {
        Ok(TreeMove::Rejected { log_ratio })
    }
}

/// Gibbs-refresh every branching node's location from its Gaussian full conditional
/// given its parent and two children, parents first.
pub fn refresh_branch_locations<R: Rng + ?Sized>(
    tree: &mut DiffusionTree,
    params: &DiffusionParams<'_>,
    rng: &mut R,
) -> Result<()> {
    let order: Vec<NodeId> = tree
        .preorder()
        .into_iter()
        .filter(|&id| id > tree.origin())
        .collect();
    for v in order {
        let u = tree.parent_of(v)?;
        let node = tree.node(v);
        let t = node.time;
        let mut weighted = vec![(1.0 / (t - tree.node(u).time), &tree.node(u).location)];
        for &c in &node.children {
            weighted.push((1.0 / (tree.node(c).time - t), &tree.node(c).location));
        }
        let location = draw_precision_weighted(&weighted, params, rng);
        tree.node_mut(v).location = location;
    }
    Ok(())
}

/// Draw a tree from the DDT prior: leaves join one at a time as fresh particles, then
/// locations diffuse from the origin.
pub fn sample_prior_tree<R: Rng + ?Sized>(
    n_leaves: usize,
    params: &DiffusionParams<'_>,
    rng: &mut R,
) -> Result<DiffusionTree> {
    if n_leaves < 2 {
        return Err(DdtLcmError::invalid(format!(
            "a diffusion tree needs at least 2 leaves, got {n_leaves}"
        )));
    }
    let n_items = params.groups.n_items();
    let mut tree = DiffusionTree::seed(n_leaves, n_items);

    for leaf in 1..n_leaves {
        let counts = tree.leaf_counts();
        let point = (0..MAX_GROWTH_ATTEMPTS)
            .find_map(|_| sample_divergence_point(&tree, &counts, 1.0, &params.divergence, rng))
            .ok_or_else(|| {
                DdtLcmError::numeric(format!(
                    "could not place leaf {leaf} in {MAX_GROWTH_ATTEMPTS} particle walks"
                ))
            })?;
        let slot = n_leaves + leaf;
        let location = DVector::zeros(n_items);
        tree.attach(slot, leaf, point.edge_child, point.time, location)?;
    }

    let std_norm = Normal::standard();
    for v in tree.preorder().into_iter().skip(1) {
        let u = tree.parent_of(v)?;
        let len = tree.node(v).time - tree.node(u).time;
        let parent_loc = tree.node(u).location.clone();
        let location = DVector::from_fn(n_items, |j, _| {
            let sd = (params.variances.for_item(params.groups, j) * len).sqrt();
            parent_loc[j] + sd * rng.sample(&std_norm)
        });
        tree.node_mut(v).location = location;
    }
    tree.validate()?;
    Ok(tree)
}

/// Nodes that may be detached: every node whose parent is a branching node.
fn detachable(tree: &DiffusionTree) -> Vec<NodeId> {
    (0..tree.nodes().len())
        .filter(|&id| matches!(tree.node(id).parent, Some(p) if p > tree.origin()))
        .collect()
}

/// Walk a DDT particle from the origin until it diverges, never later than `t_limit`.
/// `None` if floating-point rounding puts the divergence time on an endpoint.
pub(crate) fn sample_divergence_point<R: Rng + ?Sized>(
    tree: &DiffusionTree,
    counts: &[usize],
    t_limit: f64,
    divergence: &DivergenceFunction,
    rng: &mut R,
) -> Option<DivergencePoint> {
    let mut a = tree.origin();
    let mut b = *tree.node(a).children.first()?;
    loop {
        let (t_a, t_b, m) = (tree.node(a).time, tree.node(b).time, counts[b]);
        if m == 0 {
            return None;
        }
        let (diverges, t_end) = if t_b >= t_limit {
            (true, t_limit)
        } else {
            let survive = divergence.ln_survival(t_a, t_b, m).exp();
            (rng.r#gen::<f64>() >= survive, t_b)
        };

        if diverges {
            let ln_s_end = divergence.ln_survival(t_a, t_end, m);
            let t = truncated_divergence_time(t_a, ln_s_end, m, divergence, rng.r#gen::<f64>());
            return (t > t_a && t < t_end && t < t_b).then_some(DivergencePoint {
                edge_child: b,
                time: t,
            });
        }

        let children = &tree.node(b).children;
        let mut pick = rng.gen_range(0..m);
        let mut next = None;
        for &c in children {
            if pick < counts[c] {
                next = Some(c);
                break;
            }
            pick -= counts[c];
        }
        a = b;
        b = next?;
    }
}

/// Inverse-CDF draw of the divergence time on an edge starting at `t_a`, truncated to
/// where the survival function is above `exp(ln_s_end)`.
fn truncated_divergence_time(
    t_a: f64,
    ln_s_end: f64,
    m: usize,
    divergence: &DivergenceFunction,
    u: f64,
) -> f64 {
    // S = 1 - u (1 - S_end), then (1 - t) = (1 - t_a) S^{m/c}
    let s = 1.0 + u * ln_s_end.exp_m1();
    -((-t_a).ln_1p() + (m as f64 / divergence.c()) * s.ln()).exp_m1()
}

/// Log-density of a particle walk ending at `point`, under the same kernel as
/// [`sample_divergence_point`].
pub(crate) fn divergence_point_ln_density(
    tree: &DiffusionTree,
    counts: &[usize],
    t_limit: f64,
    divergence: &DivergenceFunction,
    point: DivergencePoint,
) -> f64 {
    let target = point.edge_child;
    if counts[target] == 0 {
        return f64::NEG_INFINITY;
    }
    let mut path = vec![target];
    let mut cur = target;
    while let Some(p) = tree.node(cur).parent {
        if p == tree.origin() {
            break;
        }
        path.push(p);
        cur = p;
    }
    if tree.node(cur).parent != Some(tree.origin()) {
        return f64::NEG_INFINITY;
    }
    path.reverse();

    let mut ln_density = 0.0;
    let mut t_a = 0.0;
    for pair in path.windows(2) {
        let (b, next) = (pair[0], pair[1]);
        let t_b = tree.node(b).time;
        if t_b >= t_limit {
            return f64::NEG_INFINITY;
        }
        ln_density += divergence.ln_survival(t_a, t_b, counts[b])
            + (counts[next] as f64 / counts[b] as f64).ln();
        t_a = t_b;
    }

    let (t, t_b, m) = (point.time, tree.node(target).time, counts[target]);
    if !(t > t_a && t < t_b && t < t_limit) {
        return f64::NEG_INFINITY;
    }
    ln_density += divergence.ln_rate(t) - (m as f64).ln() + divergence.ln_survival(t_a, t, m);
    if t_b >= t_limit {
        ln_density -= (-divergence.ln_survival(t_a, t_limit, m).exp_m1()).ln();
    }
    ln_density
}

/// Precision weights of the new node's neighbours: the edge endpoints and the
/// detached node `v`.
fn bridge_weights<'t>(
    tree: &'t DiffusionTree,
    point: DivergencePoint,
    t_v: f64,
    x_v: &'t DVector<f64>,
) -> Result<[(f64, &'t DVector<f64>); 3]> {
    let b = point.edge_child;
    let a = tree.parent_of(b)?;
    let t = point.time;
    Ok([
        (1.0 / (t - tree.node(a).time), &tree.node(a).location),
        (1.0 / (tree.node(b).time - t), &tree.node(b).location),
        (1.0 / (t_v - t), x_v),
    ])
}

fn sample_bridge_location<R: Rng + ?Sized>(
    tree: &DiffusionTree,
    point: DivergencePoint,
    t_v: f64,
    x_v: &DVector<f64>,
    params: &DiffusionParams<'_>,
    rng: &mut R,
) -> Result<DVector<f64>> {
    let weights = bridge_weights(tree, point, t_v, x_v)?;
    Ok(draw_precision_weighted(&weights, params, rng))
}

fn bridge_ln_density(
    tree: &DiffusionTree,
    point: DivergencePoint,
    t_v: f64,
    x_v: &DVector<f64>,
    location: &DVector<f64>,
    params: &DiffusionParams<'_>,
) -> Result<f64> {
    let weights = bridge_weights(tree, point, t_v, x_v)?;
    let precision: f64 = weights.iter().map(|(w, _)| w).sum();
    Ok((0..location.len())
        .map(|j| {
            let mean = weights.iter().map(|(w, x)| w * x[j]).sum::<f64>() / precision;
            let var = params.variances.for_item(params.groups, j) / precision;
            gaussian_ln_pdf(location[j], mean, var)
        })
        .sum())
}

/// Per item, `N(Σ w_i x_i / Σ w_i, σ²_g / Σ w_i)`: the product of Brownian edge
/// densities around one node, with `w_i` the reciprocal edge lengths.
fn draw_precision_weighted<R: Rng + ?Sized>(
    weighted: &[(f64, &DVector<f64>)],
    params: &DiffusionParams<'_>,
    rng: &mut R,
) -> DVector<f64> {
    let precision: f64 = weighted.iter().map(|(w, _)| w).sum();
    let n_items = weighted[0].1.len();
    let std_norm = Normal::standard();
    DVector::from_fn(n_items, |j, _| {
        let mean = weighted.iter().map(|(w, x)| w * x[j]).sum::<f64>() / precision;
        let sd = (params.variances.for_item(params.groups, j) / precision).sqrt();
        mean + sd * rng.sample(&std_norm)
    })
}
