//! Latent diffusion tree over the class profiles.
//!
//! Arena layout with `2K` fixed slots addressed by [`NodeId`]:
//! - `0..K` are the leaves, so leaf `k` is class `k`;
//! - `K` is the origin of the diffusion (time 0, zero location, a single child);
//! - `K+1..2K` are the `K-1` branching nodes.
//!
//! Topology edits happen only on private clones inside [`proposal`]; a branching
//! slot is unlinked by `detach` and relinked by `attach`, so the arena never grows.

use crate::data::{LeafLogProbs, logistic};
use crate::error::{DdtLcmError, Result};
use nalgebra::DVector;
use ndarray::Array2;
use std::fmt;
use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod prior;
pub mod proposal;

/// Index into the tree's node arena.
pub type NodeId = usize;

/// A node of the diffusion tree.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Node {
    /// Divergence time; 0 at the origin, 1 at the leaves.
    pub time: f64,
    /// `None` only at the origin and at floating slots.
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// One coordinate per item; at a leaf these are the item-response logits.
    pub location: DVector<f64>,
}

impl Node {
    fn floating(time: f64, n_items: usize) -> Self {
        Self {
            time,
            parent: None,
            children: Vec::new(),
            location: DVector::zeros(n_items),
        }
    }
}

/// Rooted binary tree with divergence times and per-item node locations.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiffusionTree {
    nodes: Vec<Node>,
    n_leaves: usize,
}

/// What `detach` removed, enough to restore it.
#[derive(Debug, Clone)]
pub(crate) struct Detached {
    /// Slot of the unlinked branching node.
    pub slot: NodeId,
    /// The detached node's former sibling, now the child of `slot`'s former parent.
    pub sibling: NodeId,
    pub time: f64,
    pub location: DVector<f64>,
}

impl DiffusionTree {
    /// Build from a full arena and check every invariant.
    pub fn from_nodes(nodes: Vec<Node>, n_leaves: usize) -> Result<Self> {
        let tree = Self { nodes, n_leaves };
        tree.validate()?;
        Ok(tree)
    }

    /// Origin wired to leaf 0; every other slot floats until attached.
    pub(crate) fn seed(n_leaves: usize, n_items: usize) -> Self {
        let mut nodes: Vec<Node> = (0..2 * n_leaves)
            .map(|id| Node::floating(if id < n_leaves { 1.0 } else { 0.0 }, n_items))
            .collect();
        nodes[n_leaves].children.push(0);
        nodes[0].parent = Some(n_leaves);
        Self { nodes, n_leaves }
    }

    /// Number of leaves `K`, one per latent class.
    pub fn n_leaves(&self) -> usize {
        self.n_leaves
    }

    /// Length `J` of every location vector.
    pub fn n_items(&self) -> usize {
        self.nodes[0].location.len()
    }

    /// Slot of the origin, `K`.
    pub fn origin(&self) -> NodeId {
        self.n_leaves
    }

    /// Leaf slots `0..K`; slot `k` is class `k`.
    pub fn leaves(&self) -> Range<NodeId> {
        0..self.n_leaves
    }

    /// Branching slots `K + 1..2K`.
    pub fn branching_nodes(&self) -> Range<NodeId> {
        self.n_leaves + 1..2 * self.n_leaves
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        id < self.n_leaves
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// The whole arena, indexed by [`NodeId`].
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Parent of a node that is known to be linked below the origin.
    pub(crate) fn parent_of(&self, id: NodeId) -> Result<NodeId> {
        self.nodes[id]
            .parent
            .ok_or_else(|| DdtLcmError::invalid(format!("node {id} has no parent")))
    }

    /// The other child of `id`'s parent.
    pub fn sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.nodes[id].parent?;
        let children = &self.nodes[parent].children;
        children.iter().copied().find(|&c| c != id)
    }

    /// Nodes reachable from the origin, parents before children.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.origin()];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter().rev());
        }
        order
    }

    /// Nodes reachable from the origin, children before parents.
    pub fn postorder(&self) -> Vec<NodeId> {
        let mut order = self.preorder();
        order.reverse();
        order
    }

    /// Number of leaves under every node; zero for slots not reachable from the origin.
    pub fn leaf_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.nodes.len()];
        for id in self.postorder() {
            counts[id] = if self.is_leaf(id) {
                1
            } else {
                self.nodes[id].children.iter().map(|&c| counts[c]).sum()
            };
        }
        counts
    }

    /// True if `ancestor` lies on the path from the origin to `node` (inclusive).
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.nodes[id].parent;
        }
        false
    }

    /// `(parent, child)` for every edge reachable from the origin.
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.preorder()
            .into_iter()
            .filter_map(|id| self.nodes[id].parent.map(|p| (p, id)))
            .collect()
    }

    /// Check the arena: slot kinds, link consistency, reachability, and strictly
    /// increasing divergence times.
    ///
    /// # Errors
    /// Structural problems are [`DdtLcmError::InvalidInput`]; times outside their
    /// range or out of order are [`DdtLcmError::NumericDomain`].
    pub fn validate(&self) -> Result<()> {
        let k = self.n_leaves;
        if k < 2 || self.nodes.len() != 2 * k {
            return Err(DdtLcmError::invalid(format!(
                "tree with {k} leaves needs {} node slots, found {}",
                2 * k,
                self.nodes.len()
            )));
        }
        let n_items = self.n_items();
        let origin = &self.nodes[k];
        if origin.parent.is_some() || origin.children.len() != 1 || origin.time != 0.0 {
            return Err(DdtLcmError::invalid(
                "origin must be parentless at time 0 with exactly one child",
            ));
        }

        for (id, node) in self.nodes.iter().enumerate() {
            if node.location.len() != n_items {
                return Err(DdtLcmError::invalid(format!(
                    "node {id} has {} location coordinates, expected {n_items}",
                    node.location.len()
                )));
            }
            if node.location.iter().any(|x| !x.is_finite()) {
                return Err(DdtLcmError::numeric(format!(
                    "node {id} has a non-finite location"
                )));
            }
            let want_children = match id {
                _ if id < k => 0,
                _ if id == k => 1,
                _ => 2,
            };
            if node.children.len() != want_children {
                return Err(DdtLcmError::invalid(format!(
                    "node {id} has {} children, expected {want_children}",
                    node.children.len()
                )));
            }
            if id < k && node.time != 1.0 {
                return Err(DdtLcmError::numeric(format!(
                    "leaf {id} has time {}, leaves sit at time 1",
                    node.time
                )));
            }
            if id > k && !(node.time > 0.0 && node.time < 1.0) {
                return Err(DdtLcmError::numeric(format!(
                    "branching node {id} has divergence time {} outside (0, 1)",
                    node.time
                )));
            }
            for &c in &node.children {
                if c >= self.nodes.len() || self.nodes[c].parent != Some(id) {
                    return Err(DdtLcmError::invalid(format!(
                        "child link {id} -> {c} is not mirrored by a parent link"
                    )));
                }
                if self.nodes[c].time <= node.time {
                    return Err(DdtLcmError::numeric(format!(
                        "divergence time does not increase along edge {id} -> {c} ({} -> {})",
                        node.time, self.nodes[c].time
                    )));
                }
            }
        }

        let order = self.preorder();
        let mut seen = vec![false; self.nodes.len()];
        for &id in &order {
            if std::mem::replace(&mut seen[id], true) {
                return Err(DdtLcmError::invalid(format!(
                    "node {id} is reachable twice"
                )));
            }
        }
        if let Some(id) = seen.iter().position(|s| !s) {
            return Err(DdtLcmError::invalid(format!(
                "node {id} is not reachable from the origin"
            )));
        }
        Ok(())
    }

    /// Unlink the parent of `node`, splicing `node`'s sibling onto the grandparent.
    ///
    /// The parent's slot keeps `node` as its only child and floats until `attach`.
    pub(crate) fn detach(&mut self, node: NodeId) -> Result<Detached> {
        let slot = self.parent_of(node)?;
        let grandparent = self.parent_of(slot)?;
        let sibling = self
            .sibling(node)
            .ok_or_else(|| DdtLcmError::invalid(format!("node {node} has no sibling")))?;

        for c in self.nodes[grandparent].children.iter_mut() {
            if *c == slot {
                *c = sibling;
            }
        }
        self.nodes[sibling].parent = Some(grandparent);

        let p = &mut self.nodes[slot];
        p.parent = None;
        p.children = vec![node];
        Ok(Detached {
            slot,
            sibling,
            time: p.time,
            location: p.location.clone(),
        })
    }

    /// Insert the floating `slot` on the edge above `edge_child`, at `time`, with
    /// `node` as its second child.
    pub(crate) fn attach(
        &mut self,
        slot: NodeId,
        node: NodeId,
        edge_child: NodeId,
        time: f64,
        location: DVector<f64>,
    ) -> Result<()> {
        let above = self.parent_of(edge_child)?;
        for c in self.nodes[above].children.iter_mut() {
            if *c == edge_child {
                *c = slot;
            }
        }
        self.nodes[edge_child].parent = Some(slot);
        self.nodes[node].parent = Some(slot);

        let p = &mut self.nodes[slot];
        p.parent = Some(above);
        p.children = vec![edge_child, node];
        p.time = time;
        p.location = location;
        Ok(())
    }

    /// Leaf `k` moves to slot `perm[k]`; internal slots keep their ids.
    pub fn permute_leaves(&self, perm: &[usize]) -> Result<Self> {
        check_permutation(perm, self.n_leaves)?;
        let remap = |id: NodeId| if id < self.n_leaves { perm[id] } else { id };
        let mut nodes = self.nodes.clone();
        for (id, node) in self.nodes.iter().enumerate() {
            let mut moved = node.clone();
            moved.children = node.children.iter().map(|&c| remap(c)).collect();
            nodes[remap(id)] = moved;
        }
        Ok(Self {
            nodes,
            n_leaves: self.n_leaves,
        })
    }

    /// `K × J` item-response probabilities at the leaves.
    pub fn leaf_response_probs(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.n_leaves, self.n_items()), |(k, j)| {
            logistic(self.nodes[k].location[j])
        })
    }

    pub fn leaf_log_probs(&self) -> LeafLogProbs {
        LeafLogProbs::from_logits(self.leaves().map(|k| &self.nodes[k].location))
    }

    /// Newick rendering with branch lengths, leaves named `class<k>`.
    pub fn newick(&self) -> String {
        fn render(tree: &DiffusionTree, id: NodeId, out: &mut String) {
            let node = &tree.nodes[id];
            if tree.is_leaf(id) {
                out.push_str(&format!("class{id}"));
            } else {
                out.push('(');
                for (i, &c) in node.children.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    render(tree, c, out);
                }
                out.push(')');
            }
            if let Some(p) = node.parent {
                out.push_str(&format!(":{:.4}", node.time - tree.nodes[p].time));
            }
        }
        let mut out = String::new();
        render(self, self.origin(), &mut out);
        out.push(';');
        out
    }
}

impl fmt::Display for DiffusionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.newick())
    }
}

pub(crate) fn check_permutation(perm: &[usize], n: usize) -> Result<()> {
    let mut seen = vec![false; n];
    if perm.len() != n {
        return Err(DdtLcmError::invalid(format!(
            "permutation has {} entries, expected {n}",
            perm.len()
        )));
    }
    for &p in perm {
        if p >= n || std::mem::replace(&mut seen[p], true) {
            return Err(DdtLcmError::invalid(format!(
                "{perm:?} is not a permutation"
            )));
        }
    }
    Ok(())
}
