//! HDBSCAN density clustering.
//!
//! Vectors are L2-normalized on entry, so Euclidean distance orders pairs the
//! same way cosine distance does. The implementation is exact (O(n²) distance
//! evaluations) and deterministic for a fixed input order.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::util::vector::{euclidean_distance, l2_normalized};

/// Distances below this are clamped so lambda stays finite for duplicates.
const MIN_DISTANCE: f64 = 1e-12;

/// How clusters are picked from the condensed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Excess of mass. Favors fewer, larger, more stable clusters.
    #[default]
    Eom,
    /// Leaves of the condensed tree. Favors more, smaller, homogeneous clusters.
    Leaf,
}

impl SelectionPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eom => "eom",
            Self::Leaf => "leaf",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eom" => Ok(Self::Eom),
            "leaf" => Ok(Self::Leaf),
            other => Err(format!("unknown selection policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensityParams {
    pub min_cluster_size: usize,
    pub min_samples: usize,
    /// Clusters born below this distance are merged into their ancestor.
    pub selection_epsilon: f32,
    pub policy: SelectionPolicy,
    /// Permit the whole dataset to come back as one cluster.
    #[serde(default)]
    pub allow_single_cluster: bool,
}

impl Default for DensityParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 10,
            min_samples: 3,
            selection_epsilon: 0.0,
            policy: SelectionPolicy::Eom,
            allow_single_cluster: false,
        }
    }
}

impl DensityParams {
    #[must_use]
    pub fn new(min_cluster_size: usize, min_samples: usize) -> Self {
        Self {
            min_cluster_size,
            min_samples,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_selection_epsilon(mut self, epsilon: f32) -> Self {
        self.selection_epsilon = epsilon;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_allow_single_cluster(mut self, allow: bool) -> Self {
        self.allow_single_cluster = allow;
        self
    }

    /// # Errors
    /// Returns [`PipelineError::InvalidParameters`] when `min_cluster_size < 2`,
    /// `min_samples < 1`, or `selection_epsilon` is negative or not finite.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.min_cluster_size < 2 {
            return Err(PipelineError::InvalidParameters(format!(
                "min_cluster_size must be at least 2, got {}",
                self.min_cluster_size
            )));
        }
        if self.min_samples < 1 {
            return Err(PipelineError::InvalidParameters(
                "min_samples must be at least 1".to_string(),
            ));
        }
        if !self.selection_epsilon.is_finite() || self.selection_epsilon < 0.0 {
            return Err(PipelineError::InvalidParameters(format!(
                "selection_epsilon must be a non-negative number, got {}",
                self.selection_epsilon
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    a: usize,
    b: usize,
    weight: f64,
}

#[derive(Debug, Clone, Copy)]
struct Merge {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

#[derive(Debug, Clone, Copy)]
struct CondensedEdge {
    parent: usize,
    child: usize,
    lambda: f64,
    size: usize,
}

/// Condensed cluster tree. Points are `0..n_points`; cluster labels are
/// `n_points..n_points + n_clusters` with the root at `n_points`. Children
/// always carry larger labels than their parent.
#[derive(Debug)]
struct CondensedTree {
    edges: Vec<CondensedEdge>,
    n_points: usize,
    n_clusters: usize,
}

/// Runs HDBSCAN with fixed parameters.
#[derive(Debug, Clone, Copy)]
pub struct DensityClusterer {
    params: DensityParams,
}

impl DensityClusterer {
    #[must_use]
    pub fn new(params: DensityParams) -> Self {
        Self { params }
    }

    #[must_use]
    pub fn params(&self) -> &DensityParams {
        &self.params
    }

    /// Labels each vector with a cluster (`0..k`, numbered by first member)
    /// or `None` for noise. Fewer vectors than `min_cluster_size` yields all noise.
    ///
    /// A `min_cluster_size` below 2 is treated as 2; single points never form
    /// a cluster of their own.
    #[must_use]
    pub fn cluster(&self, vectors: &[Vec<f32>]) -> Vec<Option<usize>> {
        let n = vectors.len();
        let min_cluster_size = self.params.min_cluster_size.max(2);
        if n < min_cluster_size {
            return vec![None; n];
        }

        let points: Vec<Vec<f32>> = vectors.iter().map(|v| l2_normalized(v)).collect();
        let core = core_distances(&points, self.params.min_samples);
        let mst = mutual_reachability_mst(&points, &core);
        let merges = single_linkage(n, mst);
        let tree = condense(&merges, n, min_cluster_size);
        let selected = select_clusters(&tree, &self.params);
        label_points(&tree, &selected)
    }
}

fn core_distances(points: &[Vec<f32>], min_samples: usize) -> Vec<f64> {
    let k = min_samples.clamp(1, points.len()) - 1;
    points
        .par_iter()
        .map(|p| {
            let mut distances: Vec<f64> = points
                .iter()
                .map(|q| f64::from(euclidean_distance(p, q)))
                .collect();
            let (_, kth, _) = distances.select_nth_unstable_by(k, f64::total_cmp);
            *kth
        })
        .collect()
}

/// Prim's algorithm over the complete mutual-reachability graph.
fn mutual_reachability_mst(points: &[Vec<f32>], core: &[f64]) -> Vec<Edge> {
    let n = points.len();
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0_usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    let mut current = 0;
    in_tree[0] = true;
    for _ in 1..n {
        let origin = &points[current];
        let origin_core = core[current];
        best.par_iter_mut()
            .zip(from.par_iter_mut())
            .enumerate()
            .for_each(|(j, (best_j, from_j))| {
                if in_tree[j] {
                    return;
                }
                let distance = f64::from(euclidean_distance(origin, &points[j]));
                let reach = distance.max(origin_core).max(core[j]);
                if reach < *best_j {
                    *best_j = reach;
                    *from_j = current;
                }
            });

        let mut next = None;
        let mut next_weight = f64::INFINITY;
        for j in 0..n {
            if !in_tree[j] && (next.is_none() || best[j] < next_weight) {
                next = Some(j);
                next_weight = best[j];
            }
        }
        let Some(next) = next else { break };

        in_tree[next] = true;
        edges.push(Edge {
            a: from[next],
            b: next,
            weight: next_weight,
        });
        current = next;
    }
    edges
}

fn find(parent: &mut [usize], mut node: usize) -> usize {
    let mut root = node;
    while parent[root] != root {
        root = parent[root];
    }
    while parent[node] != root {
        let next = parent[node];
        parent[node] = root;
        node = next;
    }
    root
}

/// Builds the merge sequence; merge `k` creates node `n + k`.
fn single_linkage(n: usize, mut edges: Vec<Edge>) -> Vec<Merge> {
    edges.sort_by(|x, y| x.weight.total_cmp(&y.weight));

    let total = 2 * n - 1;
    let mut parent: Vec<usize> = (0..total).collect();
    let mut size = vec![1_usize; total];
    let mut merges = Vec::with_capacity(n - 1);

    for (offset, edge) in edges.into_iter().enumerate() {
        let node = n + offset;
        let left = find(&mut parent, edge.a);
        let right = find(&mut parent, edge.b);
        let merged = size[left] + size[right];
        parent[left] = node;
        parent[right] = node;
        size[node] = merged;
        merges.push(Merge {
            left,
            right,
            distance: edge.weight,
            size: merged,
        });
    }
    merges
}

fn lambda_of(distance: f64) -> f64 {
    1.0 / distance.max(MIN_DISTANCE)
}

fn node_size(merges: &[Merge], n: usize, node: usize) -> usize {
    if node < n { 1 } else { merges[node - n].size }
}

fn leaves(merges: &[Merge], n: usize, node: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        if current < n {
            out.push(current);
        } else {
            let merge = &merges[current - n];
            stack.push(merge.right);
            stack.push(merge.left);
        }
    }
    out
}

fn condense(merges: &[Merge], n: usize, min_cluster_size: usize) -> CondensedTree {
    let root = 2 * n - 2;
    let mut relabel = vec![0_usize; 2 * n - 1];
    relabel[root] = n;
    let mut next_label = n + 1;
    let mut edges = Vec::with_capacity(n * 2);

    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let merge = merges[node - n];
        let lambda = lambda_of(merge.distance);
        let parent = relabel[node];
        let left_big = node_size(merges, n, merge.left) >= min_cluster_size;
        let right_big = node_size(merges, n, merge.right) >= min_cluster_size;

        let fall_out = |child: usize, edges: &mut Vec<CondensedEdge>| {
            for point in leaves(merges, n, child) {
                edges.push(CondensedEdge {
                    parent,
                    child: point,
                    lambda,
                    size: 1,
                });
            }
        };

        match (left_big, right_big) {
            (true, true) => {
                for child in [merge.left, merge.right] {
                    relabel[child] = next_label;
                    next_label += 1;
                    edges.push(CondensedEdge {
                        parent,
                        child: relabel[child],
                        lambda,
                        size: node_size(merges, n, child),
                    });
                }
                stack.push(merge.right);
                stack.push(merge.left);
            }
            (true, false) => {
                relabel[merge.left] = parent;
                fall_out(merge.right, &mut edges);
                stack.push(merge.left);
            }
            (false, true) => {
                relabel[merge.right] = parent;
                fall_out(merge.left, &mut edges);
                stack.push(merge.right);
            }
            (false, false) => {
                fall_out(merge.left, &mut edges);
                fall_out(merge.right, &mut edges);
            }
        }
    }

    CondensedTree {
        edges,
        n_points: n,
        n_clusters: next_label - n,
    }
}

/// Per-cluster bookkeeping indexed by `label - n_points`.
struct ClusterTable {
    birth: Vec<f64>,
    stability: Vec<f64>,
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
}

impl ClusterTable {
    fn build(tree: &CondensedTree) -> Self {
        let n = tree.n_points;
        let k = tree.n_clusters;
        let mut birth = vec![0.0; k];
        let mut parent = vec![None; k];
        let mut children = vec![Vec::new(); k];
        for edge in &tree.edges {
            if edge.child >= n {
                let child = edge.child - n;
                birth[child] = edge.lambda;
                parent[child] = Some(edge.parent - n);
                children[edge.parent - n].push(child);
            }
        }

        let mut stability = vec![0.0; k];
        for edge in &tree.edges {
            let owner = edge.parent - n;
            #[allow(clippy::cast_precision_loss)]
            let weight = edge.size as f64;
            stability[owner] += (edge.lambda - birth[owner]) * weight;
        }

        Self {
            birth,
            stability,
            parent,
            children,
        }
    }

    fn descendants(&self, cluster: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = self.children[cluster].clone();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children[current].iter().copied());
        }
        out
    }

    fn birth_distance(&self, cluster: usize) -> f64 {
        if self.birth[cluster] > 0.0 {
            1.0 / self.birth[cluster]
        } else {
            f64::INFINITY
        }
    }
}

/// Returns selected clusters as indices into the cluster table (root = 0).
fn select_clusters(tree: &CondensedTree, params: &DensityParams) -> BTreeSet<usize> {
    let table = ClusterTable::build(tree);
    let k = tree.n_clusters;
    let first = usize::from(!params.allow_single_cluster);

    let mut selected: BTreeSet<usize> = match params.policy {
        SelectionPolicy::Eom => {
            let mut is_selected = vec![false; k];
            let mut stability = table.stability.clone();
            for cluster in (first..k).rev() {
                let child_total: f64 = table.children[cluster]
                    .iter()
                    .map(|&child| stability[child])
                    .sum();
                if child_total > stability[cluster] {
                    stability[cluster] = child_total;
                } else {
                    is_selected[cluster] = true;
                    for descendant in table.descendants(cluster) {
                        is_selected[descendant] = false;
                    }
                }
            }
            (0..k).filter(|&c| is_selected[c]).collect()
        }
        SelectionPolicy::Leaf => (first..k)
            .filter(|&c| table.children[c].is_empty())
            .collect(),
    };

    let epsilon = f64::from(params.selection_epsilon);
    if epsilon > 0.0 {
        selected = selected
            .into_iter()
            .map(|cluster| {
                if table.birth_distance(cluster) < epsilon {
                    ascend(&table, cluster, epsilon, params.allow_single_cluster)
                } else {
                    cluster
                }
            })
            .collect();
        let nested: Vec<usize> = selected
            .iter()
            .copied()
            .filter(|&cluster| {
                let mut current = table.parent[cluster];
                while let Some(ancestor) = current {
                    if selected.contains(&ancestor) {
                        return true;
                    }
                    current = table.parent[ancestor];
                }
                false
            })
            .collect();
        for cluster in nested {
            selected.remove(&cluster);
        }
    }

    selected
}

fn ascend(table: &ClusterTable, mut cluster: usize, epsilon: f64, allow_single: bool) -> usize {
    while let Some(parent) = table.parent[cluster] {
        if parent == 0 {
            return if allow_single { parent } else { cluster };
        }
        if table.birth_distance(parent) > epsilon {
            return parent;
        }
        cluster = parent;
    }
    cluster
}

fn label_points(tree: &CondensedTree, selected: &BTreeSet<usize>) -> Vec<Option<usize>> {
    let n = tree.n_points;
    let mut cluster_parent = vec![None; tree.n_clusters];
    let mut point_parent = vec![0_usize; n];
    for edge in &tree.edges {
        if edge.child >= n {
            cluster_parent[edge.child - n] = Some(edge.parent - n);
        } else {
            point_parent[edge.child] = edge.parent - n;
        }
    }

    let mut renumber = vec![None; tree.n_clusters];
    let mut next_id = 0;
    let mut labels = Vec::with_capacity(n);
    for &start in &point_parent {
        let mut current = Some(start);
        let mut found = None;
        while let Some(cluster) = current {
            if selected.contains(&cluster) {
                found = Some(cluster);
                break;
            }
            current = cluster_parent[cluster];
        }
        labels.push(found.map(|cluster| {
            *renumber[cluster].get_or_insert_with(|| {
                next_id += 1;
                next_id - 1
            })
        }));
    }
    labels
}
