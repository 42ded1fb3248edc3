//! HDBSCAN density clustering over quote embeddings.
//!
//! Points are L2-normalized and compared by Euclidean distance, which on
//! the unit sphere is monotone in cosine distance. The pipeline is the
//! textbook one:
//!
//! 1. core distance of each point (distance to its `min_samples`-th
//!    nearest other point),
//! 2. minimum spanning tree over mutual reachability
//!    `max(core_a, core_b, d(a, b))` (Prim, dense),
//! 3. single-linkage hierarchy from the sorted MST edges,
//! 4. condensed tree: splits where both sides keep at least
//!    `min_cluster_size` points create new clusters, smaller sides fall out
//!    as noise at that density level `λ = 1 / distance`,
//! 5. excess-of-mass selection of the most stable non-overlapping clusters.
//!
//! The root is selected only when the hierarchy never splits into two
//! large-enough clusters. In that case the points that persist to the
//! root's final density level form cluster 0 and earlier drop-outs are
//! noise, so a lone pair of near-duplicates still forms a cluster.
//!
//! Everything is deterministic: points arrive in quote-id order and every
//! tie is broken by the lower index.

use std::collections::VecDeque;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::ClusterLabel;
use crate::vectors::EmbeddingSet;

/// Upper bound on `λ`, used for zero distances (duplicate points).
const LAMBDA_CEILING: f64 = 1e12;

/// Relative tolerance when deciding whether a point persists to the root's
/// final density level.
const ROOT_LAMBDA_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdbscanParams {
    /// Smallest group that counts as a cluster. At least 2.
    pub min_cluster_size: usize,
    /// Neighborhood size for core distances. `1..=min_cluster_size`.
    pub min_samples: usize,
}

impl Default for HdbscanParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 2,
            min_samples: 1,
        }
    }
}

impl HdbscanParams {
    pub fn validate(&self) -> Result<()> {
        if self.min_cluster_size < 2 {
            return Err(EngineError::invalid(format!(
                "min_cluster_size must be >= 2, got {}",
                self.min_cluster_size
            )));
        }
        if self.min_samples == 0 || self.min_samples > self.min_cluster_size {
            return Err(EngineError::invalid(format!(
                "min_samples must be within 1..={}, got {}",
                self.min_cluster_size, self.min_samples
            )));
        }
        Ok(())
    }
}

/// Output of one clustering run, indexed like the input set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterAssignment {
    pub labels: Vec<ClusterLabel>,
    /// Membership strength in `[0, 1]`; `0` for noise.
    pub probabilities: Vec<f64>,
    /// Excess-of-mass stability per cluster label.
    pub stabilities: Vec<f64>,
}

impl ClusterAssignment {
    fn all_noise(n: usize) -> Self {
        Self {
            labels: vec![ClusterLabel::Noise; n],
            probabilities: vec![0.0; n],
            stabilities: Vec::new(),
        }
    }

    pub fn clusters_found(&self) -> usize {
        self.stabilities.len()
    }

    pub fn noise_count(&self) -> usize {
        self.labels.iter().filter(|l| l.is_noise()).count()
    }
}

#[derive(Debug, Clone)]
pub struct HdbscanClusterer {
    params: HdbscanParams,
}

impl HdbscanClusterer {
    pub fn new(params: HdbscanParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &HdbscanParams {
        &self.params
    }

    pub fn fit(&self, set: &EmbeddingSet) -> ClusterAssignment {
        self.fit_points(&set.normalized())
    }

    /// Cluster pre-normalized points.
    pub fn fit_points(&self, points: &[Vec<f64>]) -> ClusterAssignment {
        let n = points.len();
        if n == 0 {
            return ClusterAssignment::default();
        }
        if n < self.params.min_cluster_size {
            return ClusterAssignment::all_noise(n);
        }

        let dist = pairwise_distances(points);
        let core = core_distances(&dist, n, self.params.min_samples);
        let mst = prim_mst(&dist, &core, n);
        let linkage = single_linkage(n, &mst);
        let tree = condense(n, &linkage, self.params.min_cluster_size);
        select(&tree)
    }
}

/// Flat row-major `n × n` Euclidean distance matrix.
fn pairwise_distances(points: &[Vec<f64>]) -> Vec<f64> {
    let n = points.len();
    let mut dist = vec![0.0f64; n * n];
    dist.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (j, cell) in row.iter_mut().enumerate() {
            if i != j {
                *cell = points[i]
                    .iter()
                    .zip(points[j].iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>()
                    .sqrt();
            }
        }
    });
    dist
}

fn core_distances(dist: &[f64], n: usize, min_samples: usize) -> Vec<f64> {
    let k = min_samples.min(n - 1).max(1);
    (0..n)
        .map(|i| {
            let mut others: Vec<f64> = (0..n)
                .filter(|&j| j != i)
                .map(|j| dist[i * n + j])
                .collect();
            others.sort_by(|a, b| a.total_cmp(b));
            others[k - 1]
        })
        .collect()
}

/// Dense Prim over mutual reachability. Returns `n - 1` edges sorted by
/// weight (stable, so equal weights keep discovery order).
fn prim_mst(dist: &[f64], core: &[f64], n: usize) -> Vec<(usize, usize, f64)> {
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n - 1);

    let mut current = 0usize;
    in_tree[0] = true;
    for _ in 1..n {
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            let reach = dist[current * n + j].max(core[current]).max(core[j]);
            if reach < best[j] {
                best[j] = reach;
                from[j] = current;
            }
        }

        let mut next = usize::MAX;
        for j in 0..n {
            if !in_tree[j] && (next == usize::MAX || best[j] < best[next]) {
                next = j;
            }
        }
        in_tree[next] = true;
        edges.push((from[next], next, best[next]));
        current = next;
    }

    edges.sort_by(|a, b| a.2.total_cmp(&b.2));
    edges
}

#[derive(Debug, Clone)]
struct LinkageNode {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

/// Merge tree: node `n + k` is created by the `k`-th MST edge. The root is
/// node `2n - 2`.
fn single_linkage(n: usize, mst: &[(usize, usize, f64)]) -> Vec<LinkageNode> {
    let mut parent: Vec<usize> = (0..2 * n - 1).collect();
    let mut sizes = vec![1usize; 2 * n - 1];
    let mut nodes = Vec::with_capacity(n - 1);

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        let mut root = x;
        while parent[root] != root {
            root = parent[root];
        }
        while parent[x] != root {
            let next = parent[x];
            parent[x] = root;
            x = next;
        }
        root
    }

    for (k, &(a, b, w)) in mst.iter().enumerate() {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        let id = n + k;
        let size = sizes[ra] + sizes[rb];
        sizes[id] = size;
        parent[ra] = id;
        parent[rb] = id;
        nodes.push(LinkageNode {
            left: ra,
            right: rb,
            distance: w,
            size,
        });
    }
    nodes
}

#[derive(Debug, Clone)]
struct CondensedCluster {
    parent: Option<usize>,
    birth: f64,
    size: usize,
    children: Vec<usize>,
}

#[derive(Debug, Clone)]
struct CondensedTree {
    clusters: Vec<CondensedCluster>,
    /// Cluster each point fell out of.
    point_cluster: Vec<usize>,
    /// Density level at which each point fell out.
    point_lambda: Vec<f64>,
}

fn lambda_of(distance: f64) -> f64 {
    if distance <= 1.0 / LAMBDA_CEILING {
        LAMBDA_CEILING
    } else {
        (1.0 / distance).min(LAMBDA_CEILING)
    }
}

fn node_size(node: usize, n: usize, linkage: &[LinkageNode]) -> usize {
    if node < n {
        1
    } else {
        linkage[node - n].size
    }
}

fn leaves(node: usize, n: usize, linkage: &[LinkageNode]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(x) = stack.pop() {
        if x < n {
            out.push(x);
        } else {
            let link = &linkage[x - n];
            stack.push(link.right);
            stack.push(link.left);
        }
    }
    out
}

fn condense(n: usize, linkage: &[LinkageNode], min_cluster_size: usize) -> CondensedTree {
    let mut clusters = vec![CondensedCluster {
        parent: None,
        birth: 0.0,
        size: n,
        children: Vec::new(),
    }];
    let mut point_cluster = vec![0usize; n];
    let mut point_lambda = vec![0.0f64; n];

    let mut queue = VecDeque::from([(2 * n - 2, 0usize)]);
    while let Some((node, cluster)) = queue.pop_front() {
        if node < n {
            point_cluster[node] = cluster;
            point_lambda[node] = clusters[cluster].birth;
            continue;
        }

        let link = &linkage[node - n];
        let lambda = lambda_of(link.distance);
        let (left, right) = (link.left, link.right);
        let left_big = node_size(left, n, linkage) >= min_cluster_size;
        let right_big = node_size(right, n, linkage) >= min_cluster_size;

        let mut fall_out = |subtree: usize| {
            for p in leaves(subtree, n, linkage) {
                point_cluster[p] = cluster;
                point_lambda[p] = lambda;
            }
        };

        match (left_big, right_big) {
            (true, true) => {
                for child in [left, right] {
                    let id = clusters.len();
                    clusters.push(CondensedCluster {
                        parent: Some(cluster),
                        birth: lambda,
                        size: node_size(child, n, linkage),
                        children: Vec::new(),
                    });
                    clusters[cluster].children.push(id);
                    queue.push_back((child, id));
                }
            }
            (true, false) => {
                fall_out(right);
                queue.push_back((left, cluster));
            }
            (false, true) => {
                fall_out(left);
                queue.push_back((right, cluster));
            }
            (false, false) => {
                fall_out(left);
                fall_out(right);
            }
        }
    }

    CondensedTree {
        clusters,
        point_cluster,
        point_lambda,
    }
}

fn stabilities(tree: &CondensedTree) -> Vec<f64> {
    let mut stability = vec![0.0f64; tree.clusters.len()];
    for (p, &c) in tree.point_cluster.iter().enumerate() {
        stability[c] += tree.point_lambda[p] - tree.clusters[c].birth;
    }
    for cluster in &tree.clusters {
        if let Some(parent) = cluster.parent {
            stability[parent] +=
                (cluster.birth - tree.clusters[parent].birth) * cluster.size as f64;
        }
    }
    stability
}

fn select(tree: &CondensedTree) -> ClusterAssignment {
    let n = tree.point_cluster.len();
    let stability = stabilities(tree);

    if tree.clusters[0].children.is_empty() {
        return select_root(tree, stability[0]);
    }

    // Children always have larger indices than their parent, so a reverse
    // sweep sees every subtree before its root. The root itself is skipped.
    let m = tree.clusters.len();
    let mut selected = vec![false; m];
    let mut subtree = vec![0.0f64; m];
    for c in (1..m).rev() {
        let children = &tree.clusters[c].children;
        let child_sum: f64 = children.iter().map(|&k| subtree[k]).sum();
        if children.is_empty() || stability[c] >= child_sum {
            selected[c] = true;
            subtree[c] = stability[c];
            let mut stack = children.clone();
            while let Some(k) = stack.pop() {
                selected[k] = false;
                stack.extend(tree.clusters[k].children.iter().copied());
            }
        } else {
            subtree[c] = child_sum;
        }
    }

    let mut label_of = vec![None; m];
    let mut stabilities_out = Vec::new();
    for c in 0..m {
        if selected[c] {
            label_of[c] = Some(stabilities_out.len() as u32);
            stabilities_out.push(stability[c]);
        }
    }

    let mut labels = vec![ClusterLabel::Noise; n];
    for p in 0..n {
        let mut c = Some(tree.point_cluster[p]);
        while let Some(idx) = c {
            if let Some(label) = label_of[idx] {
                labels[p] = ClusterLabel::Cluster(label);
                break;
            }
            c = tree.clusters[idx].parent;
        }
    }

    let mut max_lambda = vec![0.0f64; stabilities_out.len()];
    for p in 0..n {
        if let ClusterLabel::Cluster(label) = labels[p] {
            let slot = &mut max_lambda[label as usize];
            *slot = slot.max(tree.point_lambda[p]);
        }
    }
    let probabilities = (0..n)
        .map(|p| match labels[p] {
            ClusterLabel::Noise => 0.0,
            ClusterLabel::Cluster(label) => membership(tree.point_lambda[p], max_lambda[label as usize]),
        })
        .collect();

    ClusterAssignment {
        labels,
        probabilities,
        stabilities: stabilities_out,
    }
}

/// The hierarchy never split into two real clusters. Points that stay with
/// the root until its last density level form cluster 0.
fn select_root(tree: &CondensedTree, root_stability: f64) -> ClusterAssignment {
    let max_lambda = tree
        .point_lambda
        .iter()
        .copied()
        .fold(0.0f64, f64::max);
    let cutoff = max_lambda * (1.0 - ROOT_LAMBDA_TOLERANCE);

    let mut labels = Vec::with_capacity(tree.point_lambda.len());
    let mut probabilities = Vec::with_capacity(tree.point_lambda.len());
    for &lambda in &tree.point_lambda {
        if lambda >= cutoff {
            labels.push(ClusterLabel::Cluster(0));
            probabilities.push(membership(lambda, max_lambda));
        } else {
            labels.push(ClusterLabel::Noise);
            probabilities.push(0.0);
        }
    }

    ClusterAssignment {
        labels,
        probabilities,
        stabilities: vec![root_stability],
    }
}

fn membership(lambda: f64, max_lambda: f64) -> f64 {
    if max_lambda > 0.0 {
        (lambda / max_lambda).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(vectors: &[&[f32]]) -> EmbeddingSet {
        EmbeddingSet::from_pairs(
            vectors
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("q{:02}", i), v.to_vec()))
                .collect(),
        )
        .unwrap()
    }

    fn default_clusterer() -> HdbscanClusterer {
        HdbscanClusterer::new(HdbscanParams::default()).unwrap()
    }

    #[test]
    fn params_validation() {
        assert!(HdbscanParams::default().validate().is_ok());
        let bad = [
            HdbscanParams { min_cluster_size: 1, min_samples: 1 },
            HdbscanParams { min_cluster_size: 3, min_samples: 0 },
            HdbscanParams { min_cluster_size: 3, min_samples: 4 },
        ];
        for p in bad {
            assert!(matches!(p.validate(), Err(EngineError::InvalidParameter(_))));
            assert!(HdbscanClusterer::new(p).is_err());
        }
        assert!(HdbscanParams { min_cluster_size: 3, min_samples: 3 }.validate().is_ok());
    }

    #[test]
    fn empty_and_single_inputs() {
        let c = default_clusterer();
        let empty = c.fit(&EmbeddingSet::default());
        assert!(empty.labels.is_empty());
        assert_eq!(empty.clusters_found(), 0);

        let single = c.fit(&set(&[&[1.0, 0.0]]));
        assert_eq!(single.labels, vec![ClusterLabel::Noise]);
        assert_eq!(single.noise_count(), 1);
        assert_eq!(single.clusters_found(), 0);
    }

    #[test]
    fn near_duplicates_cluster_distant_is_noise() {
        let result = default_clusterer().fit(&set(&[
            &[1.0, 0.0, 0.0],
            &[0.99, 0.1, 0.0],
            &[0.0, 0.0, 1.0],
        ]));
        assert_eq!(result.clusters_found(), 1);
        assert_eq!(result.labels[0], ClusterLabel::Cluster(0));
        assert_eq!(result.labels[1], ClusterLabel::Cluster(0));
        assert_eq!(result.labels[2], ClusterLabel::Noise);
        assert_eq!(result.probabilities[2], 0.0);
        assert!((result.probabilities[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn two_far_pairs_form_two_clusters() {
        let result = default_clusterer().fit(&set(&[
            &[1.0, 0.0, 0.0],
            &[0.98, 0.05, 0.0],
            &[0.0, 0.0, 1.0],
            &[0.0, 0.05, 0.98],
        ]));
        assert_eq!(result.clusters_found(), 2);
        assert_eq!(result.noise_count(), 0);
        assert_eq!(result.labels[0], result.labels[1]);
        assert_eq!(result.labels[2], result.labels[3]);
        assert_ne!(result.labels[0], result.labels[2]);
    }

    #[test]
    fn outlier_between_groups_is_noise() {
        let clusterer = HdbscanClusterer::new(HdbscanParams {
            min_cluster_size: 3,
            min_samples: 2,
        })
        .unwrap();
        let result = clusterer.fit(&set(&[
            &[1.0, 0.0, 0.0],
            &[1.0, 0.05, 0.0],
            &[1.0, 0.0, 0.05],
            &[1.0, 0.05, 0.05],
            &[1.0, -0.05, 0.0],
            &[0.0, 1.0, 0.0],
            &[0.05, 1.0, 0.0],
            &[0.0, 1.0, 0.05],
            &[0.05, 1.0, 0.05],
            &[-0.05, 1.0, 0.0],
            &[-1.0, -1.0, 0.0],
        ]));
        assert_eq!(result.clusters_found(), 2);
        assert_eq!(result.labels[10], ClusterLabel::Noise);
        for i in 1..5 {
            assert_eq!(result.labels[i], result.labels[0]);
            assert_eq!(result.labels[i + 5], result.labels[5]);
        }
        assert_ne!(result.labels[0], result.labels[5]);
        assert!(!result.labels[0].is_noise());
        assert!(result.stabilities.iter().all(|s| *s > 0.0));
    }

    #[test]
    fn identical_vectors_form_one_cluster() {
        let v: &[f32] = &[0.3, 0.4, 0.5];
        let result = default_clusterer().fit(&set(&[v, v, v, v]));
        assert_eq!(result.clusters_found(), 1);
        assert!(result.labels.iter().all(|l| *l == ClusterLabel::Cluster(0)));
    }

    #[test]
    fn fewer_points_than_min_cluster_size_are_noise() {
        let clusterer = HdbscanClusterer::new(HdbscanParams {
            min_cluster_size: 5,
            min_samples: 2,
        })
        .unwrap();
        let result = clusterer.fit(&set(&[&[1.0, 0.0], &[1.0, 0.01], &[0.0, 1.0]]));
        assert_eq!(result.noise_count(), 3);
        assert_eq!(result.clusters_found(), 0);
    }

    #[test]
    fn deterministic() {
        let vectors: Vec<Vec<f32>> = (0..30)
            .map(|i| {
                let t = i as f32 * 0.37;
                vec![t.sin(), t.cos(), (i % 3) as f32]
            })
            .collect();
        let refs: Vec<&[f32]> = vectors.iter().map(|v| v.as_slice()).collect();
        let s = set(&refs);
        let c = default_clusterer();
        assert_eq!(c.fit(&s), c.fit(&s));
    }

    #[test]
    fn labels_are_dense() {
        let result = default_clusterer().fit(&set(&[
            &[1.0, 0.0, 0.0],
            &[0.98, 0.05, 0.0],
            &[0.0, 1.0, 0.0],
            &[0.05, 0.98, 0.0],
            &[0.0, 0.0, 1.0],
            &[0.0, 0.05, 0.98],
        ]));
        let mut ids: Vec<u32> = result.labels.iter().filter_map(|l| l.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        let expected: Vec<u32> = (0..result.clusters_found() as u32).collect();
        assert_eq!(ids, expected);
    }
}
