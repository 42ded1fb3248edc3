//! Neighborhood-preserving 2-D layout (UMAP-style).
//!
//! Builds a fuzzy k-nearest-neighbor graph over cosine distance, seeds the
//! layout from the top two principal components, then refines it with
//! stochastic gradient descent using attractive updates along graph edges
//! and repulsive negative samples. The result is min-max normalized to
//! `[0, 1]` on both axes.
//!
//! All randomness comes from one `ChaCha8Rng` seeded from
//! [`ProjectionParams::seed`], so identical input gives identical output.
//! Inputs that leave nothing to optimise (one or two points, all points
//! identical) and runs that diverge get a fixed circular layout instead.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::vectors::EmbeddingSet;

const SMOOTH_K_TOLERANCE: f64 = 1e-5;
const SMOOTH_K_ITERATIONS: usize = 64;
const MIN_K_DIST_SCALE: f64 = 1e-3;
const GRADIENT_CLIP: f64 = 4.0;
const INIT_SCALE: f64 = 10.0;
const INIT_JITTER: f64 = 1e-4;
const POWER_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionParams {
    pub n_neighbors: usize,
    pub min_dist: f64,
    pub spread: f64,
    pub n_epochs: usize,
    pub negative_sample_rate: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            n_neighbors: 15,
            min_dist: 0.1,
            spread: 1.0,
            n_epochs: 200,
            negative_sample_rate: 5,
            learning_rate: 1.0,
            seed: 42,
        }
    }
}

impl ProjectionParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_neighbors < 2 {
            return Err(EngineError::invalid("n_neighbors must be >= 2"));
        }
        if !(self.min_dist >= 0.0) {
            return Err(EngineError::invalid("min_dist must be >= 0"));
        }
        if !(self.spread > 0.0) {
            return Err(EngineError::invalid("spread must be > 0"));
        }
        if self.min_dist > self.spread {
            return Err(EngineError::invalid("min_dist must not exceed spread"));
        }
        if self.n_epochs == 0 {
            return Err(EngineError::invalid("n_epochs must be >= 1"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(EngineError::invalid("learning_rate must be > 0"));
        }
        Ok(())
    }
}

/// A 2-D coordinate in `[0, 1]²`.
pub type Point2 = [f64; 2];

#[derive(Debug, Clone)]
pub struct Projector {
    params: ProjectionParams,
    a: f64,
    b: f64,
}

impl Projector {
    pub fn new(params: ProjectionParams) -> Result<Self> {
        params.validate()?;
        let (a, b) = fit_ab(params.spread, params.min_dist);
        Ok(Self { params, a, b })
    }

    pub fn params(&self) -> &ProjectionParams {
        &self.params
    }

    /// Curve parameters of the low-dimensional similarity `1 / (1 + a·d^2b)`.
    pub fn curve(&self) -> (f64, f64) {
        (self.a, self.b)
    }

    /// One coordinate per point of `set`, in set order.
    pub fn project(&self, set: &EmbeddingSet) -> Vec<Point2> {
        let n = set.len();
        if n <= 2 {
            return fixed_layout(n);
        }

        let points = set.normalized();
        if all_identical(&points) {
            return fixed_layout(n);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.params.seed);
        let k = self.params.n_neighbors.min(n - 1);
        let (knn_idx, knn_dist) = nearest_neighbors(&points, k);
        let graph = fuzzy_graph(&knn_idx, &knn_dist, k, self.params.n_epochs);
        if graph.is_empty() {
            return fixed_layout(n);
        }

        let mut layout = initial_layout(&points, &mut rng);
        self.optimize(&mut layout, &graph, &mut rng);

        if layout.iter().any(|p| !p[0].is_finite() || !p[1].is_finite()) {
            return fixed_layout(n);
        }
        min_max_normalize(&mut layout);
        layout
    }

    fn optimize(&self, layout: &mut [Point2], graph: &[GraphEdge], rng: &mut ChaCha8Rng) {
        let (a, b) = (self.a, self.b);
        let n = layout.len();
        let n_epochs = self.params.n_epochs;
        let neg_rate = self.params.negative_sample_rate as f64;

        let max_weight = graph.iter().map(|e| e.weight).fold(0.0f64, f64::max);
        let epochs_per_sample: Vec<f64> = graph.iter().map(|e| max_weight / e.weight).collect();
        let epochs_per_negative: Vec<f64> = if neg_rate > 0.0 {
            epochs_per_sample.iter().map(|e| e / neg_rate).collect()
        } else {
            vec![f64::INFINITY; graph.len()]
        };
        let mut next_sample = epochs_per_sample.clone();
        let mut next_negative = epochs_per_negative.clone();

        for epoch in 0..n_epochs {
            let alpha = self.params.learning_rate * (1.0 - epoch as f64 / n_epochs as f64);
            let epoch_f = epoch as f64;

            for (e, edge) in graph.iter().enumerate() {
                if next_sample[e] > epoch_f {
                    continue;
                }
                let (j, k) = (edge.head, edge.tail);

                let mut current = layout[j];
                let mut other = layout[k];
                let dist2 = squared_distance(&current, &other);
                let coeff = if dist2 > 0.0 {
                    -2.0 * a * b * dist2.powf(b - 1.0) / (a * dist2.powf(b) + 1.0)
                } else {
                    0.0
                };
                for d in 0..2 {
                    let grad = clip(coeff * (current[d] - other[d]));
                    current[d] += grad * alpha;
                    other[d] -= grad * alpha;
                }
                layout[j] = current;
                layout[k] = other;
                next_sample[e] += epochs_per_sample[e];

                let n_neg = ((epoch_f - next_negative[e]) / epochs_per_negative[e]).max(0.0) as usize;
                for _ in 0..n_neg {
                    let s = rng.gen_range(0..n);
                    if s == j {
                        continue;
                    }
                    let other = layout[s];
                    let dist2 = squared_distance(&current, &other);
                    let coeff = if dist2 > 0.0 {
                        2.0 * b / ((0.001 + dist2) * (a * dist2.powf(b) + 1.0))
                    } else {
                        0.0
                    };
                    for d in 0..2 {
                        let grad = if coeff > 0.0 {
                            clip(coeff * (current[d] - other[d]))
                        } else {
                            GRADIENT_CLIP
                        };
                        current[d] += grad * alpha;
                    }
                }
                layout[j] = current;
                next_negative[e] += n_neg as f64 * epochs_per_negative[e];
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct GraphEdge {
    head: usize,
    tail: usize,
    weight: f64,
}

fn clip(v: f64) -> f64 {
    v.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

fn squared_distance(a: &Point2, b: &Point2) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    (1.0 - dot).max(0.0)
}

fn all_identical(points: &[Vec<f64>]) -> bool {
    let first = &points[0];
    points
        .iter()
        .all(|p| p.iter().zip(first.iter()).all(|(x, y)| (x - y).abs() < 1e-12))
}

/// Deterministic layout for inputs that cannot be optimised.
pub fn fixed_layout(n: usize) -> Vec<Point2> {
    match n {
        0 => Vec::new(),
        1 => vec![[0.5, 0.5]],
        _ => (0..n)
            .map(|i| {
                let angle = 2.0 * PI * i as f64 / n as f64;
                [0.5 + 0.5 * angle.cos(), 0.5 + 0.5 * angle.sin()]
            })
            .collect(),
    }
}

/// `k` nearest other points by cosine distance, ties by index.
fn nearest_neighbors(points: &[Vec<f64>], k: usize) -> (Vec<Vec<usize>>, Vec<Vec<f64>>) {
    let rows: Vec<(Vec<usize>, Vec<f64>)> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            let mut candidates: Vec<(usize, f64)> = (0..points.len())
                .filter(|&j| j != i)
                .map(|j| (j, cosine_distance(&points[i], &points[j])))
                .collect();
            candidates.sort_by(|x, y| x.1.total_cmp(&y.1).then(x.0.cmp(&y.0)));
            candidates.truncate(k);
            candidates.into_iter().unzip()
        })
        .collect();
    rows.into_iter().unzip()
}

/// Per-point `(rho, sigma)` such that the neighbor memberships sum to
/// `log2(k)`.
fn smooth_knn(distances: &[f64], k: usize) -> (f64, f64) {
    let target = (k as f64).log2();
    let rho = distances.iter().copied().find(|d| *d > 0.0).unwrap_or(0.0);

    let mut lo = 0.0f64;
    let mut hi = f64::INFINITY;
    let mut mid = 1.0f64;
    for _ in 0..SMOOTH_K_ITERATIONS {
        let psum: f64 = distances
            .iter()
            .map(|d| {
                let excess = d - rho;
                if excess > 0.0 {
                    (-excess / mid).exp()
                } else {
                    1.0
                }
            })
            .sum();
        if (psum - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
        }
    }

    let mean = if distances.is_empty() {
        0.0
    } else {
        distances.iter().sum::<f64>() / distances.len() as f64
    };
    let sigma = mid.max(MIN_K_DIST_SCALE * mean).max(f64::MIN_POSITIVE);
    (rho, sigma)
}

/// Symmetrized fuzzy graph as directed edge pairs, sorted by `(head, tail)`.
/// Weak edges that would never be sampled within `n_epochs` are dropped.
fn fuzzy_graph(
    knn_idx: &[Vec<usize>],
    knn_dist: &[Vec<f64>],
    k: usize,
    n_epochs: usize,
) -> Vec<GraphEdge> {
    let mut directed: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for (i, (idx, dist)) in knn_idx.iter().zip(knn_dist.iter()).enumerate() {
        let (rho, sigma) = smooth_knn(dist, k);
        for (&j, &d) in idx.iter().zip(dist.iter()) {
            let w = if d - rho <= 0.0 {
                1.0
            } else {
                (-(d - rho) / sigma).exp()
            };
            directed.insert((i, j), w);
        }
    }

    let mut union: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for (&(i, j), &w) in &directed {
        let back = directed.get(&(j, i)).copied().unwrap_or(0.0);
        let combined = w + back - w * back;
        union.insert((i, j), combined);
        union.insert((j, i), combined);
    }

    let max_weight = union.values().copied().fold(0.0f64, f64::max);
    let floor = max_weight / n_epochs as f64;
    union
        .into_iter()
        .filter(|(_, w)| *w > 0.0 && *w >= floor)
        .map(|((head, tail), weight)| GraphEdge { head, tail, weight })
        .collect()
}

/// Top-two principal components scaled to `[-10, 10]`, plus a little
/// jitter. Falls back to a uniform random layout when the data has no
/// usable variance.
fn initial_layout(points: &[Vec<f64>], rng: &mut ChaCha8Rng) -> Vec<Point2> {
    let n = points.len();
    let dims = points[0].len();

    let mut mean = vec![0.0f64; dims];
    for p in points {
        for (m, x) in mean.iter_mut().zip(p.iter()) {
            *m += x;
        }
    }
    for m in &mut mean {
        *m /= n as f64;
    }
    let centered: Vec<Vec<f64>> = points
        .iter()
        .map(|p| p.iter().zip(mean.iter()).map(|(x, m)| x - m).collect())
        .collect();

    let first = principal_component(&centered, None, rng);
    let second = first
        .as_ref()
        .and_then(|v| principal_component(&centered, Some(v), rng));

    let mut layout: Vec<Point2> = match (first, second) {
        (Some(v1), Some(v2)) => centered
            .iter()
            .map(|p| [dot(p, &v1), dot(p, &v2)])
            .collect(),
        (Some(v1), None) => centered.iter().map(|p| [dot(p, &v1), 0.0]).collect(),
        _ => (0..n)
            .map(|_| {
                [
                    rng.gen_range(-INIT_SCALE..INIT_SCALE),
                    rng.gen_range(-INIT_SCALE..INIT_SCALE),
                ]
            })
            .collect(),
    };

    let max_abs = layout
        .iter()
        .flat_map(|p| p.iter())
        .fold(0.0f64, |acc, x| acc.max(x.abs()));
    if max_abs > 0.0 {
        for p in &mut layout {
            p[0] *= INIT_SCALE / max_abs;
            p[1] *= INIT_SCALE / max_abs;
        }
    }
    for p in &mut layout {
        p[0] += rng.gen_range(-INIT_JITTER..INIT_JITTER);
        p[1] += rng.gen_range(-INIT_JITTER..INIT_JITTER);
    }
    layout
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Leading eigenvector of `XᵀX` by power iteration, orthogonal to
/// `deflate` when given. `None` when the remaining variance is negligible.
fn principal_component(
    x: &[Vec<f64>],
    deflate: Option<&Vec<f64>>,
    rng: &mut ChaCha8Rng,
) -> Option<Vec<f64>> {
    let dims = x[0].len();
    let mut v: Vec<f64> = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let orthogonalize = |v: &mut Vec<f64>| {
        if let Some(u) = deflate {
            let proj = dot(v, u);
            for (vi, ui) in v.iter_mut().zip(u.iter()) {
                *vi -= proj * ui;
            }
        }
    };

    let mut eigenvalue = 0.0;
    for _ in 0..POWER_ITERATIONS {
        orthogonalize(&mut v);
        let norm = dot(&v, &v).sqrt();
        if norm < 1e-300 {
            return None;
        }
        for vi in &mut v {
            *vi /= norm;
        }
        let scores: Vec<f64> = x.iter().map(|row| dot(row, &v)).collect();
        let mut next = vec![0.0f64; dims];
        for (row, s) in x.iter().zip(scores.iter()) {
            for (ni, ri) in next.iter_mut().zip(row.iter()) {
                *ni += ri * s;
            }
        }
        eigenvalue = dot(&next, &next).sqrt();
        v = next;
    }
    orthogonalize(&mut v);
    let norm = dot(&v, &v).sqrt();
    if eigenvalue < 1e-12 || norm < 1e-300 {
        return None;
    }
    Some(v.into_iter().map(|vi| vi / norm).collect())
}

fn min_max_normalize(layout: &mut [Point2]) {
    for axis in 0..2 {
        let min = layout.iter().map(|p| p[axis]).fold(f64::INFINITY, f64::min);
        let max = layout
            .iter()
            .map(|p| p[axis])
            .fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        for p in layout.iter_mut() {
            p[axis] = if range > 0.0 {
                ((p[axis] - min) / range).clamp(0.0, 1.0)
            } else {
                0.5
            };
        }
    }
}

/// Least-squares fit of `1 / (1 + a·x^2b)` to the target membership curve
/// (1 below `min_dist`, exponential decay with `spread` above), sampled on
/// 300 points over `[0, 3·spread]`.
fn fit_ab(spread: f64, min_dist: f64) -> (f64, f64) {
    let xs: Vec<f64> = (0..300).map(|i| 3.0 * spread * i as f64 / 299.0).collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|&x| {
            if x < min_dist {
                1.0
            } else {
                (-(x - min_dist) / spread).exp()
            }
        })
        .collect();

    let loss = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(ys.iter())
            .map(|(&x, &y)| {
                let f = 1.0 / (1.0 + a * x.powf(2.0 * b));
                (f - y).powi(2)
            })
            .sum()
    };

    let mut best = (1.0f64, 1.0f64);
    let mut best_loss = f64::INFINITY;
    for ia in 0..120 {
        let a = 10f64.powf(-3.0 + 5.0 * ia as f64 / 119.0);
        for ib in 0..120 {
            let b = 0.05 + 2.95 * ib as f64 / 119.0;
            let l = loss(a, b);
            if l < best_loss {
                best_loss = l;
                best = (a, b);
            }
        }
    }

    let (mut a, mut b) = best;
    let mut step_a = a * 0.1;
    let mut step_b = 0.05;
    while step_a > 1e-9 || step_b > 1e-9 {
        let mut improved = false;
        for (da, db) in [(step_a, 0.0), (-step_a, 0.0), (0.0, step_b), (0.0, -step_b)] {
            let (na, nb) = (a + da, b + db);
            if na <= 0.0 || nb <= 0.0 {
                continue;
            }
            let l = loss(na, nb);
            if l < best_loss {
                best_loss = l;
                a = na;
                b = nb;
                improved = true;
            }
        }
        if !improved {
            step_a /= 2.0;
            step_b /= 2.0;
        }
    }
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(vectors: Vec<Vec<f32>>) -> EmbeddingSet {
        EmbeddingSet::from_pairs(
            vectors
                .into_iter()
                .enumerate()
                .map(|(i, v)| (format!("q{:03}", i), v))
                .collect(),
        )
        .unwrap()
    }

    fn two_groups() -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        for i in 0..8 {
            let t = i as f32 * 0.02;
            out.push(vec![1.0, t, 0.0, 0.01 * (i % 3) as f32]);
            out.push(vec![0.0, t, 1.0, 0.01 * (i % 2) as f32]);
        }
        out
    }

    fn projector() -> Projector {
        Projector::new(ProjectionParams {
            n_neighbors: 5,
            ..ProjectionParams::default()
        })
        .unwrap()
    }

    #[test]
    fn curve_fit_matches_reference_values() {
        let p = Projector::new(ProjectionParams::default()).unwrap();
        let (a, b) = p.curve();
        assert!((a - 1.577).abs() < 0.02, "a = {a}");
        assert!((b - 0.895).abs() < 0.01, "b = {b}");
    }

    #[test]
    fn params_validation() {
        let bad = [
            ProjectionParams { n_neighbors: 1, ..Default::default() },
            ProjectionParams { min_dist: -0.1, ..Default::default() },
            ProjectionParams { spread: 0.0, ..Default::default() },
            ProjectionParams { n_epochs: 0, ..Default::default() },
            ProjectionParams { min_dist: 2.0, ..Default::default() },
        ];
        for p in bad {
            assert!(matches!(Projector::new(p), Err(EngineError::InvalidParameter(_))));
        }
    }

    #[test]
    fn degenerate_inputs_use_fixed_layout() {
        let p = projector();
        assert!(p.project(&EmbeddingSet::default()).is_empty());
        assert_eq!(p.project(&set(vec![vec![1.0, 2.0]])), vec![[0.5, 0.5]]);

        let two = p.project(&set(vec![vec![1.0, 0.0], vec![0.0, 1.0]]));
        assert_eq!(two, fixed_layout(2));
        assert!((two[0][0] - 1.0).abs() < 1e-12);
        assert!((two[1][0] - 0.0).abs() < 1e-12);

        let same = p.project(&set(vec![vec![0.2, 0.3]; 5]));
        assert_eq!(same, fixed_layout(5));
    }

    #[test]
    fn coordinates_in_unit_square() {
        let layout = projector().project(&set(two_groups()));
        assert_eq!(layout.len(), 16);
        for axis in 0..2 {
            let min = layout.iter().map(|p| p[axis]).fold(f64::INFINITY, f64::min);
            let max = layout.iter().map(|p| p[axis]).fold(f64::NEG_INFINITY, f64::max);
            assert!(min >= 0.0 && max <= 1.0);
            assert!(min.abs() < 1e-12 || (max - min).abs() < 1e-12 || min == 0.5);
        }
    }

    #[test]
    fn deterministic_for_fixed_seed() {
        let s = set(two_groups());
        let p = projector();
        assert_eq!(p.project(&s), p.project(&s));
    }

    #[test]
    fn groups_stay_apart() {
        let s = set(two_groups());
        let layout = projector().project(&s);
        // Even ids are the first group, odd ids the second.
        let group = |i: usize| s.id(i)[1..].parse::<usize>().unwrap() % 2;

        let mut intra = (0.0, 0usize);
        let mut inter = (0.0, 0usize);
        for i in 0..layout.len() {
            for j in (i + 1)..layout.len() {
                let d = squared_distance(&layout[i], &layout[j]).sqrt();
                if group(i) == group(j) {
                    intra = (intra.0 + d, intra.1 + 1);
                } else {
                    inter = (inter.0 + d, inter.1 + 1);
                }
            }
        }
        assert!(intra.0 / (intra.1 as f64) < inter.0 / (inter.1 as f64));
    }

    #[test]
    fn n_neighbors_clamped_for_small_sets() {
        let p = Projector::new(ProjectionParams::default()).unwrap();
        let layout = p.project(&set(vec![
            vec![1.0, 0.0, 0.0],
            vec![0.9, 0.1, 0.0],
            vec![0.0, 0.0, 1.0],
        ]));
        assert_eq!(layout.len(), 3);
        assert!(layout.iter().all(|q| q[0].is_finite() && q[1].is_finite()));
    }
}
