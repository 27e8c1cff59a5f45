//! Second-order regression tree shared by the boosted learners.
//!
//! Fitted on per-sample gradients `g` and hessians `h`. A split is scored by
//! `G_L²/(H_L+λ) + G_R²/(H_R+λ) − G²/(H+λ) − γ` and accepted only when the
//! gain is positive; leaves predict `−G/(H+λ)`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    pub max_depth: usize,
    /// Minimum hessian sum in each child.
    pub min_child_weight: f64,
    /// L2 penalty on leaf values.
    pub lambda: f64,
    /// Minimum gain required to split.
    pub gamma: f64,
    /// Candidate thresholds per feature from quantile bins; `None` = exact.
    pub max_bins: Option<usize>,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_child_weight: 1e-3,
            lambda: 1e-3,
            gamma: 0.0,
            max_bins: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

/// Node arena; index 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

struct FitContext<'a> {
    rows: &'a [Vec<f64>],
    grad: &'a [f64],
    hess: &'a [f64],
    params: &'a TreeParams,
    /// Sorted candidate thresholds per feature when binning.
    edges: Option<Vec<Vec<f64>>>,
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

impl RegressionTree {
    /// Fit on the rows listed in `sample`.
    pub fn fit(
        rows: &[Vec<f64>],
        grad: &[f64],
        hess: &[f64],
        sample: &[usize],
        params: &TreeParams,
    ) -> Self {
        let edges = params
            .max_bins
            .map(|bins| bin_edges(rows, sample, bins.max(2)));
        let ctx = FitContext {
            rows,
            grad,
            hess,
            params,
            edges,
        };
        let mut nodes = Vec::new();
        build(&ctx, &mut nodes, sample.to_vec(), 0);
        Self { nodes }
    }

    /// Constant tree.
    pub fn leaf(value: f64) -> Self {
        Self {
            nodes: vec![Node::Leaf { value }],
        }
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut i = 0;
        loop {
            match &self.nodes[i] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let x = row.get(*feature).copied().unwrap_or(0.0);
                    i = if x <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], i: usize) -> usize {
            match &nodes[i] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    /// Highest feature index referenced by a split.
    pub fn max_feature(&self) -> Option<usize> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                Node::Split { feature, .. } => Some(*feature),
                Node::Leaf { .. } => None,
            })
            .max()
    }
}

fn build(ctx: &FitContext<'_>, nodes: &mut Vec<Node>, idx: Vec<usize>, depth: usize) -> usize {
    let (g, h) = sums(ctx, &idx);
    let lambda = ctx.params.lambda;
    let id = nodes.len();
    nodes.push(Node::Leaf {
        value: leaf_value(g, h, lambda),
    });

    if depth >= ctx.params.max_depth || idx.len() < 2 {
        return id;
    }
    let Some(best) = best_split(ctx, &idx, g, h) else {
        return id;
    };

    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = idx
        .into_iter()
        .partition(|&k| ctx.rows[k][best.feature] <= best.threshold);
    let left = build(ctx, nodes, left_idx, depth + 1);
    let right = build(ctx, nodes, right_idx, depth + 1);
    nodes[id] = Node::Split {
        feature: best.feature,
        threshold: best.threshold,
        left,
        right,
    };
    id
}

fn sums(ctx: &FitContext<'_>, idx: &[usize]) -> (f64, f64) {
    idx.iter()
        .fold((0.0, 0.0), |(g, h), &k| (g + ctx.grad[k], h + ctx.hess[k]))
}

fn leaf_value(g: f64, h: f64, lambda: f64) -> f64 {
    let denom = h + lambda;
    if denom > 0.0 {
        -g / denom
    } else {
        0.0
    }
}

fn score(g: f64, h: f64, lambda: f64) -> f64 {
    let denom = h + lambda;
    if denom > 0.0 {
        g * g / denom
    } else {
        0.0
    }
}

fn best_split(ctx: &FitContext<'_>, idx: &[usize], g: f64, h: f64) -> Option<SplitCandidate> {
    let n_features = ctx.rows[idx[0]].len();
    let parent = score(g, h, ctx.params.lambda);
    let mut best: Option<SplitCandidate> = None;
    for f in 0..n_features {
        let candidate = match &ctx.edges {
            Some(edges) => split_binned(ctx, idx, f, &edges[f], g, h, parent),
            None => split_exact(ctx, idx, f, g, h, parent),
        };
        if let Some(c) = candidate {
            if best.as_ref().map_or(true, |b| c.gain > b.gain) {
                best = Some(c);
            }
        }
    }
    best
}

fn gain(ctx: &FitContext<'_>, gl: f64, hl: f64, g: f64, h: f64, parent: f64) -> Option<f64> {
    let p = ctx.params;
    let (gr, hr) = (g - gl, h - hl);
    if hl < p.min_child_weight || hr < p.min_child_weight {
        return None;
    }
    let gain = score(gl, hl, p.lambda) + score(gr, hr, p.lambda) - parent - p.gamma;
    (gain > 1e-12).then_some(gain)
}

fn split_exact(
    ctx: &FitContext<'_>,
    idx: &[usize],
    f: usize,
    g: f64,
    h: f64,
    parent: f64,
) -> Option<SplitCandidate> {
    let mut order: Vec<usize> = idx.to_vec();
    order.sort_by(|&a, &b| ctx.rows[a][f].total_cmp(&ctx.rows[b][f]));

    let mut best: Option<SplitCandidate> = None;
    let (mut gl, mut hl) = (0.0, 0.0);
    for w in order.windows(2) {
        gl += ctx.grad[w[0]];
        hl += ctx.hess[w[0]];
        let (lo, hi) = (ctx.rows[w[0]][f], ctx.rows[w[1]][f]);
        if lo == hi {
            continue;
        }
        if let Some(gain) = gain(ctx, gl, hl, g, h, parent) {
            if best.as_ref().map_or(true, |b| gain > b.gain) {
                best = Some(SplitCandidate {
                    feature: f,
                    threshold: lo + (hi - lo) / 2.0,
                    gain,
                });
            }
        }
    }
    best
}

fn split_binned(
    ctx: &FitContext<'_>,
    idx: &[usize],
    f: usize,
    edges: &[f64],
    g: f64,
    h: f64,
    parent: f64,
) -> Option<SplitCandidate> {
    if edges.is_empty() {
        return None;
    }
    // bin b holds values in (edges[b-1], edges[b]]; the last bin is open
    let mut hist = vec![(0.0_f64, 0.0_f64); edges.len() + 1];
    for &k in idx {
        let x = ctx.rows[k][f];
        let b = edges.partition_point(|&e| e < x);
        hist[b].0 += ctx.grad[k];
        hist[b].1 += ctx.hess[k];
    }

    let mut best: Option<SplitCandidate> = None;
    let (mut gl, mut hl) = (0.0, 0.0);
    for (b, &edge) in edges.iter().enumerate() {
        gl += hist[b].0;
        hl += hist[b].1;
        if let Some(gain) = gain(ctx, gl, hl, g, h, parent) {
            if best.as_ref().map_or(true, |c| gain > c.gain) {
                best = Some(SplitCandidate {
                    feature: f,
                    threshold: edge,
                    gain,
                });
            }
        }
    }
    best
}

/// Distinct quantile cut points per feature over the sampled rows.
fn bin_edges(rows: &[Vec<f64>], sample: &[usize], bins: usize) -> Vec<Vec<f64>> {
    let n_features = sample.first().map_or(0, |&k| rows[k].len());
    (0..n_features)
        .map(|f| {
            let mut values: Vec<f64> = sample.iter().map(|&k| rows[k][f]).collect();
            values.sort_by(f64::total_cmp);
            let mut edges: Vec<f64> = (1..bins)
                .map(|q| values[(q * values.len() / bins).min(values.len() - 1)])
                .collect();
            edges.dedup();
            // the maximum as an edge would put everything on the left
            if edges.last() == values.last() {
                edges.pop();
            }
            edges
        })
        .collect()
}
