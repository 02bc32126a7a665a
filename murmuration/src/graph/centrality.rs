// murmuration/src/graph/centrality.rs
//
// Centrality metrics over index-addressed adjacency lists.
//
//   degree       distinct undirected neighbors, a kept self loop counts the
//                node as its own neighbor
//   pagerank     weighted, directed (kept self loops included), dangling
//                mass spread uniformly
//   betweenness  Brandes, undirected, unweighted hops, loops never on a path
//
// Every metric iterates nodes in index order, so results are bit-identical
// across runs for the same graph.

use std::collections::VecDeque;

use crate::config::GraphConfig;

use super::CentralityMetric;

pub(crate) fn compute(
    metric: CentralityMetric,
    adjacency: &[Vec<(usize, f64)>],
    out_weights: &[Vec<(usize, f64)>],
    self_loops: &[f64],
    cfg: &GraphConfig,
) -> Vec<f64> {
    match metric {
        CentralityMetric::Degree => degree(adjacency, self_loops),
        CentralityMetric::PageRank => pagerank(
            out_weights,
            cfg.pagerank_damping,
            cfg.pagerank_max_iter,
            cfg.pagerank_tolerance,
        ),
        CentralityMetric::Betweenness => betweenness(adjacency),
    }
}

pub(crate) fn degree(adjacency: &[Vec<(usize, f64)>], self_loops: &[f64]) -> Vec<f64> {
    adjacency
        .iter()
        .enumerate()
        .map(|(i, n)| {
            let looped = self_loops.get(i).is_some_and(|w| *w > 0.0);
            n.len() as f64 + if looped { 1.0 } else { 0.0 }
        })
        .collect()
}

pub(crate) fn pagerank(
    out_weights: &[Vec<(usize, f64)>],
    damping: f64,
    max_iter: usize,
    tolerance: f64,
) -> Vec<f64> {
    let n = out_weights.len();
    if n == 0 {
        return Vec::new();
    }
    let uniform = 1.0 / n as f64;
    let totals: Vec<f64> = out_weights
        .iter()
        .map(|edges| edges.iter().map(|(_, w)| *w).sum())
        .collect();

    let mut rank = vec![uniform; n];
    for _ in 0..max_iter {
        let dangling: f64 = (0..n).filter(|&i| totals[i] <= 0.0).map(|i| rank[i]).sum();
        let base = (1.0 - damping) * uniform + damping * dangling * uniform;
        let mut next = vec![base; n];
        for (i, edges) in out_weights.iter().enumerate() {
            if totals[i] <= 0.0 {
                continue;
            }
            let share = damping * rank[i] / totals[i];
            for (j, w) in edges {
                next[*j] += share * w;
            }
        }
        let delta: f64 = next.iter().zip(&rank).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < tolerance {
            break;
        }
    }
    rank
}

pub(crate) fn betweenness(adjacency: &[Vec<(usize, f64)>]) -> Vec<f64> {
    let n = adjacency.len();
    let mut cb = vec![0.0f64; n];

    for s in 0..n {
        let mut stack = Vec::with_capacity(n);
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0f64; n];
        let mut dist = vec![-1i64; n];
        sigma[s] = 1.0;
        dist[s] = 0;

        let mut queue = VecDeque::from([s]);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            for (w, _) in &adjacency[v] {
                let w = *w;
                if dist[w] < 0 {
                    dist[w] = dist[v] + 1;
                    queue.push_back(w);
                }
                if dist[w] == dist[v] + 1 {
                    sigma[w] += sigma[v];
                    preds[w].push(v);
                }
            }
        }

        let mut delta = vec![0.0f64; n];
        while let Some(w) = stack.pop() {
            for &v in &preds[w] {
                delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
            }
            if w != s {
                cb[w] += delta[w];
            }
        }
    }

    // each undirected path was counted from both endpoints
    cb.iter_mut().for_each(|c| *c /= 2.0);
    cb
}

/// Scale by the maximum so the most central node is 1.0; all-zero stays zero.
pub(crate) fn normalize_by_max(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(0.0f64, f64::max);
    if max <= 0.0 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v / max).clamp(0.0, 1.0)).collect()
}
