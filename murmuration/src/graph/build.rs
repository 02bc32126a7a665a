// murmuration/src/graph/build.rs
//
// Graph construction from raw interaction records.
//
// Records are validated one by one; bad ones become diagnostics and never
// abort the build. Surviving records are folded into one edge per
// (source, target, kind), then centralities and communities are computed
// before the graph is handed out.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, info};

use crate::context::RunContext;
use crate::error::{DetectError, Diagnostic};
use crate::events::{AccountId, InteractionKind, InteractionRecord};

use super::{centrality, community, CentralityMetric, EdgeData, Graph, GraphStats};

const COMMUNITY_STREAM: u64 = 0x636f_6d6d; // "comm"

pub struct InteractionGraph;

impl InteractionGraph {
    /// Build from records whose endpoints must appear in `known`.
    pub fn build(
        ctx: &RunContext,
        records: &[InteractionRecord],
        known: &BTreeSet<AccountId>,
    ) -> Result<Graph, DetectError> {
        Self::build_inner(ctx, records, Some(known))
    }

    /// Build treating every endpoint as a known account.
    pub fn from_records(ctx: &RunContext, records: &[InteractionRecord]) -> Result<Graph, DetectError> {
        Self::build_inner(ctx, records, None)
    }

    fn build_inner(
        ctx: &RunContext,
        records: &[InteractionRecord],
        known: Option<&BTreeSet<AccountId>>,
    ) -> Result<Graph, DetectError> {
        let cfg = &ctx.config.graph;
        let mut stats = GraphStats { records_in: records.len(), ..Default::default() };
        let mut nodes: BTreeSet<AccountId> = BTreeSet::new();
        let mut folded: BTreeMap<(AccountId, AccountId, InteractionKind), EdgeData> = BTreeMap::new();

        for rec in records {
            if let Some(detail) = invalid_reason(rec) {
                ctx.diagnostics.record(Diagnostic::GraphConstruction {
                    origin: rec.source.clone(),
                    target: rec.target.clone(),
                    detail,
                });
                stats.rejected += 1;
                continue;
            }
            if let Some(unknown) = unknown_endpoint(rec, known) {
                ctx.diagnostics.record(Diagnostic::IngestionMismatch {
                    origin: rec.source.clone(),
                    target: rec.target.clone(),
                    unknown: unknown.clone(),
                });
                stats.dropped_unknown += 1;
                continue;
            }

            nodes.insert(rec.source.clone());
            nodes.insert(rec.target.clone());
            if rec.source == rec.target && !cfg.keep_self_loops {
                stats.self_loops_dropped += 1;
                continue;
            }

            let weight = rec.weight.unwrap_or(1.0) * cfg.kind_weight(rec.kind);
            folded
                .entry((rec.source.clone(), rec.target.clone(), rec.kind))
                .and_modify(|e| {
                    e.weight += weight;
                    e.count += 1;
                    e.first_seen = e.first_seen.min(rec.timestamp);
                    e.last_seen = e.last_seen.max(rec.timestamp);
                })
                .or_insert(EdgeData {
                    kind: rec.kind,
                    weight,
                    count: 1,
                    first_seen: rec.timestamp,
                    last_seen: rec.timestamp,
                });
        }

        let mut inner: DiGraph<AccountId, EdgeData> =
            DiGraph::with_capacity(nodes.len(), folded.len());
        let mut index: BTreeMap<AccountId, NodeIndex> = BTreeMap::new();
        for id in &nodes {
            index.insert(id.clone(), inner.add_node(id.clone()));
        }

        let n = nodes.len();
        let mut undirected: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
        let mut directed: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
        // kept self loops: degree and PageRank only, never communities or paths
        let mut self_loops = vec![0.0f64; n];
        for ((src, tgt, _), data) in folded {
            let (s, t) = (index[&src], index[&tgt]);
            if data.weight > 0.0 {
                *directed[s.index()].entry(t.index()).or_default() += data.weight;
                if s == t {
                    self_loops[s.index()] += data.weight;
                } else {
                    *undirected[s.index()].entry(t.index()).or_default() += data.weight;
                    *undirected[t.index()].entry(s.index()).or_default() += data.weight;
                }
            }
            inner.add_edge(s, t, data);
        }
        let adjacency: Vec<Vec<(usize, f64)>> =
            undirected.into_iter().map(|m| m.into_iter().collect()).collect();
        let out_weights: Vec<Vec<(usize, f64)>> =
            directed.into_iter().map(|m| m.into_iter().collect()).collect();

        let structural: BTreeSet<CentralityMetric> = cfg.centrality.iter().copied().collect();
        let mut metrics = structural.clone();
        metrics.insert(cfg.primary_centrality);
        let mut raw_centrality = BTreeMap::new();
        let mut norm_centrality = BTreeMap::new();
        for metric in metrics {
            ctx.cancel.check("centrality")?;
            let raw = centrality::compute(metric, &adjacency, &out_weights, &self_loops, cfg);
            norm_centrality.insert(metric, centrality::normalize_by_max(&raw));
            raw_centrality.insert(metric, raw);
            debug!(%metric, "centrality computed");
        }

        let mut rng = ctx.rng(COMMUNITY_STREAM);
        let community = community::detect(&adjacency, &mut rng, &ctx.cancel)?;
        let n_communities = community.iter().map(|c| *c as usize + 1).max().unwrap_or(0);
        let mut community_sizes = vec![0usize; n_communities];
        for c in &community {
            community_sizes[*c as usize] += 1;
        }

        stats.nodes = n;
        stats.edges = inner.edge_count();
        stats.communities = n_communities;
        stats.components = community::components(&adjacency).len();

        let graph = Graph {
            inner,
            index,
            adjacency,
            raw_centrality,
            norm_centrality,
            structural,
            community,
            community_sizes,
            stats,
        };

        info!(
            run_id = %ctx.run_id,
            nodes = graph.stats.nodes,
            edges = graph.stats.edges,
            communities = graph.stats.communities,
            rejected = graph.stats.rejected,
            dropped_unknown = graph.stats.dropped_unknown,
            modularity = graph.modularity(),
            "interaction graph built"
        );
        Ok(graph)
    }
}

/// True when the builder would keep `rec` (self loops aside). Other consumers
/// of raw interactions use this so they see the same records the graph does.
pub(crate) fn admissible(rec: &InteractionRecord, known: Option<&BTreeSet<AccountId>>) -> bool {
    invalid_reason(rec).is_none() && unknown_endpoint(rec, known).is_none()
}

fn unknown_endpoint<'a>(rec: &'a InteractionRecord, known: Option<&BTreeSet<AccountId>>) -> Option<&'a AccountId> {
    let known = known?;
    [&rec.source, &rec.target].into_iter().find(|id| !known.contains(*id))
}

pub(crate) fn invalid_reason(rec: &InteractionRecord) -> Option<String> {
    if rec.source.is_empty() || rec.target.is_empty() {
        return Some("empty account id".into());
    }
    match rec.weight {
        Some(w) if !w.is_finite() => Some(format!("non-finite weight {w}")),
        Some(w) if w < 0.0 => Some(format!("negative weight {w}")),
        _ => None,
    }
}
