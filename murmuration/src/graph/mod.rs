// murmuration/src/graph/mod.rs
//
// Interaction graph: accounts as nodes, deduplicated interactions as edges.
//
// Built once per run by `InteractionGraph::build` and read-only afterwards.
// Derived attributes (centralities, community ids) are computed during the
// build, so scoring and aggregation only ever query.
//
// Node indices follow sorted account id order, which makes every derived
// attribute independent of the order edges arrived in.

pub mod build;
pub mod centrality;
pub mod community;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::events::{AccountId, InteractionKind};

pub use build::InteractionGraph;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CentralityMetric {
    Degree,
    #[serde(rename = "pagerank")]
    PageRank,
    Betweenness,
}

impl fmt::Display for CentralityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Degree => write!(f, "degree"),
            Self::PageRank => write!(f, "pagerank"),
            Self::Betweenness => write!(f, "betweenness"),
        }
    }
}

impl FromStr for CentralityMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "degree" => Ok(Self::Degree),
            "pagerank" | "page_rank" => Ok(Self::PageRank),
            "betweenness" => Ok(Self::Betweenness),
            other => Err(format!("unknown centrality metric '{other}'")),
        }
    }
}

/// Aggregate of every interaction sharing (source, target, kind).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeData {
    pub kind: InteractionKind,
    pub weight: f64,
    pub count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphStats {
    pub records_in: usize,
    pub edges: usize,
    pub nodes: usize,
    pub rejected: usize,        // malformed records
    pub dropped_unknown: usize, // references to accounts outside the run
    pub self_loops_dropped: usize,
    pub communities: usize,
    pub components: usize,
}

/// Structural view of one node handed to the scorer. Carries only the
/// configured centralities, never the aggregation-only primary metric.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralContext {
    pub community: u32,
    pub community_size: usize,
    /// Normalized to [0, 1] by the graph-wide maximum.
    pub centrality: BTreeMap<CentralityMetric, f64>,
}

#[derive(Debug, Clone)]
pub struct Graph {
    inner: DiGraph<AccountId, EdgeData>,
    index: BTreeMap<AccountId, NodeIndex>,
    /// Undirected, positive-weight, no self loops; sorted by neighbor index.
    adjacency: Vec<Vec<(usize, f64)>>,
    raw_centrality: BTreeMap<CentralityMetric, Vec<f64>>,
    norm_centrality: BTreeMap<CentralityMetric, Vec<f64>>,
    /// Configured metrics; the primary one may be computed without being listed here.
    structural: BTreeSet<CentralityMetric>,
    community: Vec<u32>,
    community_sizes: Vec<usize>,
    stats: GraphStats,
}

impl Graph {
    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn stats(&self) -> &GraphStats {
        &self.stats
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Account ids in sorted order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> + '_ {
        self.index.keys().map(|k| k.as_str())
    }

    fn pos(&self, id: &str) -> Option<usize> {
        self.index.get(id).map(|ix| ix.index())
    }

    fn id_at(&self, pos: usize) -> &str {
        self.inner[NodeIndex::new(pos)].as_str()
    }

    /// Directed edges leaving `id`, sorted by (target, kind).
    pub fn out_edges(&self, id: &str) -> Vec<(&str, &EdgeData)> {
        let Some(ix) = self.index.get(id) else { return Vec::new() };
        let mut out: Vec<(&str, &EdgeData)> = self
            .inner
            .edges(*ix)
            .map(|e| (self.inner[e.target()].as_str(), e.weight()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0).then(a.1.kind.cmp(&b.1.kind)));
        out
    }

    /// Undirected neighbors with summed positive weight.
    pub fn neighbors(&self, id: &str) -> Vec<(&str, f64)> {
        self.pos(id)
            .map(|p| self.adjacency[p].iter().map(|(n, w)| (self.id_at(*n), *w)).collect())
            .unwrap_or_default()
    }

    pub fn adjacent(&self, a: &str, b: &str) -> bool {
        match (self.pos(a), self.pos(b)) {
            (Some(pa), Some(pb)) => self.adjacency[pa].binary_search_by_key(&pb, |(n, _)| *n).is_ok(),
            _ => false,
        }
    }

    pub fn centrality(&self, metric: CentralityMetric, id: &str) -> Option<f64> {
        let p = self.pos(id)?;
        self.raw_centrality.get(&metric).map(|v| v[p])
    }

    pub fn normalized_centrality(&self, metric: CentralityMetric, id: &str) -> Option<f64> {
        let p = self.pos(id)?;
        self.norm_centrality.get(&metric).map(|v| v[p])
    }

    pub fn metrics(&self) -> impl Iterator<Item = CentralityMetric> + '_ {
        self.norm_centrality.keys().copied()
    }

    pub fn community_of(&self, id: &str) -> Option<u32> {
        self.pos(id).map(|p| self.community[p])
    }

    /// Community id → member ids, both in ascending order.
    pub fn communities(&self) -> BTreeMap<u32, BTreeSet<AccountId>> {
        let mut out: BTreeMap<u32, BTreeSet<AccountId>> = BTreeMap::new();
        for (id, ix) in &self.index {
            out.entry(self.community[ix.index()]).or_default().insert(id.clone());
        }
        out
    }

    pub fn structural_context(&self, id: &str) -> Option<StructuralContext> {
        let p = self.pos(id)?;
        let community = self.community[p];
        Some(StructuralContext {
            community,
            community_size: self.community_sizes[community as usize],
            centrality: self
                .norm_centrality
                .iter()
                .filter(|(m, _)| self.structural.contains(*m))
                .map(|(m, v)| (*m, v[p]))
                .collect(),
        })
    }

    /// Modularity of the stored partition, each component normalized on its own.
    pub fn modularity(&self) -> f64 {
        community::partition_modularity(&self.adjacency, &self.community)
    }
}
