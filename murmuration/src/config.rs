// murmuration/src/config.rs
//
// Run configuration. Every section has defaults so an empty JSON object (or no
// file at all) is a valid config; `validate()` is called once before a run.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DetectError;
use crate::events::InteractionKind;
use crate::graph::CentralityMetric;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectConfig {
    pub graph: GraphConfig,
    pub burst: BurstConfig,
    pub scorer: ScorerConfig,
    pub aggregator: AggregatorConfig,
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphConfig {
    pub keep_self_loops: bool,
    pub centrality: Vec<CentralityMetric>,
    /// Centrality used to weight members in cluster aggregation.
    pub primary_centrality: CentralityMetric,
    pub pagerank_damping: f64,
    pub pagerank_max_iter: usize,
    pub pagerank_tolerance: f64,
    pub kind_weights: BTreeMap<InteractionKind, f64>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            keep_self_loops: false,
            centrality: vec![CentralityMetric::Degree, CentralityMetric::PageRank],
            primary_centrality: CentralityMetric::PageRank,
            pagerank_damping: 0.85,
            pagerank_max_iter: 100,
            pagerank_tolerance: 1e-9,
            kind_weights: InteractionKind::ALL.iter().map(|k| (*k, 1.0)).collect(),
        }
    }
}

impl GraphConfig {
    pub fn kind_weight(&self, kind: InteractionKind) -> f64 {
        self.kind_weights.get(&kind).copied().unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BurstConfig {
    pub window_secs: i64,
    pub step_secs: i64,
    /// Burst when count > mean + k * std of the trailing baseline.
    pub k: f64,
    pub min_events: usize,
    pub min_baseline_windows: usize,
    pub max_baseline_windows: usize,
    /// Fraction of the shorter burst span two accounts must share to be synchronized.
    pub overlap_fraction: f64,
    /// Largest window grid a run may allocate; longer spans leave every account undefined.
    pub max_windows: usize,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            window_secs: 24 * 60 * 60,
            step_secs: 24 * 60 * 60,
            k: 3.0,
            min_events: 5,
            min_baseline_windows: 3,
            max_baseline_windows: 30,
            overlap_fraction: 0.5,
            max_windows: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScorerConfig {
    pub classifier_weight: f64,
    pub structural_weight: f64,
    pub burst_weight: f64,
    /// Accounts scored per blocking task.
    pub chunk_size: usize,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            classifier_weight: 0.50,
            structural_weight: 0.25,
            burst_weight: 0.25,
            chunk_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    pub min_cluster_size: usize,
    pub score_floor: f64,
    /// Merge two candidate clusters when correlation + burst boost reaches this.
    pub merge_threshold: f64,
    /// Added to the merge affinity, scaled by the share of member pairs in one burst group.
    pub burst_merge_boost: f64,
    pub top_k: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 3,
            score_floor: 0.5,
            merge_threshold: 0.8,
            burst_merge_boost: 0.2,
            top_k: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CalibrationObjective {
    MaxF1,
    MaxRecallAtPrecision { min_precision: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalibrationConfig {
    pub metric: String,
    pub dataset_id: String,
    pub objective: CalibrationObjective,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            metric: "campaign_score".into(),
            dataset_id: "default".into(),
            objective: CalibrationObjective::MaxF1,
        }
    }
}

impl DetectConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                serde_json::from_str::<DetectConfig>(&raw)
                    .with_context(|| format!("parsing config {}", p.display()))?
            }
            None => DetectConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DetectError> {
        let invalid = |msg: String| -> Result<(), DetectError> { Err(DetectError::InvalidConfig(msg)) };

        let g = &self.graph;
        if g.centrality.is_empty() {
            return invalid("graph.centrality must name at least one metric".into());
        }
        if !(0.0..1.0).contains(&g.pagerank_damping) {
            return invalid(format!("graph.pagerank_damping {} not in [0, 1)", g.pagerank_damping));
        }
        if g.pagerank_max_iter == 0 {
            return invalid("graph.pagerank_max_iter must be > 0".into());
        }
        if let Some((kind, w)) = g.kind_weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return invalid(format!("graph.kind_weights[{kind}] = {w} must be finite and >= 0"));
        }

        let b = &self.burst;
        if b.window_secs <= 0 || b.step_secs <= 0 {
            return invalid("burst.window_secs and burst.step_secs must be > 0".into());
        }
        if !b.k.is_finite() || b.k < 0.0 {
            return invalid(format!("burst.k {} must be finite and >= 0", b.k));
        }
        if b.min_baseline_windows == 0 || b.max_baseline_windows < b.min_baseline_windows {
            return invalid("burst baseline windows: need 0 < min <= max".into());
        }
        if !(0.0..=1.0).contains(&b.overlap_fraction) {
            return invalid(format!("burst.overlap_fraction {} not in [0, 1]", b.overlap_fraction));
        }
        if b.max_windows == 0 {
            return invalid("burst.max_windows must be > 0".into());
        }

        let s = &self.scorer;
        let weights = [s.classifier_weight, s.structural_weight, s.burst_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return invalid("scorer weights must be finite and >= 0".into());
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return invalid(format!("scorer weights sum to {sum:.6}, expected 1.0"));
        }
        if s.chunk_size == 0 {
            return invalid("scorer.chunk_size must be > 0".into());
        }

        let a = &self.aggregator;
        if a.min_cluster_size == 0 {
            return invalid("aggregator.min_cluster_size must be >= 1".into());
        }
        if !(0.0..=1.0).contains(&a.score_floor) {
            return invalid(format!("aggregator.score_floor {} not in [0, 1]", a.score_floor));
        }
        if !a.merge_threshold.is_finite() || !a.burst_merge_boost.is_finite() || a.burst_merge_boost < 0.0 {
            return invalid("aggregator merge_threshold / burst_merge_boost must be finite, boost >= 0".into());
        }

        if let CalibrationObjective::MaxRecallAtPrecision { min_precision } = self.calibration.objective {
            if !(0.0..=1.0).contains(&min_precision) {
                return invalid(format!("calibration min_precision {min_precision} not in [0, 1]"));
            }
        }
        Ok(())
    }

    /// Stable digest of the effective configuration, part of the run id.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut h = Sha256::new();
        h.update(canonical.as_bytes());
        hex::encode(&h.finalize()[..8])
    }
}
