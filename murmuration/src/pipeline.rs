// murmuration/src/pipeline.rs
//
// One batch detection run over a fixed input snapshot.
//
//   ┌ graph build ─┐              (spawn_blocking, concurrent)
//   └ bursts ──────┘
//          │ join
//   score chunks 0..n             (spawn_blocking per chunk)
//          │ barrier: every chunk awaited
//   campaign aggregation → calibration → flagging
//
// No I/O happens here. Model, previous threshold and labels are supplied by
// the caller; persisting the new threshold is the caller's decision too.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::burst::{BurstReport, TemporalBurstDetector};
use crate::calibrate::{flag, CalibrationOutcome, CalibrationReport, ThresholdCalibrator};
use crate::campaign::CampaignAggregator;
use crate::context::RunContext;
use crate::error::{DetectError, DiagnosticReport};
use crate::events::{
    Account, AccountId, AnomalyScore, CampaignCluster, FeatureVector, InteractionRecord, LabeledRecord, Post,
    Threshold,
};
use crate::graph::build::admissible;
use crate::graph::{Graph, GraphStats, InteractionGraph};
use crate::scoring::AnomalyScorer;

const RULE_BASED_VERSION: &str = "rule-based";

/// Everything a run consumes, fetched before the run starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunInput {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub posts: Vec<Post>,
    #[serde(default)]
    pub interactions: Vec<InteractionRecord>,
    #[serde(default)]
    pub features: Vec<FeatureVector>,
    #[serde(default)]
    pub labels: Vec<LabeledRecord>,
}

impl RunInput {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.posts.is_empty() && self.interactions.is_empty() && self.features.is_empty()
    }

    /// Order-insensitive digest: each section's items are hashed in sorted
    /// serialized form.
    pub fn digest(&self) -> String {
        fn section<T: Serialize>(h: &mut Sha256, name: &str, items: &[T]) {
            let mut encoded: Vec<String> =
                items.iter().map(|i| serde_json::to_string(i).unwrap_or_default()).collect();
            encoded.sort();
            h.update(name.as_bytes());
            h.update((encoded.len() as u64).to_le_bytes());
            for e in encoded {
                h.update((e.len() as u64).to_le_bytes());
                h.update(e.as_bytes());
            }
        }
        let mut h = Sha256::new();
        section(&mut h, "accounts", &self.accounts);
        section(&mut h, "posts", &self.posts);
        section(&mut h, "interactions", &self.interactions);
        section(&mut h, "features", &self.features);
        section(&mut h, "labels", &self.labels);
        hex::encode(h.finalize())
    }

    fn known_accounts(&self) -> BTreeSet<AccountId> {
        self.accounts.iter().map(|a| a.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunOutput {
    pub run_id: String,
    pub seed: u64,
    pub config_fingerprint: String,
    pub model_version: String,
    pub graph: GraphStats,
    /// Sorted by account id.
    pub scores: Vec<AnomalyScore>,
    pub clusters: Vec<CampaignCluster>,
    /// Threshold in force after this run: freshly calibrated or carried over.
    pub threshold: Option<Threshold>,
    /// True when `threshold` was produced by this run and should be persisted.
    pub recalibrated: bool,
    pub calibration: Option<CalibrationReport>,
    pub flagged: Vec<AccountId>,
    pub diagnostics: DiagnosticReport,
}

pub async fn run(
    mut ctx: RunContext,
    input: Arc<RunInput>,
    scorer: AnomalyScorer,
    previous: Option<Threshold>,
) -> Result<RunOutput, DetectError> {
    ctx.config.validate()?;
    if input.is_empty() {
        return Err(DetectError::EmptyInput(
            "no accounts, posts, interactions or feature vectors".into(),
        ));
    }
    ctx.bind_input(&input.digest());
    info!(
        run_id = %ctx.run_id,
        seed = ctx.seed,
        accounts = input.accounts.len(),
        interactions = input.interactions.len(),
        features = input.features.len(),
        labels = input.labels.len(),
        "detection run started"
    );

    // ── graph + bursts, concurrently ──
    let known = input.known_accounts();
    let events = Arc::new(activity_by_account(&input, &known));

    let graph_task = {
        let (ctx, input, known) = (ctx.clone(), Arc::clone(&input), known.clone());
        tokio::task::spawn_blocking(move || {
            if known.is_empty() {
                InteractionGraph::from_records(&ctx, &input.interactions)
            } else {
                InteractionGraph::build(&ctx, &input.interactions, &known)
            }
        })
    };
    let burst_task = {
        let (ctx, events) = (ctx.clone(), Arc::clone(&events));
        tokio::task::spawn_blocking(move || TemporalBurstDetector::detect(&ctx, &events))
    };
    let (graph, bursts) = tokio::join!(graph_task, burst_task);
    let graph = Arc::new(joined(graph)??);
    let bursts = Arc::new(joined(bursts)??);

    // ── per-account scoring ──
    let features: Arc<BTreeMap<AccountId, FeatureVector>> =
        Arc::new(input.features.iter().map(|f| (f.entity_id.clone(), f.clone())).collect());
    let universe = scoring_universe(&input, &known, &graph, &events);
    scorer.announce(&ctx);
    let scores = score_all(&ctx, &scorer, universe, &graph, &bursts, &features).await?;

    // ── barrier passed: global steps ──
    let clusters = {
        let (ctx, graph, bursts, scores) = (ctx.clone(), Arc::clone(&graph), Arc::clone(&bursts), Arc::clone(&scores));
        joined(
            tokio::task::spawn_blocking(move || CampaignAggregator::aggregate(&ctx, &graph, &bursts, &scores)).await,
        )??
    };

    let model_version = scorer.model_version().unwrap_or(RULE_BASED_VERSION).to_string();
    let (threshold, calibration, recalibrated) = if input.labels.is_empty() {
        debug!(run_id = %ctx.run_id, "no labels supplied, calibration skipped");
        (previous, None, false)
    } else {
        match ThresholdCalibrator::calibrate(&ctx, &input.labels, &scores, &model_version, previous.as_ref())? {
            CalibrationOutcome::Calibrated(report) => (Some(report.threshold.clone()), Some(report), true),
            CalibrationOutcome::Retained { previous, .. } => (previous, None, false),
        }
    };

    let flagged: Vec<AccountId> = threshold
        .as_ref()
        .map(|t| flag(&scores, t).into_iter().collect())
        .unwrap_or_default();

    let diagnostics = ctx.diagnostics.report();
    info!(
        run_id = %ctx.run_id,
        scored = scores.len(),
        undefined = scores.values().filter(|s| s.value().is_none()).count(),
        clusters = clusters.len(),
        flagged = flagged.len(),
        cutoff = ?threshold.as_ref().map(|t| t.cutoff),
        diagnostics = diagnostics.counts.values().sum::<u64>(),
        "detection run finished"
    );

    Ok(RunOutput {
        run_id: ctx.run_id.clone(),
        seed: ctx.seed,
        config_fingerprint: ctx.config.fingerprint(),
        model_version,
        graph: graph.stats().clone(),
        scores: scores.values().cloned().collect(),
        clusters,
        threshold,
        recalibrated,
        calibration,
        flagged,
        diagnostics,
    })
}

fn joined<T>(res: Result<T, tokio::task::JoinError>) -> Result<T, DetectError> {
    res.map_err(|e| DetectError::Worker(e.to_string()))
}

/// Activity timestamps per account: posts plus interactions the account
/// initiated. Interactions the graph builder would reject or drop never count.
fn activity_by_account(input: &RunInput, known: &BTreeSet<AccountId>) -> BTreeMap<AccountId, Vec<DateTime<Utc>>> {
    let mut out: BTreeMap<AccountId, Vec<DateTime<Utc>>> =
        known.iter().map(|id| (id.clone(), Vec::new())).collect();
    let admit = |id: &str| known.is_empty() || known.contains(id);
    let endpoints = (!known.is_empty()).then_some(known);

    let mut skipped = 0usize;
    for p in &input.posts {
        if admit(p.account_id.as_str()) {
            out.entry(p.account_id.clone()).or_default().push(p.timestamp);
        } else {
            skipped += 1;
        }
    }
    for r in &input.interactions {
        if admissible(r, endpoints) {
            out.entry(r.source.clone()).or_default().push(r.timestamp);
        }
    }
    if skipped > 0 {
        debug!(skipped, "posts by unknown accounts ignored");
    }
    for stamps in out.values_mut() {
        stamps.sort_unstable();
    }
    out
}

fn scoring_universe(
    input: &RunInput,
    known: &BTreeSet<AccountId>,
    graph: &Graph,
    events: &BTreeMap<AccountId, Vec<DateTime<Utc>>>,
) -> Vec<AccountId> {
    if !known.is_empty() {
        return known.iter().cloned().collect();
    }
    let mut ids: BTreeSet<AccountId> = graph.nodes().map(str::to_string).collect();
    ids.extend(input.features.iter().map(|f| f.entity_id.clone()));
    ids.extend(events.keys().cloned());
    ids.into_iter().collect()
}

async fn score_all(
    ctx: &RunContext,
    scorer: &AnomalyScorer,
    ids: Vec<AccountId>,
    graph: &Arc<Graph>,
    bursts: &Arc<BurstReport>,
    features: &Arc<BTreeMap<AccountId, FeatureVector>>,
) -> Result<Arc<BTreeMap<AccountId, AnomalyScore>>, DetectError> {
    let chunk_size = ctx.config.scorer.chunk_size.max(1);
    let mut handles = Vec::new();
    for chunk in ids.chunks(chunk_size) {
        let chunk = chunk.to_vec();
        let (ctx, scorer) = (ctx.clone(), scorer.clone());
        let (graph, bursts, features) = (Arc::clone(graph), Arc::clone(bursts), Arc::clone(features));
        handles.push(tokio::task::spawn_blocking(move || -> Result<Vec<AnomalyScore>, DetectError> {
            ctx.cancel.check("scoring")?;
            Ok(chunk
                .iter()
                .map(|id| {
                    let structural = graph.structural_context(id);
                    let burst = bursts.context(id);
                    scorer.score(&ctx, id, features.get(id), structural.as_ref(), burst.as_ref())
                })
                .collect())
        }));
    }

    let mut scores = BTreeMap::new();
    for h in handles {
        for s in joined(h.await)?? {
            scores.insert(s.entity_id.clone(), s);
        }
    }
    Ok(Arc::new(scores))
}
