// murmuration/src/scoring/fusion.rs
//
// Weighted signal fusion.
//
// Three components, weights from ScorerConfig (sum = 1.00):
//   classifier  0.50  model probability for the account's feature vector
//   structural  0.25  mean of normalized centralities (degree, PageRank, ...)
//   burst       0.25  mean of burst intensity and burst synchrony
//
// A component that cannot be evaluated is dropped and the remaining weights
// are renormalized:
//   - no classifier, classifier error, or
//     output outside [0, 1] (NaN included) → degraded rule-based score
//   - burst score undefined (sparse)       → structural + classifier only
// Within a component each signal gets an equal share of the component weight,
// so every contribution is weight * value and the score is their sum. All
// values are clamped to [0, 1], which keeps the score in [0, 1] and monotone
// in every signal.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::warn;

use crate::burst::BurstContext;
use crate::config::ScorerConfig;
use crate::context::RunContext;
use crate::error::Diagnostic;
use crate::events::{
    AnomalyScore, FeatureVector, ScoreValue, Signal, SignalContribution, UndefinedReason,
};
use crate::graph::{CentralityMetric, StructuralContext};

use super::cache::ProbabilityCache;
use super::model::{checked_probability, Classifier};

pub fn centrality_signal(metric: CentralityMetric) -> Signal {
    match metric {
        CentralityMetric::Degree => Signal::Degree,
        CentralityMetric::PageRank => Signal::PageRank,
        CentralityMetric::Betweenness => Signal::Betweenness,
    }
}

#[derive(Clone)]
pub struct AnomalyScorer {
    weights: ScorerConfig,
    classifier: Option<Arc<dyn Classifier>>,
    cache: Option<Arc<ProbabilityCache>>,
}

struct Component {
    weight: f64,
    signals: Vec<(Signal, f64)>,
}

impl AnomalyScorer {
    pub fn new(weights: ScorerConfig) -> Self {
        Self { weights, classifier: None, cache: None }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_cache(mut self, cache: Arc<ProbabilityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn model_version(&self) -> Option<&str> {
        self.classifier.as_deref().map(|c| c.version())
    }

    /// Run-level notice for degraded mode. Call once per run, before scoring.
    pub fn announce(&self, ctx: &RunContext) {
        if self.classifier.is_none() {
            warn!(run_id = %ctx.run_id, "no classifier supplied, scoring in degraded rule-based mode");
            ctx.diagnostics.record(Diagnostic::ModelUnavailable {
                entity_id: "*".into(),
                detail: "no classifier supplied for this run".into(),
            });
        }
    }

    /// Fuse one account's signals. Never fails: missing inputs either drop a
    /// component or make the score explicitly undefined.
    pub fn score(
        &self,
        ctx: &RunContext,
        entity_id: &str,
        features: Option<&FeatureVector>,
        graph: Option<&StructuralContext>,
        burst: Option<&BurstContext>,
    ) -> AnomalyScore {
        let Some(features) = features else {
            ctx.diagnostics.record(Diagnostic::InsufficientData {
                entity_id: entity_id.to_string(),
                detail: "no feature vector".into(),
            });
            return AnomalyScore::undefined(entity_id, UndefinedReason::MissingFeatures);
        };

        let mut components = Vec::with_capacity(3);

        let probability = self.classify(ctx, entity_id, features);
        if let Some(p) = probability {
            components.push(Component {
                weight: self.weights.classifier_weight,
                signals: vec![(Signal::Classifier, p)],
            });
        }

        components.push(Component {
            weight: self.weights.structural_weight,
            signals: structural_signals(ctx, graph),
        });

        if let Some(b) = burst {
            components.push(Component {
                weight: self.weights.burst_weight,
                signals: vec![(Signal::BurstIntensity, b.intensity), (Signal::BurstSynchrony, b.synchrony)],
            });
        }

        let (value, contributions) = fuse(&components);
        AnomalyScore {
            entity_id: entity_id.to_string(),
            score: ScoreValue::Defined { value },
            contributions,
            degraded: probability.is_none(),
        }
    }

    fn classify(&self, ctx: &RunContext, entity_id: &str, fv: &FeatureVector) -> Option<f64> {
        let model = self.classifier.as_deref()?;
        let result = match &self.cache {
            Some(cache) => cache.predict(model, fv),
            None => model.predict_proba(fv).and_then(checked_probability),
        };
        match result {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(run_id = %ctx.run_id, account = %entity_id, error = %e, "classifier failed, degraded score");
                ctx.diagnostics.record(Diagnostic::ModelUnavailable {
                    entity_id: entity_id.to_string(),
                    detail: e.to_string(),
                });
                None
            }
        }
    }
}

fn structural_signals(ctx: &RunContext, graph: Option<&StructuralContext>) -> Vec<(Signal, f64)> {
    match graph {
        Some(g) => g.centrality.iter().map(|(m, v)| (centrality_signal(*m), *v)).collect(),
        None => {
            // not in the graph: isolated, every configured centrality is zero
            let mut metrics: Vec<CentralityMetric> = ctx.config.graph.centrality.clone();
            metrics.sort();
            metrics.dedup();
            metrics.into_iter().map(|m| (centrality_signal(m), 0.0)).collect()
        }
    }
}

fn fuse(components: &[Component]) -> (f64, Vec<SignalContribution>) {
    let active: Vec<&Component> = components.iter().filter(|c| !c.signals.is_empty()).collect();
    let total: f64 = active.iter().map(|c| c.weight).sum();
    let mut contributions = Vec::new();

    for c in &active {
        let share = if total > 0.0 { c.weight / total } else { 1.0 / active.len() as f64 };
        let per_signal = share / c.signals.len() as f64;
        for (signal, value) in &c.signals {
            let value = value.clamp(0.0, 1.0);
            contributions.push(SignalContribution { signal: *signal, value, contribution: per_signal * value });
        }
    }

    contributions.sort_by(|a, b| {
        b.contribution
            .total_cmp(&a.contribution)
            .then_with(|| a.signal.cmp(&b.signal))
    });
    let value: f64 = contributions.iter().map(|c| c.contribution).sum();
    (value.clamp(0.0, 1.0), contributions)
}

/// Descending by value, undefined last, then by entity id.
pub fn rank_order(a: &AnomalyScore, b: &AnomalyScore) -> Ordering {
    match (a.value(), b.value()) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.entity_id.cmp(&b.entity_id))
}
