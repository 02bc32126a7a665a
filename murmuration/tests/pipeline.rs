// murmuration/tests/pipeline.rs
//
// Run-level guarantees: reproducibility, degraded mode, undefined scores,
// cancellation, cluster invariants.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use murmuration::error::{DiagnosticKind, ModelError};
use murmuration::events::{
    Account, FeatureSignal, FeatureVector, InteractionKind, InteractionRecord, LabeledRecord, Post, Provenance,
    ScoreValue, Signal, UndefinedReason,
};
use murmuration::scoring::{AnomalyScorer, Classifier, ProbabilityCache};
use murmuration::{pipeline, CancelToken, DetectConfig, DetectError, RunContext, RunInput};

struct Lookup(BTreeMap<String, f64>);

impl Classifier for Lookup {
    fn version(&self) -> &str {
        "lookup-v1"
    }

    fn predict_proba(&self, fv: &FeatureVector) -> Result<f64, ModelError> {
        self.0
            .get(&fv.entity_id)
            .copied()
            .ok_or_else(|| ModelError::Unavailable(format!("no entry for {}", fv.entity_id)))
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap()
}

fn rec(s: &str, t: &str, kind: InteractionKind, hours: i64) -> InteractionRecord {
    InteractionRecord::new(s, t, kind, t0() + Duration::hours(hours))
}

fn features(id: &str, rate: f64) -> FeatureVector {
    FeatureVector::new(id, Provenance::versioned("content", "f2"))
        .with_value(FeatureSignal::PostRate, rate)
        .unwrap()
        .with_value(FeatureSignal::DuplicateContentRatio, rate / 10.0)
        .unwrap()
}

/// Two dense groups of accounts, one quiet pair, and `g` with no features.
fn snapshot() -> RunInput {
    let ids = ["a", "b", "c", "d", "e", "f", "g", "h", "i"];
    let mut interactions = Vec::new();
    for (h, (s, t)) in [("a", "b"), ("b", "c"), ("c", "a"), ("a", "c"), ("b", "a")].iter().enumerate() {
        interactions.push(rec(s, t, InteractionKind::Retweet, h as i64));
    }
    for (h, (s, t)) in [("d", "e"), ("e", "f"), ("f", "d")].iter().enumerate() {
        interactions.push(rec(s, t, InteractionKind::Reply, h as i64));
    }
    interactions.push(rec("h", "i", InteractionKind::Mention, 2));
    interactions.push(rec("c", "d", InteractionKind::Follow, 9).with_weight(0.1));

    let mut posts = Vec::new();
    for id in ["a", "b", "c"] {
        for n in 0..12 {
            let day = if n < 2 { 0 } else { 6 };
            posts.push(Post {
                id: format!("{id}-{n}"),
                account_id: id.into(),
                timestamp: t0() + Duration::days(day) + Duration::minutes(n),
                language: Some("en".into()),
            });
        }
    }

    RunInput {
        accounts: ids
            .iter()
            .map(|id| Account { id: id.to_string(), created_at: t0() - Duration::days(3), metadata: BTreeMap::new() })
            .collect(),
        posts,
        interactions,
        features: ids.iter().filter(|id| **id != "g").map(|id| features(id, 2.0)).collect(),
        labels: ["a", "b", "c", "d", "e", "f", "g", "h", "i"]
            .iter()
            .map(|id| LabeledRecord { entity_id: id.to_string(), label: matches!(*id, "a" | "b" | "c" | "g") })
            .collect(),
    }
}

fn classifier() -> Arc<Lookup> {
    let probs = [("a", 0.95), ("b", 0.9), ("c", 0.92), ("d", 0.3), ("e", 0.25), ("f", 0.2), ("h", 0.1), ("i", 0.15)];
    Arc::new(Lookup(probs.iter().map(|(id, p)| (id.to_string(), *p)).collect()))
}

fn config() -> DetectConfig {
    let mut cfg = DetectConfig::default();
    cfg.aggregator.min_cluster_size = 2;
    cfg.aggregator.score_floor = 0.4;
    cfg
}

fn scorer(cfg: &DetectConfig) -> AnomalyScorer {
    AnomalyScorer::new(cfg.scorer.clone()).with_classifier(classifier())
}

#[tokio::test]
async fn same_input_same_seed_same_output() {
    let cfg = config();
    let input = Arc::new(snapshot());
    let first = pipeline::run(RunContext::new(cfg.clone(), 42), Arc::clone(&input), scorer(&cfg), None)
        .await
        .unwrap();
    let second = pipeline::run(RunContext::new(cfg.clone(), 42), input, scorer(&cfg), None).await.unwrap();
    assert_eq!(first, second);
    assert!(!first.run_id.is_empty());
}

#[tokio::test]
async fn record_order_does_not_change_the_result() {
    let cfg = config();
    let input = snapshot();
    let mut shuffled = input.clone();
    shuffled.accounts.reverse();
    shuffled.posts.reverse();
    shuffled.interactions.reverse();
    shuffled.features.reverse();
    shuffled.labels.reverse();

    let a = pipeline::run(RunContext::new(cfg.clone(), 7), Arc::new(input), scorer(&cfg), None).await.unwrap();
    let b = pipeline::run(RunContext::new(cfg.clone(), 7), Arc::new(shuffled), scorer(&cfg), None).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn seed_is_part_of_the_run_id() {
    let cfg = config();
    let input = Arc::new(snapshot());
    let a = pipeline::run(RunContext::new(cfg.clone(), 1), Arc::clone(&input), scorer(&cfg), None).await.unwrap();
    let b = pipeline::run(RunContext::new(cfg.clone(), 2), input, scorer(&cfg), None).await.unwrap();
    assert_ne!(a.run_id, b.run_id);
}

#[tokio::test]
async fn missing_classifier_degrades_every_score() {
    let cfg = config();
    let scorer = AnomalyScorer::new(cfg.scorer.clone());
    let out = pipeline::run(RunContext::new(cfg, 3), Arc::new(snapshot()), scorer, None).await.unwrap();

    assert_eq!(out.model_version, "rule-based");
    let defined: Vec<_> = out.scores.iter().filter(|s| s.value().is_some()).collect();
    assert_eq!(defined.len(), 8);
    assert!(defined.iter().all(|s| s.degraded));
    assert!(defined.iter().all(|s| s.value().is_some_and(|v| (0.0..=1.0).contains(&v))));
    assert_eq!(out.diagnostics.count(DiagnosticKind::ModelUnavailable), 1);
}

#[tokio::test]
async fn account_without_features_is_undefined_and_never_flagged() {
    let cfg = config();
    let out = pipeline::run(RunContext::new(cfg.clone(), 3), Arc::new(snapshot()), scorer(&cfg), None)
        .await
        .unwrap();

    let g = out.scores.iter().find(|s| s.entity_id == "g").unwrap();
    assert_eq!(g.score, ScoreValue::Undefined { reason: UndefinedReason::MissingFeatures });
    assert!(!out.flagged.contains(&"g".to_string()));
    assert!(out.clusters.iter().all(|c| !c.accounts.contains("g")));
    assert!(out.diagnostics.count(DiagnosticKind::InsufficientData) >= 1);

    // g's label had no defined score to pair with
    let calibration = out.calibration.as_ref().unwrap();
    assert_eq!(calibration.skipped, 1);
    assert_eq!(calibration.n_positive + calibration.n_negative, 8);
}

#[tokio::test]
async fn labels_recalibrate_and_flag() {
    let cfg = config();
    let out = pipeline::run(RunContext::new(cfg.clone(), 3), Arc::new(snapshot()), scorer(&cfg), None)
        .await
        .unwrap();

    assert!(out.recalibrated);
    let t = out.threshold.as_ref().unwrap();
    assert_eq!(t.model_version, "lookup-v1");
    assert_eq!(t.metric, cfg.calibration.metric);
    assert_eq!(t.n_samples, 8);
    for s in &out.scores {
        let above = s.value().is_some_and(|v| v >= t.cutoff);
        assert_eq!(above, out.flagged.contains(&s.entity_id), "{}", s.entity_id);
    }
}

#[tokio::test]
async fn no_labels_carries_previous_threshold() {
    let cfg = config();
    let mut input = snapshot();
    input.labels.clear();
    let previous = murmuration::events::Threshold {
        metric: cfg.calibration.metric.clone(),
        cutoff: 0.5,
        dataset_id: "earlier".into(),
        model_version: "lookup-v1".into(),
        n_samples: 40,
        precision: 0.8,
        recall: 0.7,
        f1: 0.75,
    };
    let out = pipeline::run(RunContext::new(cfg.clone(), 3), Arc::new(input), scorer(&cfg), Some(previous.clone()))
        .await
        .unwrap();

    assert!(!out.recalibrated);
    assert!(out.calibration.is_none());
    assert_eq!(out.threshold, Some(previous));
    assert_eq!(out.diagnostics.count(DiagnosticKind::CalibrationFailure), 0);
}

#[tokio::test]
async fn clusters_respect_size_floor_and_defined_scores() {
    let cfg = config();
    let out = pipeline::run(RunContext::new(cfg.clone(), 5), Arc::new(snapshot()), scorer(&cfg), None)
        .await
        .unwrap();
    let score_of: BTreeMap<&str, Option<f64>> =
        out.scores.iter().map(|s| (s.entity_id.as_str(), s.value())).collect();

    assert!(!out.clusters.is_empty());
    for (i, c) in out.clusters.iter().enumerate() {
        assert_eq!(c.cluster_id, i as u32);
        assert!(c.size() >= cfg.aggregator.min_cluster_size);
        assert!(c.mean_member_score >= cfg.aggregator.score_floor);
        assert!((0.0..=1.0).contains(&c.aggregate_score));
        for id in &c.accounts {
            assert!(score_of[id.as_str()].is_some(), "{id} has no defined score");
        }
    }
    for pair in out.clusters.windows(2) {
        assert!(pair[0].aggregate_score >= pair[1].aggregate_score);
    }
}

#[tokio::test]
async fn discarded_interactions_are_not_burst_activity() {
    let cfg = config();
    let clean = snapshot();
    let mut noisy = clean.clone();
    // a day-6 spike from h made only of records the graph discards
    for m in 0..15 {
        let at = t0() + Duration::days(6) + Duration::minutes(m);
        noisy.interactions.push(InteractionRecord::new("h", "i", InteractionKind::Reply, at).with_weight(-1.0));
        noisy.interactions.push(InteractionRecord::new("h", "ghost", InteractionKind::Reply, at));
    }

    let base = pipeline::run(RunContext::new(cfg.clone(), 3), Arc::new(clean), scorer(&cfg), None).await.unwrap();
    let out = pipeline::run(RunContext::new(cfg.clone(), 3), Arc::new(noisy), scorer(&cfg), None).await.unwrap();

    assert_eq!(out.graph.rejected, 15);
    assert_eq!(out.graph.dropped_unknown, 15);
    let h = |o: &murmuration::RunOutput| o.scores.iter().find(|s| s.entity_id == "h").cloned().unwrap();
    assert_eq!(h(&out), h(&base));
    assert!(h(&out).contributions.iter().all(|c| c.signal != Signal::BurstIntensity || c.value == 0.0));
}

#[tokio::test]
async fn cancelled_run_stops_with_cancelled() {
    let cfg = config();
    let cancel = CancelToken::new();
    cancel.cancel();
    let ctx = RunContext::new(cfg.clone(), 0).with_cancel(cancel);
    let res = pipeline::run(ctx, Arc::new(snapshot()), scorer(&cfg), None).await;
    assert!(matches!(res, Err(DetectError::Cancelled(_))));
}

#[tokio::test]
async fn cache_is_reused_across_runs() {
    let cfg = config();
    let cache = Arc::new(ProbabilityCache::new());
    let scorer = scorer(&cfg).with_cache(Arc::clone(&cache));
    let input = Arc::new(snapshot());

    pipeline::run(RunContext::new(cfg.clone(), 0), Arc::clone(&input), scorer.clone(), None).await.unwrap();
    let misses = cache.misses();
    assert_eq!(misses, 8);
    pipeline::run(RunContext::new(cfg.clone(), 0), input, scorer, None).await.unwrap();
    assert_eq!(cache.misses(), misses);
    assert_eq!(cache.hits(), 8);
}
