// murmuration/src/calibrate/mod.rs
//
// Threshold calibration against labeled accounts.
//
// Every distinct score is tried as a cutoff (flag when score >= cutoff) and
// the objective picks one:
//   max_f1                       highest F1; ties → higher precision, then lower cutoff
//   max_recall_at_precision(p)   highest recall with precision >= p; ties → higher cutoff
//
// Degenerate validation sets never fail the run:
//   only positives  → cutoff 0.0 (flag everything)
//   only negatives  → cutoff 1.0
//   nothing usable  → CalibrationFailure, previous threshold retained

pub mod store;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CalibrationObjective;
use crate::context::RunContext;
use crate::error::{DetectError, Diagnostic};
use crate::events::{AccountId, AnomalyScore, LabeledRecord, Threshold};

pub use store::{InMemoryThresholdStore, JsonFileThresholdStore, ThresholdStore};

const TIE_EPS: f64 = 1e-12;

// ── Confusion counts ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfusionCounts {
    pub tp:  u64,
    pub fp:  u64,
    pub tn:  u64,
    pub fn_: u64,
}

impl ConfusionCounts {
    /// Counts for `(score, label)` pairs flagged at `cutoff`.
    pub fn at(pairs: &[(f64, bool)], cutoff: f64) -> Self {
        let mut c = Self::default();
        for &(score, label) in pairs {
            match (score >= cutoff, label) {
                (true,  true)  => c.tp  += 1,
                (true,  false) => c.fp  += 1,
                (false, true)  => c.fn_ += 1,
                (false, false) => c.tn  += 1,
            }
        }
        c
    }

    pub fn precision(&self) -> f64 {
        let denom = self.tp + self.fp;
        if denom == 0 { 0.0 } else { self.tp as f64 / denom as f64 }
    }

    pub fn recall(&self) -> f64 {
        let denom = self.tp + self.fn_;
        if denom == 0 { 0.0 } else { self.tp as f64 / denom as f64 }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }

    pub fn fpr(&self) -> f64 {
        let denom = self.fp + self.tn;
        if denom == 0 { 0.0 } else { self.fp as f64 / denom as f64 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SweepPoint {
    pub cutoff:    f64,
    pub counts:    ConfusionCounts,
    pub precision: f64,
    pub recall:    f64,
    pub f1:        f64,
}

impl SweepPoint {
    fn new(cutoff: f64, counts: ConfusionCounts) -> Self {
        Self {
            cutoff,
            counts,
            precision: counts.precision(),
            recall:    counts.recall(),
            f1:        counts.f1(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationReport {
    pub threshold:  Threshold,
    pub n_positive: usize,
    pub n_negative: usize,
    pub skipped:    usize,  // labels without a defined score
    pub sweep:      Vec<SweepPoint>,
    /// Exact ROC AUC; absent when only one class is present.
    pub auc_roc:    Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    Calibrated(CalibrationReport),
    Retained { previous: Option<Threshold>, reason: String },
}

impl CalibrationOutcome {
    /// Threshold in force after this calibration attempt.
    pub fn threshold(&self) -> Option<&Threshold> {
        match self {
            Self::Calibrated(r) => Some(&r.threshold),
            Self::Retained { previous, .. } => previous.as_ref(),
        }
    }
}

// ── Calibrator ────────────────────────────────────────────────────────────────

pub struct ThresholdCalibrator;

impl ThresholdCalibrator {
    pub fn calibrate(
        ctx: &RunContext,
        labels: &[LabeledRecord],
        scores: &BTreeMap<AccountId, AnomalyScore>,
        model_version: &str,
        previous: Option<&Threshold>,
    ) -> Result<CalibrationOutcome, DetectError> {
        let cfg = &ctx.config.calibration;
        let mut pairs: Vec<(f64, bool)> = Vec::with_capacity(labels.len());
        for l in labels {
            if let Some(v) = scores.get(&l.entity_id).and_then(AnomalyScore::value) {
                pairs.push((v, l.label));
            }
        }
        let skipped = labels.len() - pairs.len();
        let n_positive = pairs.iter().filter(|(_, l)| *l).count();
        let n_negative = pairs.len() - n_positive;

        if pairs.is_empty() {
            return Ok(Self::retain(ctx, previous, format!(
                "empty validation set ({} labels, none with a defined score)",
                labels.len()
            )));
        }

        let threshold = |cutoff: f64, point: &SweepPoint| Threshold {
            metric:        cfg.metric.clone(),
            cutoff,
            dataset_id:    cfg.dataset_id.clone(),
            model_version: model_version.to_string(),
            n_samples:     pairs.len(),
            precision:     point.precision,
            recall:        point.recall,
            f1:            point.f1,
        };

        if n_positive == 0 || n_negative == 0 {
            let cutoff = if n_negative == 0 { 0.0 } else { 1.0 };
            let point = SweepPoint::new(cutoff, ConfusionCounts::at(&pairs, cutoff));
            warn!(run_id = %ctx.run_id, n_positive, n_negative, cutoff, "single-label validation set, trivial cutoff");
            return Ok(CalibrationOutcome::Calibrated(CalibrationReport {
                threshold: threshold(cutoff, &point),
                n_positive,
                n_negative,
                skipped,
                sweep: vec![point],
                auc_roc: None,
            }));
        }

        let sweep = sweep(ctx, &pairs)?;
        let chosen = match cfg.objective {
            CalibrationObjective::MaxF1 => best_f1(&sweep),
            CalibrationObjective::MaxRecallAtPrecision { min_precision } => {
                best_recall_at(&sweep, min_precision)
            }
        };
        let Some(point) = chosen else {
            return Ok(Self::retain(ctx, previous, format!(
                "no cutoff reaches the required precision ({:?})",
                cfg.objective
            )));
        };

        let report = CalibrationReport {
            threshold: threshold(point.cutoff, &point),
            n_positive,
            n_negative,
            skipped,
            auc_roc: Some(auc_roc(&pairs)),
            sweep,
        };
        info!(
            run_id = %ctx.run_id,
            metric = %report.threshold.metric,
            cutoff = report.threshold.cutoff,
            precision = report.threshold.precision,
            recall = report.threshold.recall,
            f1 = report.threshold.f1,
            samples = report.threshold.n_samples,
            "threshold calibrated"
        );
        Ok(CalibrationOutcome::Calibrated(report))
    }

    fn retain(ctx: &RunContext, previous: Option<&Threshold>, reason: String) -> CalibrationOutcome {
        warn!(
            run_id = %ctx.run_id,
            reason = %reason,
            previous = ?previous.map(|t| t.cutoff),
            "calibration failed, keeping previous threshold"
        );
        ctx.diagnostics.record(Diagnostic::CalibrationFailure {
            metric: ctx.config.calibration.metric.clone(),
            detail: reason.clone(),
        });
        CalibrationOutcome::Retained { previous: previous.cloned(), reason }
    }
}

/// One point per distinct score, ascending by cutoff.
fn sweep(ctx: &RunContext, pairs: &[(f64, bool)]) -> Result<Vec<SweepPoint>, DetectError> {
    let mut sorted = pairs.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    let total_pos = sorted.iter().filter(|(_, l)| *l).count() as u64;
    let total_neg = sorted.len() as u64 - total_pos;

    let mut points = Vec::new();
    let (mut below_pos, mut below_neg) = (0u64, 0u64);
    let mut i = 0;
    while i < sorted.len() {
        ctx.cancel.check("calibration sweep")?;
        let cutoff = sorted[i].0;
        let counts = ConfusionCounts {
            tp:  total_pos - below_pos,
            fp:  total_neg - below_neg,
            tn:  below_neg,
            fn_: below_pos,
        };
        points.push(SweepPoint::new(cutoff, counts));
        while i < sorted.len() && sorted[i].0 == cutoff {
            if sorted[i].1 { below_pos += 1 } else { below_neg += 1 }
            i += 1;
        }
    }
    Ok(points)
}

fn best_f1(sweep: &[SweepPoint]) -> Option<SweepPoint> {
    let mut best: Option<SweepPoint> = None;
    for p in sweep {
        let better = match best {
            None => true,
            Some(b) => {
                p.f1 > b.f1 + TIE_EPS || ((p.f1 - b.f1).abs() <= TIE_EPS && p.precision > b.precision + TIE_EPS)
            }
        };
        if better {
            best = Some(*p);
        }
    }
    best
}

fn best_recall_at(sweep: &[SweepPoint], min_precision: f64) -> Option<SweepPoint> {
    let mut best: Option<SweepPoint> = None;
    for p in sweep.iter().filter(|p| p.precision + TIE_EPS >= min_precision) {
        // ascending cutoffs: `>=` lets a later (higher) cutoff win a recall tie
        if best.map_or(true, |b| p.recall + TIE_EPS >= b.recall) {
            best = Some(*p);
        }
    }
    best
}

/// Exact ROC AUC via the rank-sum statistic, tied scores counting one half.
pub fn auc_roc(pairs: &[(f64, bool)]) -> f64 {
    let mut sorted = pairs.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    let n_pos = sorted.iter().filter(|(_, l)| *l).count() as f64;
    let n_neg = sorted.len() as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return 0.5;
    }

    let (mut wins, mut neg_below) = (0.0f64, 0.0f64);
    let mut i = 0;
    while i < sorted.len() {
        let score = sorted[i].0;
        let (mut pos_here, mut neg_here) = (0.0, 0.0);
        while i < sorted.len() && sorted[i].0 == score {
            if sorted[i].1 { pos_here += 1.0 } else { neg_here += 1.0 }
            i += 1;
        }
        wins += pos_here * (neg_below + 0.5 * neg_here);
        neg_below += neg_here;
    }
    wins / (n_pos * n_neg)
}

/// Accounts whose defined score reaches the cutoff.
pub fn flag(scores: &BTreeMap<AccountId, AnomalyScore>, threshold: &Threshold) -> BTreeSet<AccountId> {
    scores
        .iter()
        .filter(|(_, s)| s.value().is_some_and(|v| v >= threshold.cutoff))
        .map(|(id, _)| id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectConfig;
    use crate::error::DiagnosticKind;
    use crate::events::{ScoreValue, UndefinedReason};

    fn scores(vals: &[(&str, f64)]) -> BTreeMap<AccountId, AnomalyScore> {
        vals.iter()
            .map(|(id, v)| {
                (id.to_string(), AnomalyScore {
                    entity_id: id.to_string(),
                    score: ScoreValue::Defined { value: *v },
                    contributions: vec![],
                    degraded: false,
                })
            })
            .collect()
    }

    fn labels(vals: &[(&str, bool)]) -> Vec<LabeledRecord> {
        vals.iter().map(|(id, l)| LabeledRecord { entity_id: id.to_string(), label: *l }).collect()
    }

    fn ctx() -> RunContext {
        RunContext::new(DetectConfig::default(), 0)
    }

    fn calibrated(o: CalibrationOutcome) -> CalibrationReport {
        match o {
            CalibrationOutcome::Calibrated(r) => r,
            other => panic!("expected calibration, got {other:?}"),
        }
    }

    #[test]
    fn confusion_metrics_with_empty_denominators() {
        let c = ConfusionCounts::default();
        assert_eq!((c.precision(), c.recall(), c.f1(), c.fpr()), (0.0, 0.0, 0.0, 0.0));
        let c = ConfusionCounts { tp: 3, fp: 1, tn: 4, fn_: 1 };
        assert!((c.precision() - 0.75).abs() < 1e-12);
        assert!((c.recall() - 0.75).abs() < 1e-12);
        assert!((c.fpr() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn perfect_separation_reaches_f1_one() {
        let s = scores(&[("a", 0.9), ("b", 0.8), ("c", 0.3), ("d", 0.1)]);
        let l = labels(&[("a", true), ("b", true), ("c", false), ("d", false)]);
        let r = calibrated(ThresholdCalibrator::calibrate(&ctx(), &l, &s, "m1", None).unwrap());
        assert_eq!(r.threshold.f1, 1.0);
        assert_eq!(r.threshold.cutoff, 0.8);
        assert_eq!(r.auc_roc, Some(1.0));
        assert_eq!(r.sweep.len(), 4);
    }

    #[test]
    fn f1_tie_prefers_precision() {
        // cutoff 0.2: tp2 fp2 → p .5 r 1 f1 .667
        // cutoff 0.9: tp1 fp0 fn1 → p 1 r .5 f1 .667
        let s = scores(&[("a", 0.9), ("b", 0.2), ("c", 0.5), ("d", 0.6)]);
        let l = labels(&[("a", true), ("b", true), ("c", false), ("d", false)]);
        let pairs: Vec<(f64, bool)> = vec![(0.9, true), (0.2, true), (0.5, false), (0.6, false)];
        let sweep = sweep(&ctx(), &pairs).unwrap();
        let best = best_f1(&sweep).unwrap();
        assert_eq!(best.cutoff, 0.9);
        let r = calibrated(ThresholdCalibrator::calibrate(&ctx(), &l, &s, "m1", None).unwrap());
        assert_eq!(r.threshold.cutoff, 0.9);
        assert_eq!(r.threshold.precision, 1.0);
    }

    #[test]
    fn recall_at_precision_mode() {
        let mut cfg = DetectConfig::default();
        cfg.calibration.objective = CalibrationObjective::MaxRecallAtPrecision { min_precision: 0.75 };
        let ctx = RunContext::new(cfg, 0);
        let s = scores(&[("a", 0.9), ("b", 0.8), ("c", 0.7), ("d", 0.6), ("e", 0.4), ("f", 0.3)]);
        let l = labels(&[("a", true), ("b", true), ("c", false), ("d", true), ("e", true), ("f", false)]);
        let r = calibrated(ThresholdCalibrator::calibrate(&ctx, &l, &s, "m1", None).unwrap());
        // at 0.4: tp4 fp1 → p .8 r 1.0
        assert_eq!(r.threshold.cutoff, 0.4);
        assert_eq!(r.threshold.recall, 1.0);
    }

    #[test]
    fn unreachable_precision_retains_previous() {
        let mut cfg = DetectConfig::default();
        cfg.calibration.objective = CalibrationObjective::MaxRecallAtPrecision { min_precision: 1.0 };
        let ctx = RunContext::new(cfg, 0);
        let s = scores(&[("a", 0.9), ("b", 0.1)]);
        let l = labels(&[("a", false), ("b", true)]);
        let out = ThresholdCalibrator::calibrate(&ctx, &l, &s, "m1", None).unwrap();
        assert!(matches!(out, CalibrationOutcome::Retained { previous: None, .. }));
        assert_eq!(ctx.diagnostics.count(DiagnosticKind::CalibrationFailure), 1);
    }

    #[test]
    fn single_label_sets_get_trivial_cutoffs() {
        let s = scores(&[("a", 0.4), ("b", 0.7)]);
        let pos = calibrated(
            ThresholdCalibrator::calibrate(&ctx(), &labels(&[("a", true), ("b", true)]), &s, "m", None).unwrap(),
        );
        assert_eq!(pos.threshold.cutoff, 0.0);
        assert_eq!(pos.threshold.recall, 1.0);
        let neg = calibrated(
            ThresholdCalibrator::calibrate(&ctx(), &labels(&[("a", false), ("b", false)]), &s, "m", None).unwrap(),
        );
        assert_eq!(neg.threshold.cutoff, 1.0);
        assert!(neg.auc_roc.is_none());
    }

    #[test]
    fn empty_set_keeps_previous_threshold() {
        let ctx = ctx();
        let previous = Threshold {
            metric: "campaign_score".into(),
            cutoff: 0.42,
            dataset_id: "old".into(),
            model_version: "m0".into(),
            n_samples: 10,
            precision: 0.9,
            recall: 0.8,
            f1: 0.85,
        };
        let mut s = scores(&[("a", 0.5)]);
        s.insert("u".into(), AnomalyScore::undefined("u", UndefinedReason::MissingFeatures));
        // only labels for the undefined account and an unknown one
        let l = labels(&[("u", true), ("ghost", false)]);
        let out = ThresholdCalibrator::calibrate(&ctx, &l, &s, "m1", Some(&previous)).unwrap();
        assert_eq!(out.threshold(), Some(&previous));
        assert_eq!(ctx.diagnostics.count(DiagnosticKind::CalibrationFailure), 1);
    }

    #[test]
    fn auc_counts_ties_as_half() {
        let pairs = [(0.5, true), (0.5, false)];
        assert!((auc_roc(&pairs) - 0.5).abs() < 1e-12);
        let pairs = [(0.9, true), (0.3, true), (0.5, false)];
        assert!((auc_roc(&pairs) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn flag_uses_inclusive_cutoff() {
        let mut s = scores(&[("a", 0.5), ("b", 0.49)]);
        s.insert("u".into(), AnomalyScore::undefined("u", UndefinedReason::MissingFeatures));
        let t = Threshold {
            metric: "m".into(),
            cutoff: 0.5,
            dataset_id: "d".into(),
            model_version: "v".into(),
            n_samples: 0,
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
        };
        assert_eq!(flag(&s, &t), BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn cancelled_sweep_stops() {
        let ctx = ctx();
        ctx.cancel.cancel();
        let s = scores(&[("a", 0.9), ("b", 0.1)]);
        let l = labels(&[("a", true), ("b", false)]);
        assert!(matches!(
            ThresholdCalibrator::calibrate(&ctx, &l, &s, "m", None),
            Err(DetectError::Cancelled(_))
        ));
    }
}
