// murmuration/src/burst/mod.rs
//
// Per-account temporal burst detection.
//
// All accounts share one window grid anchored at the run's earliest event:
// window w covers [origin + w*step, origin + w*step + width). Each account is
// compared only against its own history: the trailing windows since its first
// active window, capped at `max_baseline_windows`.
//
// A window is a burst when count > mean + k * std (population std) of that
// trailing baseline. Accounts with fewer than `min_events` events get no burst
// profile at all, so downstream signals treat them as undefined rather than 0.

pub mod sync;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BurstConfig;
use crate::context::RunContext;
use crate::error::{DetectError, Diagnostic};
use crate::events::AccountId;

pub use sync::SyncGroup;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BurstWindow {
    pub start: DateTime<Utc>,
    pub count: usize,
    pub threshold: f64,
}

/// Half-open `[start, end)` span covered by one or more consecutive burst windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BurstInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BurstInterval {
    pub fn secs(&self) -> i64 {
        (self.end - self.start).num_seconds().max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BurstProfile {
    pub account_id: AccountId,
    pub n_events: usize,
    pub bursts: Vec<BurstWindow>,
    pub intervals: Vec<BurstInterval>,
    /// Peak relative excess over threshold squashed into [0, 1); 0 with no bursts.
    pub intensity: f64,
}

impl BurstProfile {
    pub fn is_bursting(&self) -> bool {
        !self.bursts.is_empty()
    }

    pub fn burst_secs(&self) -> i64 {
        self.intervals.iter().map(BurstInterval::secs).sum()
    }
}

/// What the scorer sees for one account. Absent when the burst score is undefined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurstContext {
    pub intensity: f64,
    pub synchrony: f64,
    pub group: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct BurstReport {
    profiles: BTreeMap<AccountId, BurstProfile>,
    undefined: BTreeSet<AccountId>,
    groups: Vec<SyncGroup>,
    group_of: BTreeMap<AccountId, u32>,
}

impl BurstReport {
    pub fn profile(&self, id: &str) -> Option<&BurstProfile> {
        self.profiles.get(id)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &BurstProfile> + '_ {
        self.profiles.values()
    }

    pub fn is_undefined(&self, id: &str) -> bool {
        !self.profiles.contains_key(id)
    }

    /// Accounts that were examined but had too few events.
    pub fn undefined(&self) -> &BTreeSet<AccountId> {
        &self.undefined
    }

    pub fn groups(&self) -> &[SyncGroup] {
        &self.groups
    }

    pub fn group_of(&self, id: &str) -> Option<u32> {
        self.group_of.get(id).copied()
    }

    pub fn context(&self, id: &str) -> Option<BurstContext> {
        let profile = self.profiles.get(id)?;
        let group = self.group_of(id);
        let synchrony = group
            .and_then(|g| self.groups.get(g as usize))
            .map(|g| 1.0 - 1.0 / g.members.len() as f64)
            .unwrap_or(0.0);
        Some(BurstContext { intensity: profile.intensity, synchrony, group })
    }

    #[cfg(test)]
    pub(crate) fn with_groups(groups: Vec<SyncGroup>) -> Self {
        let group_of = groups
            .iter()
            .flat_map(|g| g.members.iter().map(move |m| (m.clone(), g.id)))
            .collect();
        Self { groups, group_of, ..Default::default() }
    }
}

pub struct TemporalBurstDetector;

impl TemporalBurstDetector {
    pub fn detect(
        ctx: &RunContext,
        events: &BTreeMap<AccountId, Vec<DateTime<Utc>>>,
    ) -> Result<BurstReport, DetectError> {
        let cfg = &ctx.config.burst;
        let mut report = BurstReport::default();

        let Some(origin) = events.values().flatten().min().copied() else {
            report.undefined = events.keys().cloned().collect();
            for id in &report.undefined {
                record_sparse(ctx, id, 0, cfg.min_events);
            }
            return Ok(report);
        };
        let last = events.values().flatten().max().copied().unwrap_or(origin);
        let n_windows = usize::try_from((last - origin).num_seconds() / cfg.step_secs)
            .unwrap_or(usize::MAX)
            .saturating_add(1);
        if n_windows > cfg.max_windows {
            warn!(run_id = %ctx.run_id, windows = n_windows, max = cfg.max_windows, "burst window grid too large");
            for id in events.keys() {
                ctx.diagnostics.record(Diagnostic::InsufficientData {
                    entity_id: id.clone(),
                    detail: format!("{n_windows} windows exceed burst.max_windows {}", cfg.max_windows),
                });
                report.undefined.insert(id.clone());
            }
            return Ok(report);
        }

        for (id, stamps) in events {
            ctx.cancel.check("burst detection")?;
            if stamps.len() < cfg.min_events {
                record_sparse(ctx, id, stamps.len(), cfg.min_events);
                report.undefined.insert(id.clone());
                continue;
            }
            let counts = window_counts(stamps, origin, n_windows, cfg);
            let profile = profile_account(id, stamps.len(), &counts, origin, cfg);
            if profile.is_bursting() {
                debug!(account = %id, bursts = profile.bursts.len(), intensity = profile.intensity, "bursting account");
            }
            report.profiles.insert(id.clone(), profile);
        }

        report.groups = sync::synchronized_groups(report.profiles.values(), cfg.overlap_fraction);
        for group in &report.groups {
            for member in &group.members {
                report.group_of.insert(member.clone(), group.id);
            }
        }

        info!(
            run_id = %ctx.run_id,
            accounts = events.len(),
            windows = n_windows,
            bursting = report.profiles.values().filter(|p| p.is_bursting()).count(),
            undefined = report.undefined.len(),
            sync_groups = report.groups.len(),
            "burst detection complete"
        );
        Ok(report)
    }
}

fn record_sparse(ctx: &RunContext, id: &str, n: usize, min: usize) {
    ctx.diagnostics.record(Diagnostic::InsufficientData {
        entity_id: id.to_string(),
        detail: format!("{n} events, burst detection needs {min}"),
    });
}

/// Event counts per window on the shared grid. An event may fall in several
/// windows when width > step, or in none when width < step.
fn window_counts(
    stamps: &[DateTime<Utc>],
    origin: DateTime<Utc>,
    n_windows: usize,
    cfg: &BurstConfig,
) -> Vec<usize> {
    let mut counts = vec![0usize; n_windows];
    for t in stamps {
        let d = (*t - origin).num_seconds();
        let hi = (d / cfg.step_secs) as usize;
        let lo = if d < cfg.window_secs { 0 } else { ((d - cfg.window_secs) / cfg.step_secs + 1) as usize };
        for w in lo..=hi.min(n_windows.saturating_sub(1)) {
            counts[w] += 1;
        }
    }
    counts
}

fn profile_account(
    id: &str,
    n_events: usize,
    counts: &[usize],
    origin: DateTime<Utc>,
    cfg: &BurstConfig,
) -> BurstProfile {
    let mut bursts = Vec::new();
    let mut intensity = 0.0f64;
    let mut burst_idx = Vec::new();

    if let Some(first) = counts.iter().position(|c| *c > 0) {
        for w in first + cfg.min_baseline_windows..counts.len() {
            let from = first.max(w.saturating_sub(cfg.max_baseline_windows));
            let prior = &counts[from..w];
            let threshold = baseline_threshold(prior, cfg.k);
            if (counts[w] as f64) > threshold {
                let excess = (counts[w] as f64 - threshold) / threshold.max(1.0);
                intensity = intensity.max(excess / (excess + 1.0));
                bursts.push(BurstWindow { start: window_start(origin, w, cfg), count: counts[w], threshold });
                burst_idx.push(w);
            }
        }
    }

    BurstProfile {
        account_id: id.to_string(),
        n_events,
        intervals: merge_intervals(&burst_idx, origin, cfg),
        bursts,
        intensity,
    }
}

/// `mean + k * std` over the baseline counts, population std.
pub fn baseline_threshold(prior: &[usize], k: f64) -> f64 {
    if prior.is_empty() {
        return 0.0;
    }
    let n = prior.len() as f64;
    let mean = prior.iter().sum::<usize>() as f64 / n;
    let var = prior.iter().map(|c| (*c as f64 - mean).powi(2)).sum::<f64>() / n;
    mean + k * var.sqrt()
}

pub fn exceeds_baseline(count: usize, prior: &[usize], k: f64) -> bool {
    count as f64 > baseline_threshold(prior, k)
}

fn window_start(origin: DateTime<Utc>, w: usize, cfg: &BurstConfig) -> DateTime<Utc> {
    origin + Duration::seconds(w as i64 * cfg.step_secs)
}

fn merge_intervals(windows: &[usize], origin: DateTime<Utc>, cfg: &BurstConfig) -> Vec<BurstInterval> {
    let width = Duration::seconds(cfg.window_secs);
    let mut out: Vec<BurstInterval> = Vec::new();
    for &w in windows {
        let start = window_start(origin, w, cfg);
        let end = start + width;
        match out.last_mut() {
            Some(prev) if start <= prev.end => prev.end = prev.end.max(end),
            _ => out.push(BurstInterval { start, end }),
        }
    }
    out
}
