// murmuration/src/events.rs
//
// Shared domain types flowing through the detection core.
//
// Inputs (Account, Post, InteractionRecord, FeatureVector, LabeledRecord) are
// produced by the ingestion and feature layers and are read-only once a run
// starts. Outputs (AnomalyScore, CampaignCluster, Threshold) are what the core
// hands to evaluation / reporting.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeatureError;

pub type AccountId = String;

/// Upper bound on free-form feature keys carried next to the fixed signal set.
pub const MAX_EXTENSIONS: usize = 16;
const MAX_EXTENSION_KEY_LEN: usize = 64;

// ── Ingested records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub id: String,
    pub account_id: AccountId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub language: Option<String>, // tag from the preprocessing layer
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Reply,
    Retweet,
    Mention,
    Follow,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 4] = [Self::Reply, Self::Retweet, Self::Mention, Self::Follow];
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reply => write!(f, "reply"),
            Self::Retweet => write!(f, "retweet"),
            Self::Mention => write!(f, "mention"),
            Self::Follow => write!(f, "follow"),
        }
    }
}

/// One interaction as delivered by ingestion. `weight` defaults to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionRecord {
    pub source: AccountId,
    pub target: AccountId,
    pub kind: InteractionKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub weight: Option<f64>,
}

impl InteractionRecord {
    pub fn new(
        source: impl Into<AccountId>,
        target: impl Into<AccountId>,
        kind: InteractionKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
            timestamp,
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Ground truth for calibration: `label == true` means campaign participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabeledRecord {
    pub entity_id: AccountId,
    pub label: bool,
}

// ── Feature vectors ───────────────────────────────────────────────────────────

/// Fixed set of content/user features the feature layer is expected to supply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSignal {
    PostRate,
    DuplicateContentRatio,
    AccountAgeDays,
    FollowerRatio,
    UrlShareRatio,
    HashtagDensity,
    ReplyRatio,
    LanguageEntropy,
}

impl FeatureSignal {
    pub const ALL: [FeatureSignal; 8] = [
        Self::PostRate,
        Self::DuplicateContentRatio,
        Self::AccountAgeDays,
        Self::FollowerRatio,
        Self::UrlShareRatio,
        Self::HashtagDensity,
        Self::ReplyRatio,
        Self::LanguageEntropy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostRate => "post_rate",
            Self::DuplicateContentRatio => "duplicate_content_ratio",
            Self::AccountAgeDays => "account_age_days",
            Self::FollowerRatio => "follower_ratio",
            Self::UrlShareRatio => "url_share_ratio",
            Self::HashtagDensity => "hashtag_density",
            Self::ReplyRatio => "reply_ratio",
            Self::LanguageEntropy => "language_entropy",
        }
    }
}

impl fmt::Display for FeatureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    pub source: String, // producing extractor, e.g. "content-v3"
    #[serde(default)]
    pub feature_version: Option<String>,
}

impl Provenance {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), feature_version: None }
    }

    pub fn versioned(source: impl Into<String>, version: impl Into<String>) -> Self {
        Self { source: source.into(), feature_version: Some(version.into()) }
    }
}

/// Per-entity features: the fixed signal set plus a bounded extension map.
///
/// Values are validated on construction and on deserialization, so a vector
/// that exists is always finite and its extension keys never shadow a fixed
/// signal name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawFeatureVector")]
pub struct FeatureVector {
    pub entity_id: AccountId,
    values: BTreeMap<FeatureSignal, f64>,
    extensions: BTreeMap<String, f64>,
    pub provenance: Provenance,
}

#[derive(Deserialize)]
struct RawFeatureVector {
    entity_id: AccountId,
    #[serde(default)]
    values: BTreeMap<FeatureSignal, f64>,
    #[serde(default)]
    extensions: BTreeMap<String, f64>,
    provenance: Provenance,
}

impl TryFrom<RawFeatureVector> for FeatureVector {
    type Error = FeatureError;

    fn try_from(raw: RawFeatureVector) -> Result<Self, Self::Error> {
        let mut fv = FeatureVector::new(raw.entity_id, raw.provenance);
        for (signal, value) in raw.values {
            fv = fv.with_value(signal, value)?;
        }
        for (key, value) in raw.extensions {
            fv = fv.with_extension(key, value)?;
        }
        Ok(fv)
    }
}

impl FeatureVector {
    pub fn new(entity_id: impl Into<AccountId>, provenance: Provenance) -> Self {
        Self {
            entity_id: entity_id.into(),
            values: BTreeMap::new(),
            extensions: BTreeMap::new(),
            provenance,
        }
    }

    pub fn with_value(mut self, signal: FeatureSignal, value: f64) -> Result<Self, FeatureError> {
        if !value.is_finite() {
            return Err(FeatureError::NonFinite { key: signal.to_string(), value });
        }
        self.values.insert(signal, value);
        Ok(self)
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: f64) -> Result<Self, FeatureError> {
        let key = key.into();
        validate_extension_key(&key)?;
        if !value.is_finite() {
            return Err(FeatureError::NonFinite { key, value });
        }
        if !self.extensions.contains_key(&key) && self.extensions.len() >= MAX_EXTENSIONS {
            return Err(FeatureError::TooManyExtensions { max: MAX_EXTENSIONS });
        }
        self.extensions.insert(key, value);
        Ok(self)
    }

    pub fn get(&self, signal: FeatureSignal) -> Option<f64> {
        self.values.get(&signal).copied()
    }

    pub fn extension(&self, key: &str) -> Option<f64> {
        self.extensions.get(key).copied()
    }

    pub fn values(&self) -> impl Iterator<Item = (FeatureSignal, f64)> + '_ {
        self.values.iter().map(|(s, v)| (*s, *v))
    }

    pub fn extensions(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.extensions.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

fn validate_extension_key(key: &str) -> Result<(), FeatureError> {
    let well_formed = !key.is_empty()
        && key.len() <= MAX_EXTENSION_KEY_LEN
        && key.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if !well_formed {
        return Err(FeatureError::InvalidKey(key.to_string()));
    }
    if FeatureSignal::ALL.iter().any(|s| s.as_str() == key) {
        return Err(FeatureError::ShadowsFixedSignal(key.to_string()));
    }
    Ok(())
}

// ── Score signals ─────────────────────────────────────────────────────────────

/// Normalized signals the scorer fuses. Ordering is the canonical explanation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Classifier,     // model probability
    Degree,         // normalized degree centrality
    PageRank,       // normalized PageRank
    Betweenness,    // normalized betweenness
    BurstIntensity, // peak excess over the account's own baseline
    BurstSynchrony, // share of a synchronized burst group
}

pub const N_SIGNALS: usize = 6;

impl Signal {
    pub const ALL: [Signal; N_SIGNALS] = [
        Self::Classifier,
        Self::Degree,
        Self::PageRank,
        Self::Betweenness,
        Self::BurstIntensity,
        Self::BurstSynchrony,
    ];
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classifier => write!(f, "classifier"),
            Self::Degree => write!(f, "degree"),
            Self::PageRank => write!(f, "pagerank"),
            Self::Betweenness => write!(f, "betweenness"),
            Self::BurstIntensity => write!(f, "burst_intensity"),
            Self::BurstSynchrony => write!(f, "burst_synchrony"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SignalContribution {
    pub signal: Signal,
    pub value: f64,        // normalized input in [0, 1]
    pub contribution: f64, // weighted share of the fused score
}

// ── Outputs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedReason {
    MissingFeatures,
}

impl fmt::Display for UndefinedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFeatures => write!(f, "missing_features"),
        }
    }
}

/// A score is either a value in [0, 1] or explicitly undefined. Never 0 by default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScoreValue {
    Defined { value: f64 },
    Undefined { reason: UndefinedReason },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyScore {
    pub entity_id: AccountId,
    pub score: ScoreValue,
    /// Sorted by contribution descending, ties in canonical signal order.
    pub contributions: Vec<SignalContribution>,
    /// True when the classifier was unavailable and the rule-based fallback ran.
    pub degraded: bool,
}

impl AnomalyScore {
    pub fn undefined(entity_id: impl Into<AccountId>, reason: UndefinedReason) -> Self {
        Self {
            entity_id: entity_id.into(),
            score: ScoreValue::Undefined { reason },
            contributions: Vec::new(),
            degraded: false,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self.score {
            ScoreValue::Defined { value } => Some(value),
            ScoreValue::Undefined { .. } => None,
        }
    }

    /// Up to `k` signals with a strictly positive contribution.
    pub fn top_signals(&self, k: usize) -> Vec<Signal> {
        self.contributions
            .iter()
            .filter(|c| c.contribution > 0.0)
            .take(k)
            .map(|c| c.signal)
            .collect()
    }

    /// Contribution per signal in canonical order (0.0 where absent).
    pub fn signal_profile(&self) -> [f64; N_SIGNALS] {
        let mut profile = [0.0; N_SIGNALS];
        for c in &self.contributions {
            if let Some(i) = Signal::ALL.iter().position(|s| *s == c.signal) {
                profile[i] = c.contribution;
            }
        }
        profile
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignCluster {
    pub cluster_id: u32,
    pub accounts: BTreeSet<AccountId>,
    pub aggregate_score: f64,
    pub mean_member_score: f64,
    pub explanation: BTreeSet<Signal>,
    /// Graph communities this cluster was grown from.
    pub seed_communities: Vec<u32>,
}

impl CampaignCluster {
    pub fn size(&self) -> usize {
        self.accounts.len()
    }
}

/// Calibrated score cutoff, persisted per (metric, model version).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub cutoff: f64,
    pub dataset_id: String,
    pub model_version: String,
    pub n_samples: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prov() -> Provenance {
        Provenance::new("test")
    }

    #[test]
    fn extension_keys_are_bounded() {
        let mut fv = FeatureVector::new("a", prov());
        for i in 0..MAX_EXTENSIONS {
            fv = fv.with_extension(format!("ext_{i}"), 1.0).unwrap();
        }
        let err = fv.clone().with_extension("one_more", 1.0).unwrap_err();
        assert!(matches!(err, FeatureError::TooManyExtensions { .. }));
        // overwriting an existing key is still fine at the limit
        assert!(fv.with_extension("ext_0", 2.0).is_ok());
    }

    #[test]
    fn extension_cannot_shadow_fixed_signal() {
        let err = FeatureVector::new("a", prov())
            .with_extension("post_rate", 3.0)
            .unwrap_err();
        assert!(matches!(err, FeatureError::ShadowsFixedSignal(_)));
    }

    #[test]
    fn malformed_extension_key_rejected() {
        for key in ["", "Has Caps", "dash-key"] {
            assert!(FeatureVector::new("a", prov()).with_extension(key, 1.0).is_err(), "{key}");
        }
    }

    #[test]
    fn deserialization_validates_values() {
        let ok = r#"{"entity_id":"a","values":{"post_rate":2.5},"provenance":{"source":"x"}}"#;
        let fv: FeatureVector = serde_json::from_str(ok).unwrap();
        assert_eq!(fv.get(FeatureSignal::PostRate), Some(2.5));

        let bad = r#"{"entity_id":"a","extensions":{"reply_ratio":1.0},"provenance":{"source":"x"}}"#;
        assert!(serde_json::from_str::<FeatureVector>(bad).is_err());
    }

    #[test]
    fn undefined_score_has_no_value() {
        let s = AnomalyScore::undefined("a", UndefinedReason::MissingFeatures);
        assert_eq!(s.value(), None);
        let json = serde_json::to_string(&s.score).unwrap();
        assert!(json.contains("\"status\":\"undefined\""));
    }

    #[test]
    fn top_signals_skip_zero_contributions() {
        let s = AnomalyScore {
            entity_id: "a".into(),
            score: ScoreValue::Defined { value: 0.4 },
            contributions: vec![
                SignalContribution { signal: Signal::Classifier, value: 0.8, contribution: 0.4 },
                SignalContribution { signal: Signal::Degree, value: 0.0, contribution: 0.0 },
            ],
            degraded: false,
        };
        assert_eq!(s.top_signals(3), vec![Signal::Classifier]);
        assert_eq!(s.signal_profile()[0], 0.4);
    }
}
