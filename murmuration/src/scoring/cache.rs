// murmuration/src/scoring/cache.rs
//
// Content-addressed classifier output cache.
//
// Opt-in only: a lookup happens when the feature vector carries a
// `feature_version`, otherwise the classifier runs every time.
// Key = SHA-256(entity id, feature version, model version), so a new model or
// a re-extracted vector never hits a stale entry.
//
// DashMap = sharded concurrent map, shared by all scoring chunks of a run and
// optionally across runs when the caller keeps the same instance.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::ModelError;
use crate::events::FeatureVector;

use super::model::{checked_probability, Classifier};

#[derive(Debug, Default)]
pub struct ProbabilityCache {
    entries: DashMap<String, f64>,
    hits:    AtomicU64,
    misses:  AtomicU64,
}

impl ProbabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(entity_id: &str, feature_version: &str, model_version: &str) -> String {
        let mut h = Sha256::new();
        for part in [entity_id, feature_version, model_version] {
            h.update((part.len() as u64).to_le_bytes());
            h.update(part.as_bytes());
        }
        hex::encode(h.finalize())
    }

    /// Cached probability when the vector is versioned, a direct call otherwise.
    /// Errors are never cached.
    pub fn predict(&self, model: &dyn Classifier, fv: &FeatureVector) -> Result<f64, ModelError> {
        let Some(fver) = fv.provenance.feature_version.as_deref() else {
            return model.predict_proba(fv);
        };
        let key = Self::key(&fv.entity_id, fver, model.version());
        if let Some(p) = self.entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*p);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let p = checked_probability(model.predict_proba(fv)?)?;
        self.entries.insert(key, p);
        Ok(p)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
