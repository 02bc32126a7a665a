// murmuration/src/scoring/model.rs
//
// The classifier seam. The detection core only ever sees `Classifier`; the
// logistic model here is the artifact the CLI loads with `--model`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::events::{FeatureSignal, FeatureVector};

/// Feature vector -> campaign-participation probability.
///
/// Implementations must be deterministic and must not perform I/O; the scorer
/// calls them from blocking worker threads.
pub trait Classifier: Send + Sync {
    fn version(&self) -> &str;
    fn predict_proba(&self, features: &FeatureVector) -> Result<f64, ModelError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogisticModel {
    pub version: String,
    pub bias: f64,
    #[serde(default)]
    pub weights: BTreeMap<FeatureSignal, f64>,
    #[serde(default)]
    pub extension_weights: BTreeMap<String, f64>,
}

impl LogisticModel {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading model {}", path.display()))?;
        let model: LogisticModel = serde_json::from_str(&raw)
            .with_context(|| format!("parsing model {}", path.display()))?;
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            bail!("model version must not be empty");
        }
        let finite = self.bias.is_finite()
            && self.weights.values().all(|w| w.is_finite())
            && self.extension_weights.values().all(|w| w.is_finite());
        if !finite {
            bail!("model {} has non-finite coefficients", self.version);
        }
        Ok(())
    }

    fn logit(&self, fv: &FeatureVector) -> f64 {
        let fixed: f64 = fv
            .values()
            .filter_map(|(s, v)| self.weights.get(&s).map(|w| w * v))
            .sum();
        let ext: f64 = fv
            .extensions()
            .filter_map(|(k, v)| self.extension_weights.get(k).map(|w| w * v))
            .sum();
        self.bias + fixed + ext
    }
}

impl Classifier for LogisticModel {
    fn version(&self) -> &str {
        &self.version
    }

    fn predict_proba(&self, features: &FeatureVector) -> Result<f64, ModelError> {
        checked_probability(1.0 / (1.0 + (-self.logit(features)).exp()))
    }
}

/// A classifier output the scorer may use: finite and within [0, 1].
pub(crate) fn checked_probability(p: f64) -> Result<f64, ModelError> {
    if p.is_finite() && (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(ModelError::InvalidOutput(p))
    }
}
