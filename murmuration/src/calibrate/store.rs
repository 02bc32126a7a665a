// murmuration/src/calibrate/store.rs
//
// Threshold persistence, one entry per (metric, model version).
//
// File format: pretty JSON, `{"entries": [SignedThreshold, ...]}`.
// Signing: hex(HMAC-SHA256(canonical_threshold_json, key)) when a key is
// configured. With a key set, unsigned or tampered entries are skipped on
// read with a warning, so a bad entry behaves like no entry at all.

use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::events::Threshold;

type HmacSha256 = Hmac<sha2::Sha256>;

pub trait ThresholdStore: Send + Sync {
    fn load(&self, metric: &str, model_version: &str) -> Result<Option<Threshold>, StoreError>;
    fn save(&self, threshold: &Threshold) -> Result<(), StoreError>;
}

fn same_key(t: &Threshold, metric: &str, model_version: &str) -> bool {
    t.metric == metric && t.model_version == model_version
}

// ── In-memory ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryThresholdStore {
    entries: Mutex<Vec<Threshold>>,
}

impl InMemoryThresholdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThresholdStore for InMemoryThresholdStore {
    fn load(&self, metric: &str, model_version: &str) -> Result<Option<Threshold>, StoreError> {
        Ok(self.entries.lock().iter().find(|t| same_key(t, metric, model_version)).cloned())
    }

    fn save(&self, threshold: &Threshold) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        entries.retain(|t| !same_key(t, &threshold.metric, &threshold.model_version));
        entries.push(threshold.clone());
        Ok(())
    }
}

// ── JSON file ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedThreshold {
    pub threshold: Threshold,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    entries: Vec<SignedThreshold>,
}

pub struct JsonFileThresholdStore {
    path:        PathBuf,
    signing_key: Option<Vec<u8>>,
}

impl JsonFileThresholdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), signing_key: None }
    }

    pub fn with_signing_key(mut self, key: Vec<u8>) -> Self {
        if !key.is_empty() {
            self.signing_key = Some(key);
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<StoreFile, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(StoreFile::default()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, file: &StoreFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn verified(&self, entry: &SignedThreshold) -> bool {
        let Some(key) = &self.signing_key else { return true };
        let Some(sig) = entry.signature.as_deref().and_then(|s| hex::decode(s).ok()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else { return false };
        mac.update(canonical(&entry.threshold).as_bytes());
        mac.verify_slice(&sig).is_ok()
    }

    fn sign(&self, threshold: &Threshold) -> Option<String> {
        let key = self.signing_key.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(canonical(threshold).as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}

fn canonical(t: &Threshold) -> String {
    serde_json::to_string(t).unwrap_or_default()
}

impl ThresholdStore for JsonFileThresholdStore {
    fn load(&self, metric: &str, model_version: &str) -> Result<Option<Threshold>, StoreError> {
        let file = self.read()?;
        let Some(entry) = file.entries.iter().find(|e| same_key(&e.threshold, metric, model_version)) else {
            debug!(path = %self.path.display(), metric, model_version, "no stored threshold");
            return Ok(None);
        };
        if !self.verified(entry) {
            warn!(path = %self.path.display(), metric, model_version, "stored threshold failed signature check, ignored");
            return Ok(None);
        }
        Ok(Some(entry.threshold.clone()))
    }

    fn save(&self, threshold: &Threshold) -> Result<(), StoreError> {
        let mut file = self.read()?;
        file.entries.retain(|e| !same_key(&e.threshold, &threshold.metric, &threshold.model_version));
        file.entries.push(SignedThreshold { threshold: threshold.clone(), signature: self.sign(threshold) });
        file.entries.sort_by(|a, b| {
            (&a.threshold.metric, &a.threshold.model_version).cmp(&(&b.threshold.metric, &b.threshold.model_version))
        });
        self.write(&file)
    }
}
