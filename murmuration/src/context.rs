// murmuration/src/context.rs
//
// Run-scoped context handed to every component. Replaces any notion of
// process-global state: two runs with two contexts never share anything, and
// a run's randomness comes only from `seed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

use crate::config::DetectConfig;
use crate::error::{DetectError, Diagnostics};

/// Cooperative cancellation flag, cloned into every long-running step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Call between discrete units of work.
    pub fn check(&self, stage: &'static str) -> Result<(), DetectError> {
        if self.is_cancelled() {
            Err(DetectError::Cancelled(stage))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub seed: u64,
    pub config: Arc<DetectConfig>,
    pub cancel: CancelToken,
    pub diagnostics: Arc<Diagnostics>,
}

impl RunContext {
    pub fn new(config: DetectConfig, seed: u64) -> Self {
        Self {
            run_id: String::new(),
            seed,
            config: Arc::new(config),
            cancel: CancelToken::new(),
            diagnostics: Arc::new(Diagnostics::new()),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Derive the run id from the input digest, the config and the seed.
    pub fn bind_input(&mut self, input_digest: &str) {
        let mut h = Sha256::new();
        h.update(b"murmuration/run/v1:");
        h.update(input_digest.as_bytes());
        h.update(b":");
        h.update(self.config.fingerprint().as_bytes());
        h.update(self.seed.to_le_bytes());
        self.run_id = hex::encode(&h.finalize()[..12]);
    }

    /// Fresh generator for one randomized step; same seed, same stream.
    pub fn rng(&self, stream: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}
