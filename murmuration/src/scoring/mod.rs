// murmuration/src/scoring/mod.rs
//
// Per-account anomaly scoring: injected classifier + structural + burst fusion.

pub mod cache;
pub mod fusion;
pub mod model;

pub use cache::ProbabilityCache;
pub use fusion::{centrality_signal, rank_order, AnomalyScorer};
pub use model::{Classifier, LogisticModel};
