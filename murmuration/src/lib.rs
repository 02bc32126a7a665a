// murmuration/src/lib.rs
//
// Murmuration: coordinated influence campaign detection over a batch of
// accounts, posts and interactions.
//
//   graph      interaction graph, centrality, communities
//   burst      per-account burst windows and synchronized burst groups
//   scoring    classifier + structural + burst fusion into one score
//   campaign   score-profile clustering into campaign candidates
//   calibrate  threshold sweep against labels, threshold persistence
//   pipeline   one run end to end

pub mod burst;
pub mod calibrate;
pub mod campaign;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod graph;
pub mod pipeline;
pub mod scoring;

pub use config::DetectConfig;
pub use context::{CancelToken, RunContext};
pub use error::{DetectError, Diagnostic, DiagnosticKind, DiagnosticReport};
pub use pipeline::{run, RunInput, RunOutput};
