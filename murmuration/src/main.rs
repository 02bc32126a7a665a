// murmuration/src/main.rs
//
// Batch driver: read one input snapshot, run detection, persist the
// calibrated threshold, write the run output as JSON.
//
// Usage:
//   murmuration --input snapshot.json
//   murmuration --input snapshot.json --model model.json --labels val.json \
//               --thresholds thresholds.json --seed 7 --output run.json
//
// Without --model the run is degraded: classifier weight is redistributed
// over the structural and burst components.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use murmuration::calibrate::{JsonFileThresholdStore, ThresholdStore};
use murmuration::events::{CampaignCluster, LabeledRecord};
use murmuration::scoring::{AnomalyScorer, LogisticModel, ProbabilityCache};
use murmuration::{pipeline, CancelToken, DetectConfig, RunContext, RunInput, RunOutput};

const RULE_BASED_VERSION: &str = "rule-based";

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "murmuration",
    about   = "Coordinated influence campaign detection",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, help = "Run input JSON (accounts, posts, interactions, features, labels)")]
    input: PathBuf,

    #[arg(long, help = "Detection config JSON; defaults when omitted")]
    config: Option<PathBuf>,

    #[arg(long, help = "Logistic classifier JSON; rule-based scoring when omitted")]
    model: Option<PathBuf>,

    #[arg(long, help = "Extra labeled records JSON, merged over the input's labels")]
    labels: Option<PathBuf>,

    #[arg(long, default_value = "/tmp/murmuration_thresholds.json",
          help = "Threshold store path")]
    thresholds: PathBuf,

    #[arg(long, default_value = "0", help = "Run seed")]
    seed: u64,

    #[arg(long, help = "Write run output JSON here instead of stdout")]
    output: Option<PathBuf>,

    #[arg(long, default_value = "MURMURATION_THRESHOLD_KEY",
          help = "Env var holding the threshold signing key")]
    signing_key_env: String,
}

// ── Loading ───────────────────────────────────────────────────────────────────

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {what} {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {what} {}", path.display()))
}

/// Labels from `--labels` replace input labels for the same entity.
fn merge_labels(base: &mut Vec<LabeledRecord>, extra: Vec<LabeledRecord>) {
    for rec in extra {
        match base.iter_mut().find(|l| l.entity_id == rec.entity_id) {
            Some(existing) => existing.label = rec.label,
            None => base.push(rec),
        }
    }
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_cluster(cluster: &CampaignCluster) {
    let color = if cluster.aggregate_score >= 0.8 { "\x1b[91;1m" } else { "\x1b[93;1m" };
    let reset = "\x1b[0m";
    let signals = cluster.explanation.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(" | ");
    let members = cluster.accounts.iter().take(8).cloned().collect::<Vec<_>>().join(", ");
    let more = cluster.size().saturating_sub(8);

    println!("\n{}campaign #{}{}  size={}", color, cluster.cluster_id, reset, cluster.size());
    println!("  Score   : {}{:.4}{} (mean {:.4})", color, cluster.aggregate_score, reset, cluster.mean_member_score);
    println!("  Signals : {}", signals);
    if more > 0 {
        println!("  Members : {} \x1b[90m(+{} more){}", members, more, reset);
    } else {
        println!("  Members : {}", members);
    }
}

fn print_summary(out: &RunOutput) {
    println!(
        "\n\x1b[1m── run {}  seed={}  model={}  nodes={}  edges={}  clusters={}  flagged={} ──\x1b[0m",
        out.run_id,
        out.seed,
        out.model_version,
        out.graph.nodes,
        out.graph.edges,
        out.clusters.len(),
        out.flagged.len(),
    );
    for cluster in &out.clusters {
        print_cluster(cluster);
    }
    if let Some(t) = &out.threshold {
        let origin = if out.recalibrated { "calibrated" } else { "carried over" };
        println!(
            "\n  Threshold {:.4} ({origin})  precision={:.3} recall={:.3} f1={:.3}",
            t.cutoff, t.precision, t.recall, t.f1
        );
    }
    for (kind, n) in &out.diagnostics.counts {
        println!("  \x1b[90m{kind:?}: {n}\x1b[0m");
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("murmuration=info".parse()?))
        .compact().init();

    let cli    = Cli::parse();
    let config = DetectConfig::load(cli.config.as_deref())?;

    let mut input: RunInput = read_json(&cli.input, "input").await?;
    if let Some(path) = &cli.labels {
        let extra: Vec<LabeledRecord> = read_json(path, "labels").await?;
        merge_labels(&mut input.labels, extra);
    }

    let mut scorer = AnomalyScorer::new(config.scorer.clone())
        .with_cache(Arc::new(ProbabilityCache::new()));
    if let Some(path) = &cli.model {
        let model = LogisticModel::load(path)?;
        info!(version = %model.version, path = %path.display(), "classifier loaded");
        scorer = scorer.with_classifier(Arc::new(model));
    }

    let mut store = JsonFileThresholdStore::new(&cli.thresholds);
    match std::env::var(&cli.signing_key_env) {
        Ok(key) if !key.is_empty() => store = store.with_signing_key(key.into_bytes()),
        _ => warn!(var = %cli.signing_key_env, "no threshold signing key, store entries are unverified"),
    }
    let model_version = scorer.model_version().unwrap_or(RULE_BASED_VERSION).to_string();
    let previous = store
        .load(&config.calibration.metric, &model_version)
        .context("loading previous threshold")?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let ctx = RunContext::new(config, cli.seed).with_cancel(cancel);
    let out = pipeline::run(ctx, Arc::new(input), scorer, previous).await?;

    if out.recalibrated {
        if let Some(t) = &out.threshold {
            store.save(t).context("saving calibrated threshold")?;
            info!(path = %store.path().display(), cutoff = t.cutoff, "threshold persisted");
        }
    }

    let json = serde_json::to_string_pretty(&out)?;
    match &cli.output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("writing output {}", path.display()))?;
            print_summary(&out);
            println!("\n  Output: \x1b[90m{}\x1b[0m\n", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
