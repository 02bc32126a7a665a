// murmuration/src/campaign/mod.rs
//
// Campaign aggregation: graph communities → scored, explained clusters.
//
// Pipeline:
//   1. seed one candidate per community (accounts with undefined scores left out)
//   2. greedily merge the most alike pair of candidates while their affinity
//      reaches `merge_threshold`; only candidates that touch in the graph or
//      share a burst group are compared
//   3. drop candidates below `min_cluster_size` or with mean score < `score_floor`
//   4. aggregate score = centrality-weighted mean, weight = 1 + primary centrality
//   5. order by aggregate ↓, size ↓, smallest account id ↑ and number 0..n

pub mod affinity;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::burst::BurstReport;
use crate::context::RunContext;
use crate::error::DetectError;
use crate::events::{AccountId, AnomalyScore, CampaignCluster, Signal};
use crate::graph::Graph;

use affinity::Member;

#[derive(Debug, Clone)]
struct Candidate {
    members: BTreeSet<AccountId>,
    seeds: Vec<u32>,
}

impl Candidate {
    fn min_id(&self) -> &str {
        self.members.first().map(String::as_str).unwrap_or_default()
    }
}

pub struct CampaignAggregator;

impl CampaignAggregator {
    pub fn aggregate(
        ctx: &RunContext,
        graph: &Graph,
        bursts: &BurstReport,
        scores: &BTreeMap<AccountId, AnomalyScore>,
    ) -> Result<Vec<CampaignCluster>, DetectError> {
        let cfg = &ctx.config.aggregator;
        let score_of = |id: &str| scores.get(id).and_then(AnomalyScore::value);

        let mut candidates: Vec<Candidate> = graph
            .communities()
            .into_iter()
            .filter_map(|(cid, members)| {
                let members: BTreeSet<AccountId> =
                    members.into_iter().filter(|m| score_of(m.as_str()).is_some()).collect();
                (!members.is_empty()).then(|| Candidate { members, seeds: vec![cid] })
            })
            .collect();
        candidates.sort_by(|a, b| a.min_id().cmp(b.min_id()));
        let n_seeds = candidates.len();

        let merges = merge_candidates(ctx, graph, bursts, scores, &mut candidates)?;

        let mut clusters: Vec<CampaignCluster> = candidates
            .into_iter()
            .filter_map(|c| {
                let member_scores: Vec<f64> = c.members.iter().filter_map(|m| score_of(m.as_str())).collect();
                let mean = member_scores.iter().sum::<f64>() / member_scores.len().max(1) as f64;
                if c.members.len() < cfg.min_cluster_size || mean < cfg.score_floor {
                    debug!(size = c.members.len(), mean, min = %c.min_id(), "candidate pruned");
                    return None;
                }
                Some(build_cluster(ctx, graph, scores, c, mean))
            })
            .collect();

        clusters.sort_by(cluster_order);
        for (i, c) in clusters.iter_mut().enumerate() {
            c.cluster_id = i as u32;
        }

        info!(
            run_id = %ctx.run_id,
            seeds = n_seeds,
            merges,
            clusters = clusters.len(),
            top_score = clusters.first().map(|c| c.aggregate_score).unwrap_or(0.0),
            "campaign clusters emitted"
        );
        Ok(clusters)
    }
}

fn merge_candidates(
    ctx: &RunContext,
    graph: &Graph,
    bursts: &BurstReport,
    scores: &BTreeMap<AccountId, AnomalyScore>,
    candidates: &mut Vec<Candidate>,
) -> Result<usize, DetectError> {
    let cfg = &ctx.config.aggregator;
    // (min id, min id) → affinity, None when the pair is not comparable
    let mut memo: BTreeMap<(AccountId, AccountId), Option<f64>> = BTreeMap::new();
    let mut merges = 0;

    loop {
        ctx.cancel.check("campaign merge")?;
        let mut best: Option<(f64, usize, usize)> = None;
        for i in 0..candidates.len() {
            for j in i + 1..candidates.len() {
                let key = (candidates[i].min_id().to_string(), candidates[j].min_id().to_string());
                let aff = *memo.entry(key).or_insert_with(|| {
                    comparable(graph, bursts, &candidates[i], &candidates[j]).then(|| {
                        affinity::affinity(
                            &members(&candidates[i], scores),
                            &members(&candidates[j], scores),
                            bursts,
                            cfg.burst_merge_boost,
                        )
                    })
                });
                if let Some(a) = aff {
                    if best.map_or(true, |(b, _, _)| a > b) {
                        best = Some((a, i, j));
                    }
                }
            }
        }

        let Some((aff, keep, gone)) = best else { break };
        if aff < cfg.merge_threshold {
            break;
        }
        // keep < gone and candidates are sorted by min id, so keep's min id survives
        let absorbed = candidates.remove(gone);
        let target = &mut candidates[keep];
        debug!(into = %target.min_id(), from = %absorbed.min_id(), affinity = aff, "merging candidates");
        let stale = target.min_id().to_string();
        memo.retain(|(a, b), _| *a != stale && *b != stale);
        target.members.extend(absorbed.members);
        target.seeds.extend(absorbed.seeds);
        target.seeds.sort_unstable();
        merges += 1;
    }
    Ok(merges)
}

fn comparable(graph: &Graph, bursts: &BurstReport, a: &Candidate, b: &Candidate) -> bool {
    a.members.iter().any(|x| {
        let gx = bursts.group_of(x);
        b.members
            .iter()
            .any(|y| graph.adjacent(x, y) || (gx.is_some() && gx == bursts.group_of(y)))
    })
}

fn members<'a>(c: &'a Candidate, scores: &BTreeMap<AccountId, AnomalyScore>) -> Vec<Member<'a>> {
    c.members
        .iter()
        .filter_map(|id| scores.get(id).map(|s| Member { id, profile: s.signal_profile() }))
        .collect()
}

fn build_cluster(
    ctx: &RunContext,
    graph: &Graph,
    scores: &BTreeMap<AccountId, AnomalyScore>,
    c: Candidate,
    mean: f64,
) -> CampaignCluster {
    let cfg = &ctx.config;
    let primary = cfg.graph.primary_centrality;
    let (mut num, mut den) = (0.0, 0.0);
    let mut explanation: BTreeSet<Signal> = BTreeSet::new();

    for id in &c.members {
        let Some(score) = scores.get(id) else { continue };
        let Some(value) = score.value() else { continue };
        let w = 1.0 + graph.normalized_centrality(primary, id).unwrap_or(0.0);
        num += w * value;
        den += w;
        explanation.extend(score.top_signals(cfg.aggregator.top_k));
    }

    CampaignCluster {
        cluster_id: 0,
        accounts: c.members,
        aggregate_score: if den > 0.0 { num / den } else { 0.0 },
        mean_member_score: mean,
        explanation,
        seed_communities: c.seeds,
    }
}

fn cluster_order(a: &CampaignCluster, b: &CampaignCluster) -> Ordering {
    b.aggregate_score
        .total_cmp(&a.aggregate_score)
        .then_with(|| b.size().cmp(&a.size()))
        .then_with(|| a.accounts.first().cmp(&b.accounts.first()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burst::SyncGroup;
    use crate::config::DetectConfig;
    use crate::events::{InteractionKind, InteractionRecord, ScoreValue, SignalContribution};
    use crate::graph::InteractionGraph;
    use chrono::{TimeZone, Utc};

    fn rec(s: &str, t: &str) -> InteractionRecord {
        InteractionRecord::new(s, t, InteractionKind::Reply, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn score(id: &str, value: f64, profile: &[(Signal, f64)]) -> (AccountId, AnomalyScore) {
        let contributions = profile
            .iter()
            .map(|(s, c)| SignalContribution { signal: *s, value: *c, contribution: *c })
            .collect();
        (
            id.to_string(),
            AnomalyScore { entity_id: id.into(), score: ScoreValue::Defined { value }, contributions, degraded: false },
        )
    }

    fn flat(id: &str, value: f64) -> (AccountId, AnomalyScore) {
        score(id, value, &[(Signal::Classifier, value)])
    }

    fn ctx_with(min_size: usize, floor: f64) -> RunContext {
        let mut cfg = DetectConfig::default();
        cfg.aggregator.min_cluster_size = min_size;
        cfg.aggregator.score_floor = floor;
        RunContext::new(cfg, 5)
    }

    #[test]
    fn size_and_floor_prune() {
        let ctx = ctx_with(2, 0.5);
        let graph = InteractionGraph::from_records(
            &ctx,
            &[rec("a", "b"), rec("b", "c"), rec("c", "a"), rec("d", "e"), rec("f", "f")],
        )
        .unwrap();
        let scores = BTreeMap::from([
            flat("a", 0.9), flat("b", 0.9), flat("c", 0.9),
            flat("d", 0.2), flat("e", 0.2), flat("f", 0.1),
        ]);
        let clusters = CampaignAggregator::aggregate(&ctx, &graph, &BurstReport::default(), &scores).unwrap();
        assert_eq!(clusters.len(), 1);
        let ids: Vec<&str> = clusters[0].accounts.iter().map(String::as_str).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!((clusters[0].aggregate_score - 0.9).abs() < 1e-12);
        assert_eq!(clusters[0].explanation, BTreeSet::from([Signal::Classifier]));
    }

    #[test]
    fn undefined_scores_never_join() {
        let ctx = ctx_with(2, 0.0);
        let graph = InteractionGraph::from_records(&ctx, &[rec("a", "b"), rec("b", "c"), rec("c", "a")]).unwrap();
        let mut scores = BTreeMap::from([flat("a", 0.9), flat("b", 0.8)]);
        scores.insert(
            "c".into(),
            AnomalyScore::undefined("c", crate::events::UndefinedReason::MissingFeatures),
        );
        let clusters = CampaignAggregator::aggregate(&ctx, &graph, &BurstReport::default(), &scores).unwrap();
        assert_eq!(clusters.len(), 1);
        assert!(!clusters[0].accounts.contains("c"));
    }

    #[test]
    fn central_members_weigh_more() {
        let ctx = ctx_with(2, 0.0);
        // star around hub; hub has the highest PageRank
        let graph = InteractionGraph::from_records(&ctx, &[rec("x", "hub"), rec("y", "hub"), rec("z", "hub")]).unwrap();
        let scores = BTreeMap::from([flat("hub", 1.0), flat("x", 0.0), flat("y", 0.0), flat("z", 0.0)]);
        let clusters = CampaignAggregator::aggregate(&ctx, &graph, &BurstReport::default(), &scores).unwrap();
        assert_eq!(clusters.len(), 1);
        let c = &clusters[0];
        assert!((c.mean_member_score - 0.25).abs() < 1e-12);
        assert!(c.aggregate_score > c.mean_member_score);
    }

    #[test]
    fn burst_groups_bridge_disconnected_communities() {
        let mut ctx = ctx_with(2, 0.0);
        let mut cfg = (*ctx.config).clone();
        cfg.aggregator.merge_threshold = 1.1;
        cfg.aggregator.burst_merge_boost = 0.2;
        ctx.config = std::sync::Arc::new(cfg);

        let graph = InteractionGraph::from_records(&ctx, &[rec("a", "b"), rec("c", "d")]).unwrap();
        let profile = [(Signal::Classifier, 0.4), (Signal::Degree, 0.1)];
        let scores = BTreeMap::from([
            score("a", 0.5, &profile), score("b", 0.5, &profile),
            score("c", 0.5, &profile), score("d", 0.5, &profile),
        ]);

        let none = CampaignAggregator::aggregate(&ctx, &graph, &BurstReport::default(), &scores).unwrap();
        assert_eq!(none.len(), 2);

        let groups = BurstReport::with_groups(vec![SyncGroup {
            id: 0,
            members: ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect(),
        }]);
        let merged = CampaignAggregator::aggregate(&ctx, &graph, &groups, &scores).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].size(), 4);
        assert_eq!(merged[0].seed_communities, vec![0, 1]);
    }

    #[test]
    fn equal_scores_order_by_size_then_min_id() {
        let cluster = |ids: &[&str], score: f64| CampaignCluster {
            cluster_id: 0,
            accounts: ids.iter().map(|s| s.to_string()).collect(),
            aggregate_score: score,
            mean_member_score: score,
            explanation: BTreeSet::new(),
            seed_communities: vec![],
        };
        let mut clusters = vec![
            cluster(&["m", "n"], 0.6),
            cluster(&["b", "c"], 0.6),
            cluster(&["x", "y"], 0.7),
            cluster(&["p", "q", "r"], 0.6),
        ];
        clusters.sort_by(cluster_order);
        let firsts: Vec<&str> = clusters.iter().map(|c| c.accounts.first().unwrap().as_str()).collect();
        assert_eq!(firsts, ["x", "p", "b", "m"]);
    }
}
