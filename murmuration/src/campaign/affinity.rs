// murmuration/src/campaign/affinity.rs
//
// How alike two candidate clusters look.
//
//   correlation  mean Pearson r between members' per-signal contribution
//                profiles, over every cross-cluster member pair
//   burst boost  `boost` scaled by the share of cross pairs sitting in the
//                same synchronized burst group

use crate::burst::BurstReport;
use crate::events::N_SIGNALS;

/// Pearson correlation of two profiles. A constant profile has no defined r:
/// identical constant profiles count as 1, anything else as 0.
pub fn pearson(a: &[f64; N_SIGNALS], b: &[f64; N_SIGNALS]) -> f64 {
    let n = N_SIGNALS as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let (mut cov, mut va, mut vb) = (0.0, 0.0, 0.0);
    for i in 0..N_SIGNALS {
        let (da, db) = (a[i] - ma, b[i] - mb);
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    if va <= f64::EPSILON || vb <= f64::EPSILON {
        let same = a.iter().zip(b).all(|(x, y)| (x - y).abs() <= 1e-12);
        return if same { 1.0 } else { 0.0 };
    }
    (cov / (va.sqrt() * vb.sqrt())).clamp(-1.0, 1.0)
}

pub(crate) struct Member<'a> {
    pub id: &'a str,
    pub profile: [f64; N_SIGNALS],
}

pub(crate) fn affinity(left: &[Member<'_>], right: &[Member<'_>], bursts: &BurstReport, boost: f64) -> f64 {
    let pairs = (left.len() * right.len()) as f64;
    if pairs == 0.0 {
        return 0.0;
    }
    let mut corr = 0.0;
    let mut synced = 0usize;
    for a in left {
        let ga = bursts.group_of(a.id);
        for b in right {
            corr += pearson(&a.profile, &b.profile);
            if ga.is_some() && ga == bursts.group_of(b.id) {
                synced += 1;
            }
        }
    }
    corr / pairs + boost * synced as f64 / pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfectly_correlated_profiles() {
        let a = [0.4, 0.1, 0.05, 0.0, 0.1, 0.0];
        let b = [0.8, 0.2, 0.1, 0.0, 0.2, 0.0];
        assert!((pearson(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn anti_correlated_profiles() {
        let a = [1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let b = [0.0, 1.0, 0.0, 1.0, 0.0, 1.0];
        assert!((pearson(&a, &b) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn constant_profiles() {
        let zero = [0.0; N_SIGNALS];
        let varied = [0.1, 0.2, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(pearson(&zero, &zero), 1.0);
        assert_eq!(pearson(&zero, &varied), 0.0);
    }

    #[test]
    fn affinity_is_mean_over_cross_pairs() {
        let up = [1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let down = [0.0, 1.0, 0.0, 1.0, 0.0, 1.0];
        let left = [Member { id: "a", profile: up }];
        let right = [Member { id: "b", profile: up }, Member { id: "c", profile: down }];
        let a = affinity(&left, &right, &BurstReport::default(), 0.5);
        assert!(a.abs() < 1e-12);
    }
}
