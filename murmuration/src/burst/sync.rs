// murmuration/src/burst/sync.rs
//
// Synchronized burst groups: accounts whose burst intervals overlap.
//
// Two bursting accounts are linked when the time they spend bursting together
// covers at least `overlap_fraction` of the shorter of their two burst spans.
// Groups are the connected components of that relation with two or more
// members, numbered by their smallest account id.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};

use crate::events::AccountId;

use super::{BurstInterval, BurstProfile};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncGroup {
    pub id: u32,
    pub members: BTreeSet<AccountId>,
}

/// Seconds shared by two sorted, non-overlapping interval lists.
pub fn shared_secs(a: &[BurstInterval], b: &[BurstInterval]) -> i64 {
    let (mut i, mut j, mut total) = (0, 0, 0i64);
    while i < a.len() && j < b.len() {
        let start = a[i].start.max(b[j].start);
        let end = a[i].end.min(b[j].end);
        if end > start {
            total += (end - start).num_seconds();
        }
        if a[i].end <= b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    total
}

pub fn overlap_fraction(a: &BurstProfile, b: &BurstProfile) -> f64 {
    let shorter = a.burst_secs().min(b.burst_secs());
    if shorter <= 0 {
        return 0.0;
    }
    shared_secs(&a.intervals, &b.intervals) as f64 / shorter as f64
}

pub(crate) fn synchronized_groups<'a>(
    profiles: impl Iterator<Item = &'a BurstProfile>,
    min_overlap: f64,
) -> Vec<SyncGroup> {
    // profiles arrive in account id order
    let bursting: Vec<&BurstProfile> = profiles.filter(|p| p.is_bursting()).collect();
    let mut uf = UnionFind::<usize>::new(bursting.len());
    for i in 0..bursting.len() {
        for j in i + 1..bursting.len() {
            let frac = overlap_fraction(bursting[i], bursting[j]);
            if frac > 0.0 && frac >= min_overlap {
                uf.union(i, j);
            }
        }
    }

    let mut by_root: BTreeMap<usize, BTreeSet<AccountId>> = BTreeMap::new();
    for (i, p) in bursting.iter().enumerate() {
        by_root.entry(uf.find(i)).or_default().insert(p.account_id.clone());
    }
    let mut groups: Vec<BTreeSet<AccountId>> =
        by_root.into_values().filter(|m| m.len() >= 2).collect();
    groups.sort_by(|a, b| a.first().cmp(&b.first()));

    groups
        .into_iter()
        .enumerate()
        .map(|(id, members)| SyncGroup { id: id as u32, members })
        .collect()
}
