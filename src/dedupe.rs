// src/dedupe.rs
//! Deduplicator: collapses normalized items that represent the same underlying
//! request and reports (without removing) fuzzy "repeating request" clusters.
//!
//! Pure function of its input set: any permutation of the same items yields
//! the same surviving set, because winners are chosen through a total order
//! (newest `created_at`, then longer body, then identity) instead of arrival
//! order.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;

use crate::normalize::{title_key, NormalizedItem};

/// Default token-Jaccard threshold for repeating-request detection.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;
/// Titles this close by normalized Levenshtein also link a cluster, catching
/// near-identical phrasings whose token sets diverge.
const NEAR_IDENTICAL_TITLE: f64 = 0.90;

/// A group of distinct surviving items whose titles are similar enough to look
/// like the same request coming back. Reported, never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatCluster {
    pub identities: Vec<String>,
    pub titles: Vec<String>,
    /// Highest pairwise similarity observed inside the cluster.
    pub similarity: f32,
}

#[derive(Debug, Clone)]
pub struct DedupeOutcome {
    pub survivors: Vec<NormalizedItem>,
    pub removed: usize,
    pub repeats: Vec<RepeatCluster>,
}

/// `true` when `a` should replace `b` as the surviving copy.
/// Latest `created_at` wins; ties go to the longer body (more complete
/// record); the identity ordering is a final deterministic tie-break.
fn wins(a: &NormalizedItem, b: &NormalizedItem) -> bool {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.body.chars().count().cmp(&b.body.chars().count()))
        .then_with(|| b.identity.cmp(&a.identity))
        .is_gt()
}

/// Collapse exact duplicates (equal identity, or equal normalized title across
/// the merged cross-source batch) and report fuzzy repeat clusters among the
/// survivors.
pub fn dedupe(items: Vec<NormalizedItem>, similarity_threshold: f32) -> DedupeOutcome {
    let total = items.len();

    // Identity hashing and title grouping share `title_key`, so identity
    // equality can never disagree with the title rule. Items with an empty
    // title key group by identity alone.
    let mut groups: BTreeMap<String, NormalizedItem> = BTreeMap::new();
    for item in items {
        let key = {
            let tk = title_key(&item.title);
            if tk.is_empty() {
                format!("id:{}", item.identity)
            } else {
                format!("title:{tk}")
            }
        };
        match groups.entry(key) {
            Entry::Occupied(mut e) => {
                if wins(&item, e.get()) {
                    e.insert(item);
                }
            }
            Entry::Vacant(e) => {
                e.insert(item);
            }
        }
    }

    let mut survivors: Vec<NormalizedItem> = groups.into_values().collect();
    survivors.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.identity.cmp(&b.identity))
    });

    let repeats = find_repeat_clusters(&survivors, similarity_threshold);

    DedupeOutcome {
        removed: total - survivors.len(),
        survivors,
        repeats,
    }
}

/// Jaccard similarity over the title-key token sets.
fn token_jaccard(a: &str, b: &str) -> f32 {
    let sa: BTreeSet<&str> = a.split_whitespace().collect();
    let sb: BTreeSet<&str> = b.split_whitespace().collect();
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    inter as f32 / union as f32
}

fn find_repeat_clusters(survivors: &[NormalizedItem], threshold: f32) -> Vec<RepeatCluster> {
    let keys: Vec<String> = survivors.iter().map(|s| title_key(&s.title)).collect();

    // Union-find over survivor indices.
    let mut parent: Vec<usize> = (0..survivors.len()).collect();
    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        if parent[i] != i {
            let root = find(parent, parent[i]);
            parent[i] = root;
        }
        parent[i]
    }

    let mut pair_sim: BTreeMap<(usize, usize), f32> = BTreeMap::new();
    for i in 0..survivors.len() {
        for j in (i + 1)..survivors.len() {
            if keys[i].is_empty() || keys[j].is_empty() {
                continue;
            }
            let jac = token_jaccard(&keys[i], &keys[j]);
            let lev = normalized_levenshtein(&keys[i], &keys[j]) as f32;
            let sim = jac.max(lev);
            if jac >= threshold || lev >= NEAR_IDENTICAL_TITLE as f32 {
                pair_sim.insert((i, j), sim);
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..survivors.len() {
        let root = find(&mut parent, i);
        clusters.entry(root).or_default().push(i);
    }

    clusters
        .into_values()
        .filter(|members| members.len() >= 2)
        .map(|members| {
            let similarity = pair_sim
                .iter()
                .filter(|((i, j), _)| members.contains(i) && members.contains(j))
                .map(|(_, s)| *s)
                .fold(0.0f32, f32::max);
            RepeatCluster {
                identities: members
                    .iter()
                    .map(|&i| survivors[i].identity.clone())
                    .collect(),
                titles: members.iter().map(|&i| survivors[i].title.clone()).collect(),
                similarity,
            }
        })
        .collect()
}
