//! Protected quota: records the selector may never eliminate.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use scicurate_ingestion::models::Record;

/// Strongest first: base reliability descending, newer first, then id.
pub fn strength_order(a: &Record, b: &Record) -> Ordering {
    b.reliability
        .base()
        .total_cmp(&a.reliability.base())
        .then_with(|| b.effective_date().cmp(&a.effective_date()))
        .then_with(|| a.id.cmp(&b.id))
}

fn top_k<'a>(groups: BTreeMap<String, Vec<&'a Record>>, k: usize, out: &mut BTreeSet<String>) {
    for (_, mut members) in groups {
        members.sort_by(|a, b| strength_order(a, b));
        out.extend(members.into_iter().take(k).map(|r| r.id.clone()));
    }
}

/// Top `per_topic` of every primary topic, united with the top `per_pair` of
/// every topic×goal pair.
pub fn protected_set(pool: &[Record], per_topic: usize, per_pair: usize) -> BTreeSet<String> {
    let mut by_topic: BTreeMap<String, Vec<&Record>> = BTreeMap::new();
    let mut by_pair: BTreeMap<String, Vec<&Record>> = BTreeMap::new();

    for r in pool {
        by_topic.entry(r.primary_topic.clone()).or_default().push(r);
        for goal in &r.goals {
            by_pair.entry(format!("{}\u{1f}{}", r.primary_topic, goal)).or_default().push(r);
        }
    }

    let mut protected = BTreeSet::new();
    top_k(by_topic, per_topic, &mut protected);
    top_k(by_pair, per_pair, &mut protected);
    protected
}
