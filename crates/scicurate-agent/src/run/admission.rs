//! Three-tier admission of newly published records into an existing corpus.
//!
//! Tier 1 admits high-evidence designs and the newest records of every topic
//! regardless of score. Tier 2 admits records at or above their topic's frozen
//! threshold and the quality floor. Everything else is rejected.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use scicurate_ingestion::Record;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::thresholds::TopicThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Priority,
    Threshold,
    Rejected,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionCounts {
    pub priority: usize,
    pub threshold: usize,
    pub rejected: usize,
}

pub struct AdmissionFilter<'a> {
    thresholds: &'a TopicThresholds,
    floor: f64,
    recent_per_topic: usize,
}

impl<'a> AdmissionFilter<'a> {
    pub fn new(thresholds: &'a TopicThresholds, floor: f64, recent_per_topic: usize) -> Self {
        Self { thresholds, floor, recent_per_topic }
    }

    /// IDs of the `recent_per_topic` newest dated records of each primary topic.
    fn recent_ids(&self, batch: &[Record]) -> BTreeSet<String> {
        let mut by_topic: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
        for r in batch.iter().filter(|r| r.effective_date().is_some()) {
            by_topic.entry(r.primary_topic.as_str()).or_default().push(r);
        }
        by_topic
            .into_values()
            .flat_map(|mut members| {
                members.sort_by_key(|r| (Reverse(r.effective_date()), r.id.clone()));
                members.into_iter().take(self.recent_per_topic).map(|r| r.id.clone())
            })
            .collect()
    }

    /// A topic without a frozen threshold falls back to the floor.
    fn threshold_for(&self, topic: &str) -> f64 {
        self.thresholds.get(topic).unwrap_or(self.floor).max(self.floor)
    }

    fn tier(&self, record: &Record, recent: &BTreeSet<String>) -> Tier {
        if record.design.is_high_evidence() || recent.contains(&record.id) {
            Tier::Priority
        } else if record.reliability.total() >= self.threshold_for(&record.primary_topic) {
            Tier::Threshold
        } else {
            Tier::Rejected
        }
    }

    /// Splits `batch` into admitted records and per-tier counts.
    pub fn admit(&self, batch: Vec<Record>) -> (Vec<Record>, AdmissionCounts) {
        let recent = self.recent_ids(&batch);
        let mut counts = AdmissionCounts::default();
        let mut admitted = Vec::new();
        for r in batch {
            let tier = self.tier(&r, &recent);
            debug!(id = %r.id, ?tier, total = r.reliability.total(), "Admission");
            match tier {
                Tier::Priority => counts.priority += 1,
                Tier::Threshold => counts.threshold += 1,
                Tier::Rejected => {
                    counts.rejected += 1;
                    continue;
                }
            }
            admitted.push(r);
        }
        (admitted, counts)
    }
}
