//! Per-topic admission thresholds, frozen after the first bootstrap.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use scicurate_ingestion::Record;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{read_json, write_json_atomic};

pub const THRESHOLDS_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicThresholds {
    pub version: u32,
    pub percentile: f64,
    pub computed_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub thresholds: BTreeMap<String, f64>,
}

/// Linear interpolation between closest ranks. `sorted` must be ascending.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

impl TopicThresholds {
    /// Percentile of reliability totals per primary topic.
    pub fn compute(records: &[Record], p: f64, run_id: Uuid) -> Self {
        let mut totals: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for r in records {
            totals.entry(r.primary_topic.clone()).or_default().push(r.reliability.total());
        }
        let thresholds = totals
            .into_iter()
            .filter_map(|(topic, mut values)| {
                values.sort_by(f64::total_cmp);
                percentile(&values, p).map(|t| (topic, t))
            })
            .collect();

        Self { version: THRESHOLDS_VERSION, percentile: p, computed_at: Utc::now(), run_id, thresholds }
    }

    pub fn get(&self, topic: &str) -> Option<f64> {
        self.thresholds.get(topic).copied()
    }

    pub async fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        read_json(path).await
    }

    /// Writes only when no thresholds file exists yet. Returns whether it wrote.
    pub async fn save_if_absent(&self, path: &Path) -> anyhow::Result<bool> {
        if tokio::fs::try_exists(path).await? {
            info!(path = %path.display(), "Topic thresholds already frozen, not recomputing");
            return Ok(false);
        }
        write_json_atomic(path, self).await?;
        info!(topics = self.thresholds.len(), percentile = self.percentile, "Topic thresholds written");
        Ok(true)
    }
}
