//! Per-run manifest, rewritten after every stage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use scicurate_ingestion::fulltext::ResolveSummary;
use scicurate_ingestion::{DateRange, HarvestGap};
use scicurate_selector::RoundReport;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::admission::AdmissionCounts;
use super::{read_json, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Bootstrap,
    Monthly,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunMode::Bootstrap => "bootstrap",
            RunMode::Monthly => "monthly",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Started,
    Harvested,
    Fetched,
    Scored,
    Selected,
    Resolving,
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCounters {
    pub harvested_ids: usize,
    pub fetched: usize,
    pub parsed: usize,
    pub duplicates: usize,
    pub floor_rejected: usize,
    pub candidates: usize,
    pub selected: usize,
    pub admission: Option<AdmissionCounts>,
    pub merged_new: usize,
    pub snapshot_records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncatedLeaf {
    pub topic: String,
    pub range: DateRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub status: RunStatus,
    pub stage: Stage,
    pub span: Option<DateRange>,
    pub watermark_before: Option<NaiveDate>,
    pub watermark_after: Option<NaiveDate>,
    pub counters: StageCounters,
    /// Harvested IDs per topic, before deduplication.
    pub per_topic: BTreeMap<String, usize>,
    /// Discarded records per reason code.
    pub rejections: BTreeMap<String, usize>,
    pub gaps: Vec<HarvestGap>,
    pub truncated_leaves: Vec<TruncatedLeaf>,
    pub completed_leaves: usize,
    pub resumed_leaves: usize,
    pub rounds: Vec<RoundReport>,
    pub fulltext: ResolveSummary,
    pub snapshot_path: Option<PathBuf>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunManifest {
    pub fn new(run_id: Uuid, mode: RunMode) -> Self {
        Self {
            run_id,
            mode,
            status: RunStatus::Running,
            stage: Stage::Started,
            span: None,
            watermark_before: None,
            watermark_after: None,
            counters: StageCounters::default(),
            per_topic: BTreeMap::new(),
            rejections: BTreeMap::new(),
            gaps: Vec::new(),
            truncated_leaves: Vec::new(),
            completed_leaves: 0,
            resumed_leaves: 0,
            rounds: Vec::new(),
            fulltext: ResolveSummary::default(),
            snapshot_path: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn reject(&mut self, reason: &str, n: usize) {
        if n > 0 {
            *self.rejections.entry(reason.to_string()).or_default() += n;
        }
    }

    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.stage = Stage::Finished;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &anyhow::Error) {
        self.status = RunStatus::Failed;
        self.error = Some(format!("{error:#}"));
        self.finished_at = Some(Utc::now());
    }

    pub async fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        read_json(path).await
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        write_json_atomic(path, self).await
    }
}
