//! Incremental-update watermark.

use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use scicurate_ingestion::{DateRange, HarvestGap};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{read_json, write_json_atomic};

pub const WATERMARK_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub version: u32,
    /// Harvests of the next monthly run start here.
    pub date: NaiveDate,
    pub updated_at: DateTime<Utc>,
    pub run_id: Uuid,
}

/// Newest observed publication date minus the overlap window.
pub fn candidate_date(max_observed: NaiveDate, overlap_days: i64) -> NaiveDate {
    max_observed - Duration::days(overlap_days.max(0))
}

/// Latest date the watermark may cover after a run over `span` that left
/// `gaps`, or `None` when nothing was skipped.
///
/// A dated gap caps it at the day before the earliest gap start. A gap with no
/// range (a failed record batch) could hide any date, so it holds the cap at
/// the start of the span.
pub fn gap_ceiling(gaps: &[HarvestGap], span: DateRange) -> Option<NaiveDate> {
    gaps.iter()
        .map(|g| match g.range {
            Some(r) => (r.start - Duration::days(1)).max(span.start),
            None => span.start,
        })
        .min()
}

impl Watermark {
    pub async fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        read_json(path).await
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        write_json_atomic(path, self).await
    }

    /// The watermark after a run that observed `max_observed`, never past
    /// `ceiling`. A candidate older than `previous` leaves the date where it was.
    pub fn advance(
        previous: Option<&Watermark>,
        max_observed: NaiveDate,
        overlap_days: i64,
        ceiling: Option<NaiveDate>,
        run_id: Uuid,
    ) -> Watermark {
        let mut candidate = candidate_date(max_observed, overlap_days);
        if let Some(limit) = ceiling.filter(|limit| *limit < candidate) {
            warn!(%candidate, %limit, "Harvest gaps hold the watermark back");
            candidate = limit;
        }
        let date = match previous {
            Some(prev) if prev.date > candidate => {
                warn!(previous = %prev.date, %candidate, "Watermark candidate is older, keeping previous date");
                prev.date
            }
            _ => candidate,
        };
        info!(%date, %max_observed, overlap_days, "Watermark advanced");
        Watermark { version: WATERMARK_VERSION, date, updated_at: Utc::now(), run_id }
    }
}
