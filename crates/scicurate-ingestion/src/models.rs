//! Data models for the curation pipeline.

use std::collections::BTreeSet;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::scoring::ReliabilityScore;

/// Inclusive publication-date range used to bound literature queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end { Self { start, end } } else { Self { start: end, end: start } }
    }

    /// Number of calendar days covered (a single day is 1).
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn is_single_day(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Split at the midpoint into `[start, mid]` and `[mid + 1, end]`.
    /// A single day cannot be split.
    pub fn bisect(&self) -> Option<(DateRange, DateRange)> {
        if self.is_single_day() {
            return None;
        }
        let mid = self.start + Duration::days((self.end - self.start).num_days() / 2);
        Some((
            DateRange { start: self.start, end: mid },
            DateRange { start: mid + Duration::days(1), end: self.end },
        ))
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Study-design category, ordered from strongest to weakest evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyDesign {
    MetaAnalysis,
    ControlledTrial,
    Cohort,
    CaseControl,
    CrossSectional,
    CaseReport,
    Other,
}

impl StudyDesign {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudyDesign::MetaAnalysis    => "meta_analysis",
            StudyDesign::ControlledTrial => "controlled_trial",
            StudyDesign::Cohort          => "cohort",
            StudyDesign::CaseControl     => "case_control",
            StudyDesign::CrossSectional  => "cross_sectional",
            StudyDesign::CaseReport      => "case_report",
            StudyDesign::Other           => "other",
        }
    }

    /// Designs admitted unconditionally by incremental runs.
    pub fn is_high_evidence(&self) -> bool {
        matches!(self, StudyDesign::MetaAnalysis | StudyDesign::ControlledTrial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulltextStatus {
    #[default]
    NotAttempted,
    FulltextWithBody,
    AbstractOnly,
}

impl FulltextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulltextStatus::NotAttempted     => "not_attempted",
            FulltextStatus::FulltextWithBody => "fulltext_with_body",
            FulltextStatus::AbstractOnly     => "abstract_only",
        }
    }
}

/// Where a record's full text lives after resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FulltextPointer {
    pub status: FulltextStatus,
    /// Name of the source that produced the body, if any.
    pub source: Option<String>,
    /// Content-addressed key in the shared full-text store.
    pub store_key: Option<String>,
}

/// A record as returned by the literature database, before normalisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub pmid: Option<String>,
    pub doi: Option<String>,
    pub pmcid: Option<String>,
    pub title: String,
    pub abstract_text: Option<String>,
    pub journal: Option<String>,
    pub pub_year: Option<i32>,
    pub pub_date: Option<NaiveDate>,
    pub publication_types: Vec<String>,
}

/// One candidate publication in the corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// External database identifier (PMID). Unique within a snapshot.
    pub id: String,
    pub doi: Option<String>,
    pub pmcid: Option<String>,
    pub title: String,
    pub venue: Option<String>,
    pub year: Option<i32>,
    pub pub_date: Option<NaiveDate>,
    pub abstract_text: String,
    pub design: StudyDesign,
    pub topics: BTreeSet<String>,
    pub primary_topic: String,
    pub goals: BTreeSet<String>,
    pub populations: BTreeSet<String>,
    #[serde(default)]
    pub publication_types: Vec<String>,
    #[serde(default)]
    pub reliability: ReliabilityScore,
    #[serde(default)]
    pub combination_score: f64,
    #[serde(default)]
    pub fulltext: FulltextPointer,
}

impl Record {
    /// Reliability (without the pre-selection representation nudge) plus the
    /// selector's combination score. Always derived, never stored.
    pub fn composite(&self) -> f64 {
        self.reliability.base() + self.combination_score
    }

    /// Normalised venue used for representation keys.
    pub fn venue_key(&self) -> String {
        self.venue
            .as_deref()
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Best known publication date; falls back to 1 January of the year.
    pub fn effective_date(&self) -> Option<NaiveDate> {
        self.pub_date
            .or_else(|| self.year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_bisect_covers_range_without_overlap() {
        let r = DateRange::new(d(1990, 1, 1), d(2025, 1, 1));
        let (a, b) = r.bisect().unwrap();
        assert_eq!(a.start, r.start);
        assert_eq!(b.end, r.end);
        assert_eq!(a.end.succ_opt().unwrap(), b.start);
        assert_eq!(a.days() + b.days(), r.days());
    }

    #[test]
    fn test_two_day_range_bisects_into_single_days() {
        let r = DateRange::new(d(2020, 5, 1), d(2020, 5, 2));
        let (a, b) = r.bisect().unwrap();
        assert!(a.is_single_day() && b.is_single_day());
        assert!(a.bisect().is_none());
    }

    #[test]
    fn test_new_orders_endpoints() {
        let r = DateRange::new(d(2021, 1, 2), d(2021, 1, 1));
        assert_eq!(r.start, d(2021, 1, 1));
        assert_eq!(r.days(), 2);
    }

    #[test]
    fn test_high_evidence_designs() {
        assert!(StudyDesign::MetaAnalysis.is_high_evidence());
        assert!(StudyDesign::ControlledTrial.is_high_evidence());
        assert!(!StudyDesign::Cohort.is_high_evidence());
    }
}
