//! Heuristic reliability scoring.
//!
//! The reliability score is a sum of independently computed components, each
//! driven by a declarative table so a score can be explained line by line:
//!
//! | component        | range      | source                                   |
//! |------------------|------------|------------------------------------------|
//! | design           | 1 – 12     | [`DESIGN_POINTS`], highest tier          |
//! | sample_size      | 0 – 5      | [`SAMPLE_SIZE_BUCKETS`] over free text   |
//! | quality_keywords | 0 – n      | +1 per [`QUALITY_KEYWORDS`] match         |
//! | venue            | 0 or 2     | curated allow-list                       |
//! | recency          | 0, 0.5, 1  | years since publication                  |
//! | representation   | −3 – +3    | primary-topic share of the current pool  |
//!
//! The representation component is a pre-selection signal only; the diversity
//! selector works from [`ReliabilityScore::base`], which excludes it.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{Record, StudyDesign};

pub const DESIGN_POINTS: &[(StudyDesign, f64)] = &[
    (StudyDesign::MetaAnalysis,    12.0),
    (StudyDesign::ControlledTrial,  9.0),
    (StudyDesign::Cohort,           6.0),
    (StudyDesign::CaseControl,      4.0),
    (StudyDesign::CrossSectional,   3.0),
    (StudyDesign::CaseReport,       2.0),
    (StudyDesign::Other,            1.0),
];

/// (minimum participants, points), checked top-down.
pub const SAMPLE_SIZE_BUCKETS: &[(u64, f64)] = &[
    (1000, 5.0),
    (500,  4.0),
    (100,  3.0),
    (50,   2.0),
    (20,   1.0),
];

/// (label, pattern). Each matching label adds one point.
pub const QUALITY_KEYWORDS: &[(&str, &str)] = &[
    ("double_blind",          r"double[- ]blind"),
    ("placebo_controlled",    r"placebo[- ]controlled"),
    ("randomized",            r"\brandomi[sz]ed\b"),
    ("systematic_review",     r"systematic review"),
    ("meta_analysis",         r"meta[- ]?analys[ie]s"),
    ("intention_to_treat",    r"intention[- ]to[- ]treat"),
    ("multicenter",           r"multi[- ]?cent(?:er|re)"),
    ("prospective",           r"\bprospective(?:ly)?\b"),
    ("preregistered",         r"pre[- ]?registered|clinicaltrials\.gov|\bNCT\d{8}\b"),
    ("allocation_concealment", r"allocation concealment"),
    ("triple_blind",          r"triple[- ]blind"),
    ("crossover",             r"cross[- ]?over design"),
];

lazy_static! {
    static ref QUALITY_REGEXES: Vec<(&'static str, Regex)> = QUALITY_KEYWORDS
        .iter()
        .map(|(label, pat)| (*label, Regex::new(&format!("(?i){pat}")).expect("static pattern")))
        .collect();

    /// "n = 245", "N=1,024"
    static ref N_EQUALS: Regex = Regex::new(r"(?i)\bn\s*=\s*(\d{1,3}(?:,\d{3})+|\d+)").expect("static pattern");

    /// "1,024 participants", "245 healthy adults"
    static ref COUNTED_NOUN: Regex = Regex::new(
        r"(?i)\b(\d{1,3}(?:,\d{3})+|\d+)\s+(?:[a-z-]+\s+){0,2}(?:participants|patients|subjects|individuals|adults|children|women|men|volunteers|athletes|people|persons|respondents)\b"
    ).expect("static pattern");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Records whose total reliability is below this leave the candidate pool.
    #[serde(default = "default_quality_floor")]
    pub quality_floor: f64,
    /// Case-insensitive substrings; a matching venue earns the venue bonus.
    #[serde(default = "default_venue_allowlist")]
    pub venue_allowlist: Vec<String>,
    #[serde(default = "default_recent_years")]
    pub recent_years: i32,
    #[serde(default = "default_older_years")]
    pub older_years: i32,
}

fn default_quality_floor() -> f64 { 4.0 }
fn default_recent_years()  -> i32 { 5 }
fn default_older_years()   -> i32 { 10 }

fn default_venue_allowlist() -> Vec<String> {
    [
        "lancet", "new england journal of medicine", "jama", "bmj",
        "cochrane database of systematic reviews", "nature medicine",
        "annals of internal medicine", "plos medicine",
        "american journal of clinical nutrition", "british journal of sports medicine",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            quality_floor: default_quality_floor(),
            venue_allowlist: default_venue_allowlist(),
            recent_years: default_recent_years(),
            older_years: default_older_years(),
        }
    }
}

/// Componentised reliability score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityScore {
    pub design: f64,
    pub sample_size: f64,
    pub quality_keywords: f64,
    pub venue: f64,
    pub recency: f64,
    pub representation: f64,
    pub detected_sample_size: Option<u64>,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
}

impl ReliabilityScore {
    pub fn total(&self) -> f64 {
        self.base() + self.representation
    }

    /// Everything except the representation nudge.
    pub fn base(&self) -> f64 {
        self.design + self.sample_size + self.quality_keywords + self.venue + self.recency
    }
}

/// Deterministic scorer. `reference_date` anchors the recency component so the
/// same record scores the same on every run day inside one run.
#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    config: ScoringConfig,
    venue_allowlist: Vec<String>,
    reference_date: NaiveDate,
}

impl HeuristicScorer {
    pub fn new(config: ScoringConfig, reference_date: NaiveDate) -> Self {
        let venue_allowlist = config.venue_allowlist.iter().map(|v| v.to_lowercase()).collect();
        Self { config, venue_allowlist, reference_date }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, record: &Record) -> ReliabilityScore {
        let text = format!("{} {}", record.title, record.abstract_text);

        let design = DESIGN_POINTS
            .iter()
            .find(|(d, _)| *d == record.design)
            .map(|(_, p)| *p)
            .unwrap_or(1.0);

        let detected_sample_size = extract_sample_size(&text);
        let sample_size = detected_sample_size.map(sample_size_points).unwrap_or(0.0);

        let matched_keywords: Vec<String> = QUALITY_REGEXES
            .iter()
            .filter(|(_, re)| re.is_match(&text))
            .map(|(label, _)| label.to_string())
            .collect();

        let venue = match record.venue.as_deref() {
            Some(v) => {
                let v = v.to_lowercase();
                if self.venue_allowlist.iter().any(|a| v.contains(a.as_str())) { 2.0 } else { 0.0 }
            }
            None => 0.0,
        };

        ReliabilityScore {
            design,
            sample_size,
            quality_keywords: matched_keywords.len() as f64,
            venue,
            recency: self.recency_points(record),
            representation: 0.0,
            detected_sample_size,
            matched_keywords,
        }
    }

    fn recency_points(&self, record: &Record) -> f64 {
        let Some(year) = record.year else { return 0.0 };
        let age = self.reference_date.year() - year;
        if age <= self.config.recent_years {
            1.0
        } else if age <= self.config.older_years {
            0.5
        } else {
            0.0
        }
    }

    /// Scores every record in place.
    pub fn score_all(&self, records: &mut [Record]) {
        for r in records.iter_mut() {
            r.reliability = self.score(r);
        }
    }
}

/// Largest plausible participant count mentioned in the text.
pub fn extract_sample_size(text: &str) -> Option<u64> {
    N_EQUALS
        .captures_iter(text)
        .chain(COUNTED_NOUN.captures_iter(text))
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().replace(',', "").parse::<u64>().ok())
        .filter(|n| *n > 0 && *n < 100_000_000)
        .max()
}

pub fn sample_size_points(n: u64) -> f64 {
    SAMPLE_SIZE_BUCKETS
        .iter()
        .find(|(min, _)| n >= *min)
        .map(|(_, p)| *p)
        .unwrap_or(0.0)
}

/// Nudge for a topic whose pool share is `ratio` times the even share.
pub fn representation_nudge(ratio: f64) -> f64 {
    if ratio > 3.0 {
        -3.0
    } else if ratio > 2.0 {
        -1.5
    } else if ratio < 0.5 {
        3.0
    } else if ratio < 1.0 {
        1.5
    } else {
        0.0
    }
}

/// Sets the representation component of every record from the primary-topic
/// distribution of `records` itself.
pub fn apply_representation_adjustment(records: &mut [Record]) {
    if records.is_empty() {
        return;
    }
    let mut counts: HashMap<String, usize> = HashMap::new();
    for r in records.iter() {
        *counts.entry(r.primary_topic.clone()).or_default() += 1;
    }
    let expected = records.len() as f64 / counts.len() as f64;
    for r in records.iter_mut() {
        let observed = counts.get(&r.primary_topic).copied().unwrap_or(0) as f64;
        r.reliability.representation = representation_nudge(observed / expected);
    }
}

/// Splits records into (passing, rejected) against the quality floor on the
/// total reliability score.
pub fn apply_quality_floor(records: Vec<Record>, floor: f64) -> (Vec<Record>, Vec<Record>) {
    records.into_iter().partition(|r| r.reliability.total() >= floor)
}
