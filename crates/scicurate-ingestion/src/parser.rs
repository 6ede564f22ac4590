//! Normalisation of raw database records into [`Record`]s.
//!
//! Classification (study design, goals, populations) is driven by the
//! declarative keyword tables below, matched against lower-cased title,
//! abstract and publication types.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::models::{FulltextPointer, RawRecord, Record, StudyDesign};
use crate::scoring::ReliabilityScore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("record has no external identifier")]
    MissingId,
    #[error("record {0} has no title")]
    MissingTitle(String),
    #[error("record {0} has no abstract; quality cannot be assessed")]
    MissingContent(String),
    #[error("record {0} matched no configured topic")]
    NoTopic(String),
}

impl ParseError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ParseError::MissingId         => "missing_id",
            ParseError::MissingTitle(_)   => "missing_title",
            ParseError::MissingContent(_) => "missing_content",
            ParseError::NoTopic(_)        => "no_topic",
        }
    }
}

/// Design tiers, strongest first. The first tier with a matching phrase wins.
const DESIGN_PATTERNS: &[(StudyDesign, &[&str])] = &[
    (StudyDesign::MetaAnalysis, &["meta-analysis", "meta analysis", "metaanalysis", "systematic review", "pooled analysis"]),
    (StudyDesign::ControlledTrial, &["randomized controlled trial", "randomised controlled trial", "controlled clinical trial", "clinical trial", "randomized trial", "randomised trial", "crossover trial", "cross-over trial"]),
    (StudyDesign::Cohort, &["cohort", "longitudinal study", "prospective study", "follow-up study"]),
    (StudyDesign::CaseControl, &["case-control", "case control"]),
    (StudyDesign::CrossSectional, &["cross-sectional", "cross sectional", "survey study"]),
    (StudyDesign::CaseReport, &["case report", "case series"]),
];

/// Research-goal tags.
const GOAL_PATTERNS: &[(&str, &[&str])] = &[
    ("treatment", &["treatment", "therapy", "therapeutic", "efficacy", "supplementation", "intervention"]),
    ("prevention", &["prevention", "preventive", "prophyla", "risk reduction", "incidence"]),
    ("diagnosis", &["diagnos", "screening", "detection", "biomarker"]),
    ("prognosis", &["prognos", "mortality", "survival", "predictor"]),
    ("mechanism", &["mechanism", "pathway", "pathophysiolog", "metabolism"]),
    ("performance", &["performance", "strength", "endurance", "exercise capacity"]),
    ("safety", &["safety", "adverse event", "side effect", "toxicity"]),
];

/// Study-population tags.
const POPULATION_PATTERNS: &[(&str, &[&str])] = &[
    ("children", &["child", "pediatric", "paediatric", "adolescent", "infant"]),
    ("older_adults", &["older adult", "elderly", "aged 65", "geriatric", "older people"]),
    ("women", &["women", "female", "pregnan", "postmenopausal"]),
    ("men", &[" men ", "male participants"]),
    ("athletes", &["athlete", "sportsmen", "trained individuals"]),
    ("patients", &["patients"]),
    ("adults", &["adults", "healthy volunteers"]),
];

const UNTAGGED: &str = "general";

/// Converts raw records into normalised, classified [`Record`]s.
#[derive(Debug, Clone)]
pub struct RecordParser {
    topic_order: Vec<String>,
}

impl RecordParser {
    /// `topic_order` decides the primary topic of multi-topic records.
    pub fn new(topic_order: Vec<String>) -> Self {
        Self { topic_order }
    }

    pub fn parse(&self, raw: RawRecord, topics: &BTreeSet<String>) -> Result<Record, ParseError> {
        let id = raw
            .pmid
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ParseError::MissingId)?;

        let title = normalize_ws(&raw.title);
        if title.is_empty() {
            return Err(ParseError::MissingTitle(id));
        }

        let abstract_text = raw.abstract_text.as_deref().map(normalize_ws).unwrap_or_default();
        if abstract_text.is_empty() {
            return Err(ParseError::MissingContent(id));
        }

        let primary_topic = self
            .topic_order
            .iter()
            .find(|t| topics.contains(*t))
            .or_else(|| topics.iter().next())
            .cloned()
            .ok_or_else(|| ParseError::NoTopic(id.clone()))?;

        let haystack = format!(
            " {} {} {} ",
            title.to_lowercase(),
            abstract_text.to_lowercase(),
            raw.publication_types.join(" ").to_lowercase()
        );

        let year = raw.pub_date.map(|d| chrono::Datelike::year(&d)).or(raw.pub_year);

        Ok(Record {
            id,
            doi: raw.doi.map(|d| d.trim().to_lowercase()).filter(|d| !d.is_empty()),
            pmcid: raw.pmcid.map(|p| p.trim().to_uppercase()).filter(|p| !p.is_empty()),
            title,
            venue: raw.journal.map(|j| normalize_ws(&j)).filter(|j| !j.is_empty()),
            year,
            pub_date: raw.pub_date,
            abstract_text,
            design: classify_design(&haystack),
            topics: topics.clone(),
            primary_topic,
            goals: tag_set(&haystack, GOAL_PATTERNS),
            populations: tag_set(&haystack, POPULATION_PATTERNS),
            publication_types: raw.publication_types,
            reliability: ReliabilityScore::default(),
            combination_score: 0.0,
            fulltext: FulltextPointer::default(),
        })
    }
}

/// Highest design tier whose phrases occur in the lower-cased text.
pub fn classify_design(haystack: &str) -> StudyDesign {
    DESIGN_PATTERNS
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| haystack.contains(p)))
        .map(|(design, _)| *design)
        .unwrap_or(StudyDesign::Other)
}

fn tag_set(haystack: &str, table: &[(&str, &[&str])]) -> BTreeSet<String> {
    let mut tags: BTreeSet<String> = table
        .iter()
        .filter(|(_, phrases)| phrases.iter().any(|p| haystack.contains(p)))
        .map(|(tag, _)| tag.to_string())
        .collect();
    if tags.is_empty() {
        tags.insert(UNTAGGED.to_string());
    }
    tags
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn raw(pmid: &str, title: &str, abstract_text: Option<&str>) -> RawRecord {
        RawRecord {
            pmid: Some(pmid.to_string()),
            title: title.to_string(),
            abstract_text: abstract_text.map(String::from),
            journal: Some("  Journal of  Nutrition ".to_string()),
            pub_date: NaiveDate::from_ymd_opt(2021, 6, 3),
            ..Default::default()
        }
    }

    fn topics(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_classifies_design_goals_and_populations() {
        let parser = RecordParser::new(vec!["creatine".into(), "sleep".into()]);
        let r = parser
            .parse(
                raw("1", "Creatine supplementation in older adults: a randomized controlled trial",
                    Some("We randomized 120 older adults to creatine or placebo to improve strength.")),
                &topics(&["sleep", "creatine"]),
            )
            .unwrap();
        assert_eq!(r.design, StudyDesign::ControlledTrial);
        assert_eq!(r.primary_topic, "creatine");
        assert!(r.goals.contains("treatment"));
        assert!(r.goals.contains("performance"));
        assert!(r.populations.contains("older_adults"));
        assert_eq!(r.venue.as_deref(), Some("Journal of Nutrition"));
        assert_eq!(r.year, Some(2021));
    }

    #[test]
    fn test_highest_design_tier_wins() {
        let text = " a systematic review and meta-analysis of randomized controlled trials and cohort studies ";
        assert_eq!(classify_design(text), StudyDesign::MetaAnalysis);
        assert_eq!(classify_design(" an observational cohort "), StudyDesign::Cohort);
        assert_eq!(classify_design(" a narrative essay "), StudyDesign::Other);
    }

    #[test]
    fn test_missing_abstract_is_rejected() {
        let parser = RecordParser::new(vec!["x".into()]);
        let err = parser.parse(raw("7", "Title", Some("   ")), &topics(&["x"])).unwrap_err();
        assert_eq!(err, ParseError::MissingContent("7".into()));
        assert_eq!(err.reason_code(), "missing_content");
    }

    #[test]
    fn test_missing_id_and_title() {
        let parser = RecordParser::new(vec!["x".into()]);
        let mut r = raw("", "Title", Some("abs"));
        r.pmid = Some(" ".into());
        assert_eq!(parser.parse(r, &topics(&["x"])).unwrap_err(), ParseError::MissingId);
        assert_eq!(
            parser.parse(raw("9", "", Some("abs")), &topics(&["x"])).unwrap_err().reason_code(),
            "missing_title"
        );
    }

    #[test]
    fn test_untagged_records_get_general_tags() {
        let parser = RecordParser::new(vec!["x".into()]);
        let r = parser.parse(raw("3", "On things", Some("Some words.")), &topics(&["x"])).unwrap();
        assert_eq!(r.goals, topics(&["general"]));
        assert_eq!(r.populations, topics(&["general"]));
    }
}
