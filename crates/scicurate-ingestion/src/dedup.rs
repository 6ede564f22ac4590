//! Deduplication of harvested records.
//!
//! Stage 1: identifier. A record reached by several topic queries appears
//! once, carrying the union of its topic tags.
//! Stage 2: DOI exact match (after normalisation). The first record seen
//! wins; later ones are dropped with a reason.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::harvester::TopicHarvest;
use crate::models::Record;

/// Result of a deduplication check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupResult {
    New,
    /// Same identifier already accepted; topics were merged into it.
    DuplicateId(String),
    /// Different identifier, same DOI as an accepted record.
    DuplicateDoi { doi: String, existing_id: String },
}

impl DedupResult {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::DuplicateId(_) => "duplicate_id",
            Self::DuplicateDoi { .. } => "duplicate_doi",
        }
    }
}

/// Lowercased DOI without resolver prefix.
pub fn normalise_doi(doi: &str) -> String {
    let d = doi.trim().to_lowercase();
    ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "doi:"]
        .iter()
        .find_map(|p| d.strip_prefix(p))
        .map(str::to_string)
        .unwrap_or(d)
}

/// Topic tags per identifier across all topic harvests.
pub fn merge_topic_tags(harvests: &[TopicHarvest]) -> BTreeMap<String, BTreeSet<String>> {
    let mut tags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for h in harvests {
        for id in &h.ids {
            tags.entry(id.clone()).or_default().insert(h.topic.clone());
        }
    }
    tags
}

#[derive(Debug, Default)]
pub struct Deduplicator {
    by_id: HashMap<String, usize>,
    by_doi: HashMap<String, String>,
    accepted: Vec<Record>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the index with records already in the corpus, so they win.
    pub fn with_existing<'a>(existing: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut d = Self::new();
        for r in existing {
            if let Some(doi) = &r.doi {
                d.by_doi.entry(normalise_doi(doi)).or_insert_with(|| r.id.clone());
            }
            d.by_id.insert(r.id.clone(), usize::MAX);
        }
        d
    }

    pub fn check(&self, record: &Record) -> DedupResult {
        if self.by_id.contains_key(&record.id) {
            return DedupResult::DuplicateId(record.id.clone());
        }
        if let Some(doi) = &record.doi {
            let key = normalise_doi(doi);
            if let Some(existing) = self.by_doi.get(&key) {
                return DedupResult::DuplicateDoi { doi: key, existing_id: existing.clone() };
            }
        }
        DedupResult::New
    }

    /// Accepts `record` unless it duplicates one already accepted.
    pub fn push(&mut self, record: Record) -> DedupResult {
        let result = self.check(&record);
        match &result {
            DedupResult::New => {
                if let Some(doi) = &record.doi {
                    self.by_doi.insert(normalise_doi(doi), record.id.clone());
                }
                self.by_id.insert(record.id.clone(), self.accepted.len());
                self.accepted.push(record);
            }
            DedupResult::DuplicateId(_) => {
                if let Some(&idx) = self.by_id.get(&record.id) {
                    if let Some(kept) = self.accepted.get_mut(idx) {
                        kept.topics.extend(record.topics);
                    }
                }
            }
            DedupResult::DuplicateDoi { .. } => {}
        }
        result
    }

    pub fn into_records(self) -> Vec<Record> {
        self.accepted
    }
}

/// Deduplicates `records`, returning survivors and per-reason drop counts.
pub fn dedup_records(records: Vec<Record>) -> (Vec<Record>, BTreeMap<&'static str, usize>) {
    let mut d = Deduplicator::new();
    let mut dropped: BTreeMap<&'static str, usize> = BTreeMap::new();
    for r in records {
        let result = d.push(r);
        if result != DedupResult::New {
            *dropped.entry(result.reason_code()).or_default() += 1;
        }
    }
    (d.into_records(), dropped)
}
