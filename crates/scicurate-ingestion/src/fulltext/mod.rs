//! Full-text resolution: a prioritized cascade of sources, each result checked
//! for structural completeness, every attempt persisted to the shared store.
//!
//! Cascade order is the order of `sources` given to [`FulltextResolver::new`];
//! the first structurally valid body wins. When nothing qualifies the record
//! is stored abstract-only, which is an expected outcome, not an error.

pub mod extract;
pub mod store;
pub mod validate;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::models::{FulltextPointer, FulltextStatus, Record};
use crate::workers::WorkerPool;
use store::{FulltextRecord, FulltextStore, UpsertOutcome};
use validate::{StructuralValidator, ValidationConfig};

/// Outcome tag of one attempt against one source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptTag {
    Success,
    NoIdentifier,
    NotFound,
    FetchFailed,
    InvalidPdf,
    ExtractionFailed,
    FailedValidation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttempt {
    pub source: String,
    pub tag: AttemptTag,
    pub http_status: Option<u16>,
    pub chars: usize,
    pub detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl SourceAttempt {
    pub fn new(source: &str, tag: AttemptTag) -> Self {
        Self {
            source: source.to_string(),
            tag,
            http_status: None,
            chars: 0,
            detail: None,
            attempted_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.http_status = status;
        self
    }

    pub fn with_chars(mut self, chars: usize) -> Self {
        self.chars = chars;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Maps a terminal fetch error onto an attempt.
    pub fn from_fetch_error(source: &str, err: &scicurate_common::FetchError) -> Self {
        let tag = if err.status == Some(404) { AttemptTag::NotFound } else { AttemptTag::FetchFailed };
        Self::new(source, tag).with_status(err.status).with_detail(err.reason_code())
    }
}

/// What one source produced for one record: its attempts, and a body only
/// when that body passed validation.
#[derive(Debug, Clone, Default)]
pub struct SourceResult {
    pub attempts: Vec<SourceAttempt>,
    pub body: Option<String>,
}

impl SourceResult {
    pub fn single(attempt: SourceAttempt) -> Self {
        Self { attempts: vec![attempt], body: None }
    }

    /// Validates `text` and records the attempt either way.
    pub fn validated(source: &str, text: String, validator: &StructuralValidator) -> Self {
        let v = validator.check(&text);
        if v.valid {
            Self {
                attempts: vec![SourceAttempt::new(source, AttemptTag::Success).with_chars(v.chars)],
                body: Some(text),
            }
        } else {
            let detail = format!("sections={}", v.sections.join(","));
            Self::single(
                SourceAttempt::new(source, AttemptTag::FailedValidation)
                    .with_chars(v.chars)
                    .with_detail(detail),
            )
        }
    }
}

/// One external full-text provider.
#[async_trait]
pub trait FulltextSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, record: &Record, validator: &StructuralValidator) -> SourceResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulltextConfig {
    /// Source names in cascade order.
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
    /// Contact email required by Unpaywall.
    pub unpaywall_email: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default)]
    pub validation: ValidationConfig,
}

fn default_sources() -> Vec<String> {
    vec!["pmc".to_string(), "europepmc".to_string(), "unpaywall".to_string()]
}
fn default_concurrency()    -> usize { 8 }
fn default_max_candidates() -> usize { 6 }

impl Default for FulltextConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            unpaywall_email: None,
            concurrency: default_concurrency(),
            max_candidates: default_max_candidates(),
            validation: ValidationConfig::default(),
        }
    }
}

/// Result of resolving one record.
#[derive(Debug, Clone)]
pub struct FulltextOutcome {
    pub id: String,
    pub status: FulltextStatus,
    pub source: Option<String>,
    /// True when the store already held full text and no source was called.
    pub skipped: bool,
    pub upsert: Option<UpsertOutcome>,
    pub store_key: String,
    pub error: Option<String>,
}

impl FulltextOutcome {
    pub fn pointer(&self) -> FulltextPointer {
        FulltextPointer {
            status: self.status,
            source: self.source.clone(),
            store_key: Some(self.store_key.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveSummary {
    pub attempted: usize,
    pub with_body: usize,
    pub abstract_only: usize,
    pub skipped: usize,
    pub upgraded: usize,
    pub errors: usize,
}

impl ResolveSummary {
    pub fn record(&mut self, o: &FulltextOutcome) {
        if o.skipped {
            self.skipped += 1;
        } else {
            self.attempted += 1;
        }
        match o.status {
            FulltextStatus::FulltextWithBody => self.with_body += 1,
            FulltextStatus::AbstractOnly => self.abstract_only += 1,
            FulltextStatus::NotAttempted => {}
        }
        if o.upsert == Some(UpsertOutcome::Upgraded) {
            self.upgraded += 1;
        }
        if o.error.is_some() {
            self.errors += 1;
        }
    }
}

#[derive(Clone)]
pub struct FulltextResolver {
    sources: Vec<Arc<dyn FulltextSource>>,
    store: Arc<dyn FulltextStore>,
    validator: StructuralValidator,
    concurrency: usize,
}

impl FulltextResolver {
    pub fn new(
        sources: Vec<Arc<dyn FulltextSource>>,
        store: Arc<dyn FulltextStore>,
        validator: StructuralValidator,
        concurrency: usize,
    ) -> Self {
        Self { sources, store, validator, concurrency: concurrency.max(1) }
    }

    pub fn store(&self) -> &Arc<dyn FulltextStore> {
        &self.store
    }

    /// Resolve one record. Never fails: errors end up in `outcome.error`.
    #[instrument(skip(self, record), fields(id = %record.id))]
    pub async fn resolve(&self, record: &Record) -> FulltextOutcome {
        let store_key = self.store.key_for(&record.id);

        match self.store.get(&record.id).await {
            Ok(Some(existing)) if existing.status == FulltextStatus::FulltextWithBody => {
                debug!("Full text already stored, skipping");
                return FulltextOutcome {
                    id: record.id.clone(),
                    status: FulltextStatus::FulltextWithBody,
                    source: existing.source,
                    skipped: true,
                    upsert: None,
                    store_key,
                    error: None,
                };
            }
            Ok(Some(_)) => debug!("Abstract-only entry found, re-attempting for upgrade"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Store read failed, attempting fetch anyway"),
        }

        let mut attempts = Vec::new();
        let mut winner: Option<(String, &'static str)> = None;
        for source in &self.sources {
            let result = source.fetch(record, &self.validator).await;
            attempts.extend(result.attempts);
            if let Some(body) = result.body {
                winner = Some((body, source.name()));
                break;
            }
        }

        let now = Utc::now();
        let (status, full_text, source) = match winner {
            Some((body, name)) => (FulltextStatus::FulltextWithBody, Some(body), Some(name.to_string())),
            None => (FulltextStatus::AbstractOnly, None, None),
        };

        let entry = FulltextRecord {
            id: record.id.clone(),
            doi: record.doi.clone(),
            pmcid: record.pmcid.clone(),
            abstract_text: record.abstract_text.clone(),
            structurally_complete: full_text.is_some(),
            full_text,
            status,
            source: source.clone(),
            attempts,
            resolution_passes: 1,
            first_attempted_at: now,
            last_attempted_at: now,
        };

        let (upsert, error) = match self.store.upsert(entry).await {
            Ok(u) => (Some(u), None),
            Err(e) => {
                warn!(error = %e, "Full-text store write failed");
                (None, Some(e.to_string()))
            }
        };

        // A concurrent pass may have stored full text first.
        let status = if upsert == Some(UpsertOutcome::Unchanged) { FulltextStatus::FulltextWithBody } else { status };

        FulltextOutcome { id: record.id.clone(), status, source, skipped: false, upsert, store_key, error }
    }

    /// Resolve every record on spawned workers, at most `concurrency` at once.
    /// `on_outcome` sees each outcome as it completes, in completion order.
    pub async fn resolve_all<F>(&self, records: &[Record], mut on_outcome: F) -> Vec<FulltextOutcome>
    where
        F: FnMut(&FulltextOutcome),
    {
        info!(n = records.len(), concurrency = self.concurrency, "Resolving full text");
        let mut outcomes = Vec::with_capacity(records.len());
        let resolver = self.clone();
        let mut pending = WorkerPool::new(records.to_vec(), self.concurrency, move |record: Record| {
            let resolver = resolver.clone();
            async move { resolver.resolve(&record).await }
        });

        while let Some((record, result)) = pending.next().await {
            let outcome = result.unwrap_or_else(|panic| {
                warn!(id = %record.id, %panic, "Resolver worker panicked");
                FulltextOutcome {
                    id: record.id.clone(),
                    status: FulltextStatus::NotAttempted,
                    source: None,
                    skipped: false,
                    upsert: None,
                    store_key: self.store.key_for(&record.id),
                    error: Some(format!("worker panicked: {panic}")),
                }
            });
            on_outcome(&outcome);
            outcomes.push(outcome);
        }
        outcomes
    }
}
