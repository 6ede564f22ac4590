//! Run orchestration.
//!
//! A bootstrap run builds the corpus from scratch:
//!   1. Harvest every topic over `bootstrap_min_date ..= today`
//!   2. Fetch, parse, deduplicate and score the candidates
//!   3. Apply the quality floor and run diversity selection
//!   4. Write the snapshot, resolve full text, rewrite the snapshot
//!   5. Freeze per-topic thresholds and advance the watermark
//!
//! A monthly run harvests from the watermark, admits new records through the
//! three-tier filter, merges them into the prior snapshot and resolves them.
//! The manifest is rewritten after every stage and every resolved batch.

pub mod admission;
pub mod manifest;
pub mod snapshot;
pub mod thresholds;
pub mod watermark;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use scicurate_common::sandbox::SandboxClient;
use scicurate_common::{RateLimitPolicy, RateLimitedClient, ThroughputTier};
use scicurate_ingestion::dedup::{dedup_records, merge_topic_tags, DedupResult, Deduplicator};
use scicurate_ingestion::fulltext::store::{FulltextStore, ShardedFileStore};
use scicurate_ingestion::fulltext::validate::StructuralValidator;
use scicurate_ingestion::fulltext::{FulltextResolver, FulltextSource};
use scicurate_ingestion::journal::HarvestJournal;
use scicurate_ingestion::parser::RecordParser;
use scicurate_ingestion::scoring::{apply_quality_floor, apply_representation_adjustment};
use scicurate_ingestion::sources::europepmc::EuropePmcClient;
use scicurate_ingestion::sources::pmc::PmcClient;
use scicurate_ingestion::sources::pubmed::PubMedClient;
use scicurate_ingestion::sources::unpaywall::UnpaywallClient;
use scicurate_ingestion::sources::LiteratureApi;
use scicurate_ingestion::{DateRange, FulltextStatus, HarvestStage, Harvester, HeuristicScorer, Record};
use scicurate_selector::select;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use admission::AdmissionFilter;
use manifest::{RunManifest, RunMode, RunStatus, Stage, TruncatedLeaf};
use thresholds::TopicThresholds;
use watermark::{gap_ceiling, Watermark};

// ── Files ─────────────────────────────────────────────────────────────────────

/// Write to a sibling temp file, then rename over the target.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path.parent().context("path has no parent directory")?;
    tokio::fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    write_atomic(path, &serde_json::to_vec_pretty(value)?).await
}

/// `None` when the file does not exist.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(
            serde_json::from_slice(&bytes).with_context(|| format!("invalid JSON in {}", path.display()))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Where a run's durable state lives under the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn watermark(&self) -> PathBuf {
        self.root.join("watermark.json")
    }

    pub fn thresholds(&self) -> PathBuf {
        self.root.join("thresholds.json")
    }

    pub fn snapshot(&self) -> PathBuf {
        self.root.join("corpus.jsonl")
    }

    pub fn runs(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn manifest(&self, run_id: Uuid) -> PathBuf {
        self.runs().join(run_id.to_string()).join("manifest.json")
    }

    pub fn journal(&self, run_id: Uuid) -> PathBuf {
        self.runs().join(run_id.to_string()).join("harvest.jsonl")
    }

    /// Most recently started run, if any.
    pub async fn latest_manifest(&self) -> anyhow::Result<Option<RunManifest>> {
        let mut dir = match tokio::fs::read_dir(self.runs()).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut latest: Option<RunManifest> = None;
        while let Some(entry) = dir.next_entry().await? {
            let Some(m) = RunManifest::load(&entry.path().join("manifest.json")).await? else { continue };
            if latest.as_ref().map_or(true, |l| m.started_at > l.started_at) {
                latest = Some(m);
            }
        }
        Ok(latest)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no watermark at {0}; run `scicurate bootstrap` first")]
    MissingWatermark(PathBuf),

    #[error("no topic thresholds at {0}; run `scicurate bootstrap` first")]
    MissingThresholds(PathBuf),

    #[error("run {0} already completed")]
    AlreadyCompleted(Uuid),

    #[error("run {run_id} is a {found} run and cannot be resumed as {requested}")]
    ModeMismatch { run_id: Uuid, found: RunMode, requested: RunMode },
}

// ── Services ──────────────────────────────────────────────────────────────────

/// External collaborators of a run.
pub struct Services {
    pub literature: Arc<dyn LiteratureApi>,
    /// Full-text sources in cascade order.
    pub sources: Vec<Arc<dyn FulltextSource>>,
    pub store: Arc<dyn FulltextStore>,
}

impl Services {
    /// Builds the live clients. NCBI endpoints share one rate-limited client
    /// whose tier depends on the API key.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api_key = config.ncbi.api_key.as_ref().map(|k| k.expose_secret().to_string());
        let tier = ThroughputTier::from_credential(api_key.is_some());
        info!(?tier, rps = tier.requests_per_second(), "NCBI throughput tier");

        let sandbox = SandboxClient::new(config.http.timeout())?;
        let ncbi = RateLimitedClient::new(sandbox.clone(), config.http.policy(RateLimitPolicy::for_tier(tier)));

        let other_policy = config.http.policy(RateLimitPolicy {
            requests_per_second: config.http.other_requests_per_second,
            ..RateLimitPolicy::default()
        });
        let other = RateLimitedClient::new(sandbox, other_policy.clone());
        let downloads = RateLimitedClient::new(
            SandboxClient::open(config.http.download_timeout())?,
            RateLimitPolicy { timeout: config.http.download_timeout(), ..other_policy },
        );

        let mut sources: Vec<Arc<dyn FulltextSource>> = Vec::new();
        for name in &config.fulltext.sources {
            let source: Arc<dyn FulltextSource> = match name.as_str() {
                "pmc" => Arc::new(PmcClient::new(ncbi.clone(), api_key.clone(), config.ncbi.email.clone())),
                "europepmc" => Arc::new(EuropePmcClient::new(other.clone())),
                "unpaywall" => {
                    let email = config
                        .fulltext
                        .unpaywall_email
                        .clone()
                        .context("fulltext.unpaywall_email is required for the unpaywall source")?;
                    Arc::new(UnpaywallClient::new(
                        other.clone(),
                        downloads.clone(),
                        email,
                        config.fulltext.max_candidates,
                    ))
                }
                other => anyhow::bail!("unknown full-text source '{other}'"),
            };
            sources.push(source);
        }

        Ok(Self {
            literature: Arc::new(PubMedClient::new(ncbi, api_key, config.ncbi.email.clone())),
            sources,
            store: Arc::new(ShardedFileStore::new(config.run.fulltext_store_dir())),
        })
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct StatusReport {
    pub data_dir: PathBuf,
    pub watermark: Option<Watermark>,
    pub thresholds: Option<TopicThresholds>,
    pub last_run: Option<RunManifest>,
    pub snapshot_records: usize,
}

impl StatusReport {
    pub async fn collect(layout: &DataLayout) -> anyhow::Result<Self> {
        Ok(Self {
            data_dir: layout.root().to_path_buf(),
            watermark: Watermark::load(&layout.watermark()).await?,
            thresholds: TopicThresholds::load(&layout.thresholds()).await?,
            last_run: layout.latest_manifest().await?,
            snapshot_records: snapshot::read(&layout.snapshot()).await?.len(),
        })
    }
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "data dir:   {}", self.data_dir.display())?;
        match &self.watermark {
            Some(w) => writeln!(f, "watermark:  {} (run {}, updated {})", w.date, w.run_id, w.updated_at)?,
            None => writeln!(f, "watermark:  none (bootstrap not run)")?,
        }
        match &self.thresholds {
            Some(t) => {
                writeln!(f, "thresholds: p{} over {} topics", t.percentile, t.thresholds.len())?;
                for (topic, value) in &t.thresholds {
                    writeln!(f, "  {topic:<24} {value:.2}")?;
                }
            }
            None => writeln!(f, "thresholds: none")?,
        }
        writeln!(f, "corpus:     {} records", self.snapshot_records)?;
        if let Some(m) = &self.last_run {
            writeln!(f, "last run:   {} {} {:?} (stage {:?})", m.run_id, m.mode, m.status, m.stage)?;
            writeln!(f, "  started   {}", m.started_at)?;
            if let Some(done) = m.finished_at {
                writeln!(f, "  finished  {done}")?;
            }
            let c = &m.counters;
            writeln!(
                f,
                "  harvested {} fetched {} parsed {} selected {} merged {}",
                c.harvested_ids, c.fetched, c.parsed, c.selected, c.merged_new
            )?;
            writeln!(
                f,
                "  full text {} with body, {} abstract-only, {} skipped",
                m.fulltext.with_body, m.fulltext.abstract_only, m.fulltext.skipped
            )?;
            writeln!(f, "  gaps {} truncated leaves {}", m.gaps.len(), m.truncated_leaves.len())?;
            if let Some(e) = &m.error {
                writeln!(f, "  error     {e}")?;
            }
        }
        Ok(())
    }
}

// ── Runner ────────────────────────────────────────────────────────────────────

pub struct Runner {
    config: Config,
    layout: DataLayout,
    services: Services,
    today: NaiveDate,
}

impl Runner {
    pub fn new(config: Config, services: Services) -> Self {
        let layout = DataLayout::new(&config.run.data_dir);
        Self { config, layout, services, today: Utc::now().date_naive() }
    }

    /// Fixes the reference date used for the harvest span and recency scoring.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub async fn status(&self) -> anyhow::Result<StatusReport> {
        StatusReport::collect(&self.layout).await
    }

    #[instrument(skip(self))]
    pub async fn bootstrap(&self, run_id: Option<Uuid>) -> anyhow::Result<RunManifest> {
        let mut manifest = self.begin(run_id, RunMode::Bootstrap).await?;
        let result = self.bootstrap_stages(&mut manifest).await;
        self.finish(manifest, result).await
    }

    #[instrument(skip(self))]
    pub async fn monthly(&self, run_id: Option<Uuid>) -> anyhow::Result<RunManifest> {
        let watermark_path = self.layout.watermark();
        let watermark = Watermark::load(&watermark_path)
            .await?
            .ok_or(RunError::MissingWatermark(watermark_path))?;
        let thresholds_path = self.layout.thresholds();
        let thresholds = TopicThresholds::load(&thresholds_path)
            .await?
            .ok_or(RunError::MissingThresholds(thresholds_path))?;

        let mut manifest = self.begin(run_id, RunMode::Monthly).await?;
        let result = self.monthly_stages(&mut manifest, watermark, &thresholds).await;
        self.finish(manifest, result).await
    }

    async fn begin(&self, run_id: Option<Uuid>, mode: RunMode) -> anyhow::Result<RunManifest> {
        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let mut manifest = RunManifest::new(run_id, mode);

        if let Some(previous) = RunManifest::load(&self.layout.manifest(run_id)).await? {
            if previous.status == RunStatus::Completed {
                return Err(RunError::AlreadyCompleted(run_id).into());
            }
            if previous.mode != mode {
                return Err(RunError::ModeMismatch { run_id, found: previous.mode, requested: mode }.into());
            }
            info!(%run_id, stage = ?previous.stage, "Resuming interrupted run");
            manifest.started_at = previous.started_at;
        }

        info!(%run_id, %mode, data_dir = %self.layout.root().display(), "Run started");
        self.checkpoint(&mut manifest, Stage::Started).await?;
        Ok(manifest)
    }

    async fn finish(&self, mut manifest: RunManifest, result: anyhow::Result<()>) -> anyhow::Result<RunManifest> {
        match result {
            Ok(()) => {
                manifest.complete();
                manifest.save(&self.layout.manifest(manifest.run_id)).await?;
                info!(
                    run_id = %manifest.run_id,
                    corpus = manifest.counters.snapshot_records,
                    with_body = manifest.fulltext.with_body,
                    abstract_only = manifest.fulltext.abstract_only,
                    gaps = manifest.gaps.len(),
                    "Run completed"
                );
                Ok(manifest)
            }
            Err(e) => {
                manifest.fail(&e);
                if let Err(save_err) = manifest.save(&self.layout.manifest(manifest.run_id)).await {
                    warn!(error = %save_err, "Failed to save manifest of failed run");
                }
                Err(e)
            }
        }
    }

    async fn checkpoint(&self, manifest: &mut RunManifest, stage: Stage) -> anyhow::Result<()> {
        manifest.stage = stage;
        manifest.save(&self.layout.manifest(manifest.run_id)).await
    }

    // ── Bootstrap ─────────────────────────────────────────────────────────────

    async fn bootstrap_stages(&self, m: &mut RunManifest) -> anyhow::Result<()> {
        let span = DateRange::new(self.config.run.bootstrap_min_date, self.today);
        m.span = Some(span);
        let previous = Watermark::load(&self.layout.watermark()).await?;
        m.watermark_before = previous.as_ref().map(|w| w.date);

        let parsed = self.harvest_and_parse(span, m).await?;
        let observed = max_observed(&parsed);

        let (mut records, dropped) = dedup_records(parsed);
        for (reason, n) in dropped {
            m.counters.duplicates += n;
            m.reject(reason, n);
        }
        self.score(&mut records);
        self.checkpoint(m, Stage::Scored).await?;

        let (pool, below) = apply_quality_floor(records, self.config.scoring.quality_floor);
        m.counters.floor_rejected = below.len();
        m.reject("below_quality_floor", below.len());
        m.counters.candidates = pool.len();
        info!(candidates = pool.len(), below_floor = below.len(), "Quality floor applied");

        let selection = select(pool, &self.config.selection)?;
        m.rounds = selection.rounds;
        m.counters.selected = selection.records.len();
        let mut corpus = selection.records;
        self.write_snapshot(&corpus, m).await?;
        self.checkpoint(m, Stage::Selected).await?;

        self.resolve_pending(&mut corpus, m).await?;
        self.write_snapshot(&corpus, m).await?;

        let thresholds = TopicThresholds::compute(&corpus, self.config.run.threshold_percentile, m.run_id);
        thresholds.save_if_absent(&self.layout.thresholds()).await?;

        self.advance_watermark(previous.as_ref(), observed, m).await
    }

    // ── Monthly ───────────────────────────────────────────────────────────────

    async fn monthly_stages(
        &self,
        m: &mut RunManifest,
        previous: Watermark,
        thresholds: &TopicThresholds,
    ) -> anyhow::Result<()> {
        let span = DateRange::new(previous.date, self.today.max(previous.date));
        m.span = Some(span);
        m.watermark_before = Some(previous.date);

        let mut corpus = snapshot::read(&self.layout.snapshot()).await?;
        if corpus.is_empty() {
            warn!(path = %self.layout.snapshot().display(), "No prior snapshot, starting from an empty corpus");
        }

        let parsed = self.harvest_and_parse(span, m).await?;
        let observed = max_observed(&parsed);

        let mut dedup = Deduplicator::with_existing(&corpus);
        for r in parsed {
            let result = dedup.push(r);
            if result != DedupResult::New {
                m.counters.duplicates += 1;
                m.reject(result.reason_code(), 1);
            }
        }
        let mut fresh = dedup.into_records();
        self.score(&mut fresh);
        self.checkpoint(m, Stage::Scored).await?;

        let filter = AdmissionFilter::new(thresholds, self.config.scoring.quality_floor, self.config.run.recent_per_topic);
        let (admitted, counts) = filter.admit(fresh);
        m.reject("admission_rejected", counts.rejected);
        info!(priority = counts.priority, threshold = counts.threshold, rejected = counts.rejected, "Admission");
        m.counters.admission = Some(counts);
        m.counters.merged_new = admitted.len();
        m.counters.selected = admitted.len();

        corpus.extend(admitted);
        self.write_snapshot(&corpus, m).await?;
        self.checkpoint(m, Stage::Selected).await?;

        self.resolve_pending(&mut corpus, m).await?;
        self.write_snapshot(&corpus, m).await?;

        self.advance_watermark(Some(&previous), observed, m).await
    }

    // ── Shared stages ─────────────────────────────────────────────────────────

    /// Harvests every topic over `span`, fetches the union of IDs and parses
    /// them. Gaps and parse failures are counted, never fatal.
    async fn harvest_and_parse(&self, span: DateRange, m: &mut RunManifest) -> anyhow::Result<Vec<Record>> {
        let journal = HarvestJournal::open(self.layout.journal(m.run_id)).await?;
        if !journal.is_empty() {
            info!(leaves = journal.len(), "Harvest journal found, completed leaves will be reused");
        }
        let harvester = Harvester::new(self.services.literature.clone(), self.config.harvest.clone());

        m.per_topic.clear();
        m.gaps.clear();
        m.truncated_leaves.clear();
        m.completed_leaves = 0;
        m.resumed_leaves = 0;

        let mut harvests = Vec::with_capacity(self.config.topics.len());
        for topic in &self.config.topics {
            let h = harvester.harvest_topic(topic, span, Some(&journal)).await;
            let failed_leaves = h.gaps.iter().filter(|g| g.stage == HarvestStage::Page).count();
            m.per_topic.insert(h.topic.clone(), h.ids.len());
            m.completed_leaves += h.leaves.len().saturating_sub(failed_leaves);
            m.resumed_leaves += h.resumed_leaves;
            m.truncated_leaves
                .extend(h.truncated.iter().map(|range| TruncatedLeaf { topic: h.topic.clone(), range: *range }));
            m.gaps.extend(h.gaps.iter().cloned());
            harvests.push(h);
        }

        let tags = merge_topic_tags(&harvests);
        m.counters.harvested_ids = tags.len();
        self.checkpoint(m, Stage::Harvested).await?;

        let ids: Vec<String> = tags.keys().cloned().collect();
        let (raws, gaps) = harvester.fetch_records(&ids).await;
        m.counters.fetched = raws.len();
        m.gaps.extend(gaps);

        let parser = RecordParser::new(self.config.topic_order());
        let empty = BTreeSet::new();
        let mut parsed = Vec::with_capacity(raws.len());
        for raw in raws {
            let topics = raw.pmid.as_deref().and_then(|id| tags.get(id.trim())).unwrap_or(&empty);
            match parser.parse(raw, topics) {
                Ok(r) => parsed.push(r),
                Err(e) => {
                    debug!(error = %e, "Record discarded");
                    m.reject(e.reason_code(), 1);
                }
            }
        }
        m.counters.parsed = parsed.len();
        info!(harvested = tags.len(), fetched = m.counters.fetched, parsed = parsed.len(), "Candidates parsed");
        self.checkpoint(m, Stage::Fetched).await?;
        Ok(parsed)
    }

    fn score(&self, records: &mut [Record]) {
        HeuristicScorer::new(self.config.scoring.clone(), self.today).score_all(records);
        apply_representation_adjustment(records);
    }

    async fn write_snapshot(&self, corpus: &[Record], m: &mut RunManifest) -> anyhow::Result<()> {
        let path = self.layout.snapshot();
        snapshot::write(&path, corpus).await?;
        m.counters.snapshot_records = corpus.len();
        m.snapshot_path = Some(path);
        Ok(())
    }

    /// Resolves every record without stored full text, in manifest-sized
    /// batches, and copies the resulting pointers back into `corpus`.
    async fn resolve_pending(&self, corpus: &mut [Record], m: &mut RunManifest) -> anyhow::Result<()> {
        let resolver = FulltextResolver::new(
            self.services.sources.clone(),
            self.services.store.clone(),
            StructuralValidator::new(self.config.fulltext.validation.clone()),
            self.config.fulltext.concurrency,
        );

        let pending: Vec<usize> = (0..corpus.len())
            .filter(|&i| corpus[i].fulltext.status != FulltextStatus::FulltextWithBody)
            .collect();
        info!(pending = pending.len(), corpus = corpus.len(), "Full-text resolution");
        self.checkpoint(m, Stage::Resolving).await?;

        for chunk in pending.chunks(self.config.run.resolve_batch_size.max(1)) {
            let batch: Vec<Record> = chunk.iter().map(|&i| corpus[i].clone()).collect();
            let summary = &mut m.fulltext;
            let outcomes = resolver.resolve_all(&batch, |o| summary.record(o)).await;

            let pointers: HashMap<String, _> = outcomes.iter().map(|o| (o.id.clone(), o.pointer())).collect();
            for &i in chunk {
                if let Some(p) = pointers.get(&corpus[i].id) {
                    corpus[i].fulltext = p.clone();
                }
            }
            m.save(&self.layout.manifest(m.run_id)).await?;
        }
        Ok(())
    }

    async fn advance_watermark(
        &self,
        previous: Option<&Watermark>,
        observed: Option<NaiveDate>,
        m: &mut RunManifest,
    ) -> anyhow::Result<()> {
        let Some(max_observed) = observed else {
            warn!("No publication dates observed, watermark unchanged");
            m.watermark_after = previous.map(|w| w.date);
            return Ok(());
        };
        let ceiling = m.span.and_then(|span| gap_ceiling(&m.gaps, span));
        let wm = Watermark::advance(
            previous,
            max_observed.min(self.today),
            self.config.run.overlap_days,
            ceiling,
            m.run_id,
        );
        wm.save(&self.layout.watermark()).await?;
        m.watermark_after = Some(wm.date);
        Ok(())
    }
}

/// Newest publication date among `records`.
pub fn max_observed(records: &[Record]) -> Option<NaiveDate> {
    records.iter().filter_map(Record::effective_date).max()
}
