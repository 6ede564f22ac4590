//! Bootstrap and monthly runs end to end against an in-memory literature
//! database and a mock full-text source.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use pretty_assertions::assert_eq;
use scicurate_agent::run::manifest::{RunManifest, RunMode, RunStatus};
use scicurate_agent::run::snapshot;
use scicurate_agent::run::thresholds::TopicThresholds;
use scicurate_agent::run::watermark::Watermark;
use scicurate_agent::{Config, RunError, Runner, Services};
use scicurate_common::FetchError;
use scicurate_ingestion::fulltext::store::ShardedFileStore;
use scicurate_ingestion::fulltext::validate::StructuralValidator;
use scicurate_ingestion::fulltext::{AttemptTag, FulltextSource, SourceAttempt, SourceResult};
use scicurate_ingestion::sources::LiteratureApi;
use scicurate_ingestion::{DateRange, FulltextStatus, HarvestStage, RawRecord, Record};
use scicurate_selector::SelectionError;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

// ── Mocks ─────────────────────────────────────────────────────────────────────

/// Each entry matches the queries listed with it.
#[derive(Default)]
struct MockLiterature {
    entries: Vec<(Vec<&'static str>, RawRecord)>,
    /// Page requests for a range covering this date fail.
    failing_date: Mutex<Option<NaiveDate>>,
    /// Record batches containing this ID fail.
    failing_id: Mutex<Option<String>>,
    /// IDs returned by successful page requests.
    served: Mutex<BTreeSet<String>>,
    page_calls: AtomicUsize,
}

impl MockLiterature {
    fn matching(&self, query: &str, range: &DateRange) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(queries, raw)| {
                queries.iter().any(|q| *q == query) && raw.pub_date.map_or(false, |date| range.contains(date))
            })
            .filter_map(|(_, raw)| raw.pmid.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl LiteratureApi for MockLiterature {
    async fn count(&self, query: &str, range: &DateRange) -> Result<usize, FetchError> {
        Ok(self.matching(query, range).len())
    }

    async fn search_page(
        &self,
        query: &str,
        range: &DateRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, FetchError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_date.lock().unwrap().map_or(false, |date| range.contains(date)) {
            return Err(FetchError::terminal("esearch", Some(503), "HTTP 503"));
        }
        let page: Vec<String> = self.matching(query, range).into_iter().skip(offset).take(limit).collect();
        self.served.lock().unwrap().extend(page.iter().cloned());
        Ok(page)
    }

    async fn fetch_records(&self, ids: &[String]) -> Result<Vec<RawRecord>, FetchError> {
        if let Some(id) = self.failing_id.lock().unwrap().as_ref() {
            if ids.contains(id) {
                return Err(FetchError::terminal("efetch", Some(500), "HTTP 500"));
            }
        }
        Ok(self
            .entries
            .iter()
            .filter(|(_, raw)| raw.pmid.as_ref().map_or(false, |id| ids.contains(id)))
            .map(|(_, raw)| raw.clone())
            .collect())
    }
}

/// Serves a structured article for IDs divisible by three.
#[derive(Default)]
struct MockRepository {
    calls: Mutex<HashMap<String, usize>>,
}

impl MockRepository {
    fn calls(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn has_body(id: &str) -> bool {
        id.parse::<u32>().map_or(false, |n| n % 3 == 0)
    }
}

#[async_trait]
impl FulltextSource for MockRepository {
    fn name(&self) -> &'static str {
        "pmc"
    }

    async fn fetch(&self, record: &Record, validator: &StructuralValidator) -> SourceResult {
        *self.calls.lock().unwrap().entry(record.id.clone()).or_default() += 1;
        if Self::has_body(&record.id) {
            SourceResult::validated("pmc", article_body(), validator)
        } else {
            SourceResult::single(SourceAttempt::new("pmc", AttemptTag::NotFound).with_status(Some(404)))
        }
    }
}

fn article_body() -> String {
    let para = "Participants were supplemented daily and outcomes were measured at baseline and follow-up. ".repeat(8);
    format!("Introduction\n{para}\nMethods\n{para}\nResults\n{para}\nDiscussion\n{para}")
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn raw(id: u32, topic: &str, date: NaiveDate, abstract_text: Option<String>) -> RawRecord {
    RawRecord {
        pmid: Some(id.to_string()),
        doi: Some(format!("10.1000/{id}")),
        pmcid: None,
        title: format!("{topic} study {id}"),
        abstract_text,
        journal: Some(format!("Journal of {topic}")),
        pub_year: Some(chrono::Datelike::year(&date)),
        pub_date: Some(date),
        publication_types: vec!["Journal Article".to_string()],
    }
}

fn bootstrap_abstract(topic: &str, i: u32) -> String {
    match i {
        i if i % 4 == 0 => format!(
            "A randomized controlled trial of {topic} supplementation for performance in 120 athletes."
        ),
        i if i % 10 == 9 => format!("A case report of {topic} use."),
        _ => format!("A prospective cohort study of {topic} intake and safety in 80 adults."),
    }
}

/// 40 creatine and 20 caffeine records up to 2025-03-15, one shared by both
/// topics, one without an abstract. Then 10 creatine records published
/// after the bootstrap reference date.
fn database() -> MockLiterature {
    let mut entries = Vec::new();
    for i in 0..40 {
        let date = if i == 0 { d(2025, 3, 15) } else { d(2016, 1, 1) + Duration::days(i as i64 * 50) };
        let queries = if i == 1 { vec!["creatine", "caffeine"] } else { vec!["creatine"] };
        entries.push((queries, raw(1000 + i, "creatine", date, Some(bootstrap_abstract("creatine", i)))));
    }
    for i in 0..20 {
        let date = d(2017, 6, 1) + Duration::days(i as i64 * 70);
        let text = format!("A prospective cohort study of caffeine and endurance performance in {} adults.", 60 + i);
        entries.push((vec!["caffeine"], raw(2000 + i, "caffeine", date, Some(text))));
    }
    entries.push((vec!["creatine"], raw(1999, "creatine", d(2020, 2, 2), None)));

    for i in 0..10 {
        let date = d(2025, 4, 2) + Duration::days(i as i64 * 3);
        let text = if i == 0 {
            "A systematic review and meta-analysis of creatine.".to_string()
        } else {
            "A case report of creatine use.".to_string()
        };
        entries.push((vec!["creatine"], raw(3000 + i, "creatine", date, Some(text))));
    }
    MockLiterature { entries, ..Default::default() }
}

const CONFIG: &str = r#"
[run]
bootstrap_min_date = "2015-01-01"
overlap_days = 1
recent_per_topic = 2
resolve_batch_size = 7

[[topics]]
name = "creatine"
query = "creatine"

[[topics]]
name = "caffeine"
query = "caffeine"

[selection]
target = 30
batch_size = 5
protected_per_topic = 3
protected_per_pair = 1

[fulltext]
sources = ["pmc"]
concurrency = 4
"#;

struct Harness {
    literature: Arc<MockLiterature>,
    repository: Arc<MockRepository>,
}

impl Harness {
    fn new() -> Self {
        Self { literature: Arc::new(database()), repository: Arc::new(MockRepository::default()) }
    }

    fn runner(&self, data_dir: &Path, today: NaiveDate) -> Runner {
        self.runner_with(data_dir, today, CONFIG)
    }

    fn runner_with(&self, data_dir: &Path, today: NaiveDate, toml: &str) -> Runner {
        let mut config = Config::from_toml(toml).unwrap();
        config.run.data_dir = data_dir.to_path_buf();
        let services = Services {
            literature: self.literature.clone(),
            sources: vec![self.repository.clone() as Arc<dyn FulltextSource>],
            store: Arc::new(ShardedFileStore::new(data_dir.join("fulltext"))),
        };
        Runner::new(config, services).with_today(today)
    }
}

fn ids(records: &[Record]) -> BTreeSet<String> {
    records.iter().map(|r| r.id.clone()).collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bootstrap_builds_corpus_and_freezes_state() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let runner = harness.runner(dir.path(), d(2025, 4, 1));

    let manifest = runner.bootstrap(None).await.unwrap();

    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(manifest.mode, RunMode::Bootstrap);
    assert_eq!(manifest.counters.harvested_ids, 61);
    assert_eq!(manifest.per_topic.get("creatine"), Some(&41));
    assert_eq!(manifest.per_topic.get("caffeine"), Some(&21));
    assert_eq!(manifest.rejections.get("missing_content"), Some(&1));
    assert_eq!(manifest.counters.parsed, 60);
    assert!(manifest.counters.floor_rejected >= 1);
    assert_eq!(manifest.counters.selected, 30);
    assert!(!manifest.rounds.is_empty());
    assert!(manifest.gaps.is_empty());

    let corpus = snapshot::read(&runner.layout().snapshot()).await.unwrap();
    assert_eq!(corpus.len(), 30);
    assert_eq!(ids(&corpus).len(), 30);
    for r in &corpus {
        assert!(r.reliability.total() >= 4.0);
        let expected = if MockRepository::has_body(&r.id) {
            FulltextStatus::FulltextWithBody
        } else {
            FulltextStatus::AbstractOnly
        };
        assert_eq!(r.fulltext.status, expected, "record {}", r.id);
        assert!(r.fulltext.store_key.is_some());
    }
    assert_eq!(manifest.fulltext.with_body + manifest.fulltext.abstract_only, 30);

    let shared = corpus.iter().find(|r| r.id == "1001");
    if let Some(r) = shared {
        assert_eq!(r.topics, BTreeSet::from(["caffeine".to_string(), "creatine".to_string()]));
        assert_eq!(r.primary_topic, "creatine");
    }

    // Newest record is 2025-03-15; one day of overlap.
    let wm = Watermark::load(&runner.layout().watermark()).await.unwrap().unwrap();
    assert_eq!(wm.date, d(2025, 3, 14));
    assert_eq!(wm.run_id, manifest.run_id);
    assert_eq!(manifest.watermark_after, Some(d(2025, 3, 14)));

    let thresholds = TopicThresholds::load(&runner.layout().thresholds()).await.unwrap().unwrap();
    assert!(thresholds.get("creatine").is_some());
    assert_eq!(thresholds.percentile, 25.0);

    let on_disk = RunManifest::load(&runner.layout().manifest(manifest.run_id)).await.unwrap().unwrap();
    assert_eq!(on_disk.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_monthly_merges_new_records_without_refetching() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();

    harness.runner(dir.path(), d(2025, 4, 1)).bootstrap(None).await.unwrap();
    let layout_snapshot = dir.path().join("corpus.jsonl");
    let prior = snapshot::read(&layout_snapshot).await.unwrap();
    let prior_thresholds = std::fs::read_to_string(dir.path().join("thresholds.json")).unwrap();
    let calls_before: HashMap<String, usize> =
        prior.iter().map(|r| (r.id.clone(), harness.repository.calls(&r.id))).collect();

    let runner = harness.runner(dir.path(), d(2025, 5, 1));
    let manifest = runner.monthly(None).await.unwrap();

    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(manifest.span, Some(DateRange::new(d(2025, 3, 14), d(2025, 5, 1))));
    assert_eq!(manifest.watermark_before, Some(d(2025, 3, 14)));

    let admission = manifest.counters.admission.clone().unwrap();
    assert!(admission.priority >= 3, "meta-analysis plus the two newest: {admission:?}");

    let corpus = snapshot::read(&layout_snapshot).await.unwrap();
    assert_eq!(corpus.len(), prior.len() + manifest.counters.merged_new);
    assert_eq!(ids(&corpus).len(), corpus.len());
    assert!(ids(&corpus).contains("3000"));
    assert!(ids(&corpus).contains("3009"));
    assert!(ids(&corpus).contains("3008"));

    // Existing entries win and keep their position.
    for (old, new) in prior.iter().zip(&corpus) {
        assert_eq!(old.id, new.id);
        assert_eq!(old.reliability, new.reliability);
    }

    for r in &prior {
        let before = calls_before[&r.id];
        let after = harness.repository.calls(&r.id);
        match r.fulltext.status {
            FulltextStatus::FulltextWithBody => assert_eq!(after, before, "{} re-fetched", r.id),
            _ => assert_eq!(after, before + 1, "{} not retried", r.id),
        }
    }

    // Newest monthly record is 2025-04-29.
    let wm = Watermark::load(&runner.layout().watermark()).await.unwrap().unwrap();
    assert_eq!(wm.date, d(2025, 4, 28));
    assert_eq!(wm.run_id, manifest.run_id);

    let thresholds_after = std::fs::read_to_string(dir.path().join("thresholds.json")).unwrap();
    assert_eq!(thresholds_after, prior_thresholds);
}

#[tokio::test]
async fn test_monthly_without_watermark_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let runner = harness.runner(dir.path(), d(2025, 5, 1));

    let err = runner.monthly(None).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<RunError>(), Some(RunError::MissingWatermark(_))));
    assert!(!dir.path().join("runs").exists());
    assert!(harness.repository.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_target_above_pool_fails_run_before_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let toml = CONFIG.replace("target = 30", "target = 500");
    let runner = harness.runner_with(dir.path(), d(2025, 4, 1), &toml);
    let run_id = uuid::Uuid::new_v4();

    let err = runner.bootstrap(Some(run_id)).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SelectionError>(),
        Some(SelectionError::TargetExceedsPool { target: 500, .. })
    ));

    let manifest = RunManifest::load(&runner.layout().manifest(run_id)).await.unwrap().unwrap();
    assert_eq!(manifest.status, RunStatus::Failed);
    assert!(manifest.error.is_some());
    assert!(harness.repository.calls.lock().unwrap().is_empty());
    assert!(Watermark::load(&runner.layout().watermark()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_completed_run_cannot_be_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let runner = harness.runner(dir.path(), d(2025, 4, 1));
    let run_id = uuid::Uuid::new_v4();

    runner.bootstrap(Some(run_id)).await.unwrap();
    let err = runner.bootstrap(Some(run_id)).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<RunError>(), Some(RunError::AlreadyCompleted(id)) if *id == run_id));

    let status = runner.status().await.unwrap();
    assert_eq!(status.snapshot_records, 30);
    assert_eq!(status.last_run.map(|m| m.run_id), Some(run_id));
}

#[tokio::test]
async fn test_failed_leaf_holds_watermark_before_the_gap() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let toml = format!("{CONFIG}\n[harvest]\nwindow_limit = 4\npage_size = 4\n");
    harness.runner_with(dir.path(), d(2025, 4, 1), &toml).bootstrap(None).await.unwrap();

    // Pages covering 2025-04-08 (record 3002) fail; later leaves succeed.
    *harness.literature.failing_date.lock().unwrap() = Some(d(2025, 4, 8));
    let runner = harness.runner_with(dir.path(), d(2025, 5, 1), &toml);
    let manifest = runner.monthly(None).await.unwrap();

    let gap_start = manifest
        .gaps
        .iter()
        .filter(|g| g.stage == HarvestStage::Page)
        .filter_map(|g| g.range.map(|r| r.start))
        .min()
        .expect("page gap recorded");
    assert!(gap_start <= d(2025, 4, 8));
    assert!(harness.literature.served.lock().unwrap().contains("3009"));
    assert!(!harness.literature.served.lock().unwrap().contains("3002"));

    let wm = Watermark::load(&runner.layout().watermark()).await.unwrap().unwrap();
    assert!(wm.date < gap_start, "watermark {} passed gap at {gap_start}", wm.date);
    assert!(wm.date >= d(2025, 3, 14));
    assert_eq!(manifest.watermark_after, Some(wm.date));

    // The next run starts before the gap and picks the record up.
    *harness.literature.failing_date.lock().unwrap() = None;
    let next = harness.runner_with(dir.path(), d(2025, 5, 2), &toml).monthly(None).await.unwrap();
    assert!(next.gaps.is_empty());
    assert!(harness.literature.served.lock().unwrap().contains("3002"));
    assert_eq!(next.watermark_after, Some(d(2025, 4, 28)));
}

#[tokio::test]
async fn test_failed_record_batch_holds_watermark_at_span_start() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let toml = format!("{CONFIG}\n[harvest]\nfetch_batch_size = 2\n");
    harness.runner_with(dir.path(), d(2025, 4, 1), &toml).bootstrap(None).await.unwrap();

    *harness.literature.failing_id.lock().unwrap() = Some("3005".to_string());
    let runner = harness.runner_with(dir.path(), d(2025, 5, 1), &toml);
    let manifest = runner.monthly(None).await.unwrap();

    assert!(manifest.gaps.iter().any(|g| g.stage == HarvestStage::Fetch));
    assert!(manifest.counters.fetched < manifest.counters.harvested_ids);
    let corpus = snapshot::read(&runner.layout().snapshot()).await.unwrap();
    assert!(ids(&corpus).contains("3009"));

    let wm = Watermark::load(&runner.layout().watermark()).await.unwrap().unwrap();
    assert_eq!(wm.date, d(2025, 3, 14));
}

#[tokio::test]
async fn test_interrupted_bootstrap_resumes_from_journal() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let run_id = uuid::Uuid::new_v4();

    let failing = CONFIG.replace("target = 30", "target = 500");
    harness
        .runner_with(dir.path(), d(2025, 4, 1), &failing)
        .bootstrap(Some(run_id))
        .await
        .unwrap_err();
    let pages_before = harness.literature.page_calls.load(Ordering::SeqCst);
    assert!(pages_before > 0);
    assert!(dir.path().join("runs").join(run_id.to_string()).join("harvest.jsonl").exists());

    let runner = harness.runner(dir.path(), d(2025, 4, 1));
    let manifest = runner.bootstrap(Some(run_id)).await.unwrap();

    assert_eq!(manifest.run_id, run_id);
    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(manifest.resumed_leaves, 2);
    assert_eq!(harness.literature.page_calls.load(Ordering::SeqCst), pages_before);
    assert_eq!(manifest.counters.harvested_ids, 61);
    assert_eq!(manifest.counters.selected, 30);
}
