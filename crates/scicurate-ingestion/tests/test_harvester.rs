//! Harvester behaviour against a synthetic windowed search API.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use scicurate_common::FetchError;
use scicurate_ingestion::harvester::{HarvestStage, Harvester, HarvesterConfig, TopicQuery};
use scicurate_ingestion::journal::HarvestJournal;
use scicurate_ingestion::models::{DateRange, RawRecord};
use scicurate_ingestion::sources::LiteratureApi;

/// In-memory database that refuses pages past its window like esearch does.
struct SyntheticApi {
    records: Vec<(String, NaiveDate)>,
    window: usize,
    fail_count_from: Option<NaiveDate>,
    fail_fetch_id: Option<String>,
    count_calls: AtomicUsize,
    page_calls: AtomicUsize,
    max_page_end: AtomicUsize,
}

impl SyntheticApi {
    fn spread(n: usize, span: DateRange, window: usize) -> Self {
        let days = span.days();
        let records = (0..n)
            .map(|i| {
                let offset = (i as i64 * days) / n as i64;
                (format!("{}", 10_000_000 + i), span.start + Duration::days(offset))
            })
            .collect();
        Self {
            records,
            window,
            fail_count_from: None,
            fail_fetch_id: None,
            count_calls: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
            max_page_end: AtomicUsize::new(0),
        }
    }

    fn matching(&self, range: &DateRange) -> Vec<&String> {
        self.records.iter().filter(|(_, d)| range.contains(*d)).map(|(id, _)| id).collect()
    }
}

#[async_trait]
impl LiteratureApi for SyntheticApi {
    async fn count(&self, _query: &str, range: &DateRange) -> Result<usize, FetchError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(from) = self.fail_count_from {
            if range.start >= from {
                return Err(FetchError::terminal("synthetic://count", Some(503), "HTTP 503"));
            }
        }
        Ok(self.matching(range).len())
    }

    async fn search_page(
        &self,
        _query: &str,
        range: &DateRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, FetchError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.max_page_end.fetch_max(offset + limit, Ordering::SeqCst);
        if offset + limit > self.window {
            return Err(FetchError::terminal("synthetic://page", Some(400), "beyond window"));
        }
        Ok(self.matching(range).into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn fetch_records(&self, ids: &[String]) -> Result<Vec<RawRecord>, FetchError> {
        if let Some(bad) = &self.fail_fetch_id {
            if ids.contains(bad) {
                return Err(FetchError::terminal("synthetic://fetch", None, "request timed out"));
            }
        }
        Ok(ids
            .iter()
            .map(|id| RawRecord { pmid: Some(id.clone()), title: format!("Title {id}"), ..Default::default() })
            .collect())
    }
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn topic() -> TopicQuery {
    TopicQuery { name: "creatine".into(), query: "creatine[tiab]".into() }
}

fn config(window: usize, page_size: usize) -> HarvesterConfig {
    HarvesterConfig { window_limit: window, page_size, concurrency: 4, fetch_batch_size: 200 }
}

#[tokio::test]
async fn test_bisection_covers_pool_larger_than_window() {
    let span = DateRange::new(d(1990, 1, 1), d(2025, 1, 1));
    let api = Arc::new(SyntheticApi::spread(25_000, span, 10_000));
    let harvester = Harvester::new(api.clone(), config(10_000, 2_500));

    let h = harvester.harvest_topic(&topic(), span, None).await;

    assert!(h.leaves.len() >= 4, "expected at least 4 leaves, got {}", h.leaves.len());
    for leaf in &h.leaves {
        assert!(api.matching(leaf).len() <= 10_000, "leaf {leaf} over window");
    }
    assert_eq!(h.ids.len(), 25_000);
    assert!(h.gaps.is_empty());
    assert!(h.truncated.is_empty());
    assert!(api.max_page_end.load(Ordering::SeqCst) <= 10_000);
}

#[tokio::test]
async fn test_leaves_partition_the_span() {
    let span = DateRange::new(d(2000, 1, 1), d(2000, 12, 31));
    let api = Arc::new(SyntheticApi::spread(500, span, 60));
    let harvester = Harvester::new(api, config(60, 25));

    let h = harvester.harvest_topic(&topic(), span, None).await;

    assert_eq!(h.ids.len(), 500);
    for pair in h.leaves.windows(2) {
        assert!(pair[0].end < pair[1].start, "leaves {} and {} overlap", pair[0], pair[1]);
    }
}

#[tokio::test]
async fn test_single_day_over_window_is_truncated() {
    let day = DateRange::new(d(2021, 6, 1), d(2021, 6, 1));
    let api = Arc::new(SyntheticApi::spread(30, day, 10));
    let harvester = Harvester::new(api.clone(), config(10, 4));

    let h = harvester.harvest_topic(&topic(), day, None).await;

    assert_eq!(h.truncated, vec![day]);
    assert_eq!(h.ids.len(), 10);
    assert!(api.max_page_end.load(Ordering::SeqCst) <= 10);
}

#[tokio::test]
async fn test_failed_count_becomes_gap_and_run_continues() {
    let span = DateRange::new(d(2020, 1, 1), d(2020, 2, 9));
    let mut api = SyntheticApi::spread(40, span, 10);
    api.fail_count_from = Some(d(2020, 1, 21));
    let harvester = Harvester::new(Arc::new(api), config(10, 5));

    let h = harvester.harvest_topic(&topic(), span, None).await;

    assert_eq!(h.gaps.len(), 1);
    assert_eq!(h.gaps[0].stage, HarvestStage::Count);
    assert_eq!(h.gaps[0].reason, "http_503");
    assert_eq!(h.ids.len(), 20);
}

#[tokio::test]
async fn test_journaled_leaves_are_not_paginated_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("harvest.jsonl");
    let span = DateRange::new(d(2010, 1, 1), d(2010, 12, 31));

    let first_api = Arc::new(SyntheticApi::spread(200, span, 50));
    let journal = HarvestJournal::open(&path).await.unwrap();
    let first = Harvester::new(first_api, config(50, 20)).harvest_topic(&topic(), span, Some(&journal)).await;
    assert_eq!(first.resumed_leaves, 0);

    let second_api = Arc::new(SyntheticApi::spread(200, span, 50));
    let journal = HarvestJournal::open(&path).await.unwrap();
    let second = Harvester::new(second_api.clone(), config(50, 20))
        .harvest_topic(&topic(), span, Some(&journal))
        .await;

    assert_eq!(second.resumed_leaves, first.leaves.len());
    assert_eq!(second_api.page_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.ids, first.ids);
}

#[tokio::test]
async fn test_failed_fetch_batch_is_skipped() {
    let span = DateRange::new(d(2020, 1, 1), d(2020, 1, 5));
    let mut api = SyntheticApi::spread(5, span, 100);
    api.fail_fetch_id = Some("10000002".to_string());
    let mut cfg = config(100, 100);
    cfg.fetch_batch_size = 2;
    let harvester = Harvester::new(Arc::new(api), cfg);

    let ids: Vec<String> = (0..5).map(|i| format!("{}", 10_000_000 + i)).collect();
    let (records, gaps) = harvester.fetch_records(&ids).await;

    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].stage, HarvestStage::Fetch);
    let got: BTreeSet<_> = records.iter().filter_map(|r| r.pmid.clone()).collect();
    assert_eq!(got.len(), 3);
    assert!(!got.contains("10000002"));
}
