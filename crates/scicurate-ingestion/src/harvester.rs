//! Chunked harvesting against a windowed search API.
//!
//! A query whose match count exceeds the retrievable window is split by date
//! until every leaf range fits, then each leaf is paginated. No page request
//! ever reaches past the window.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::journal::HarvestJournal;
use crate::models::{DateRange, RawRecord};
use crate::sources::pubmed::PUBMED_WINDOW;
use crate::sources::LiteratureApi;
use crate::workers::WorkerPool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvesterConfig {
    /// Largest result offset the API will serve for one query.
    #[serde(default = "default_window_limit")]
    pub window_limit: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Leaves paginated concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,
}

fn default_window_limit()     -> usize { PUBMED_WINDOW }
fn default_page_size()        -> usize { 1_000 }
fn default_concurrency()      -> usize { 4 }
fn default_fetch_batch_size() -> usize { 200 }

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            window_limit: default_window_limit(),
            page_size: default_page_size(),
            concurrency: default_concurrency(),
            fetch_batch_size: default_fetch_batch_size(),
        }
    }
}

/// One configured topic and its search expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicQuery {
    pub name: String,
    pub query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestStage {
    Count,
    Page,
    Fetch,
}

/// A unit of work skipped after its retries ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestGap {
    pub topic: Option<String>,
    pub range: Option<DateRange>,
    pub stage: HarvestStage,
    pub reason: String,
}

/// A date range small enough to paginate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf {
    pub range: DateRange,
    pub count: usize,
    /// Single-day range still over the window; only the first window of
    /// results is retrievable.
    pub truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TopicHarvest {
    pub topic: String,
    pub ids: BTreeSet<String>,
    pub leaves: Vec<DateRange>,
    pub truncated: Vec<DateRange>,
    pub gaps: Vec<HarvestGap>,
    /// Leaves taken from the journal instead of the network.
    pub resumed_leaves: usize,
}

enum Planned {
    Fresh(Leaf),
    Journaled(DateRange, Vec<String>),
}

#[derive(Clone)]
pub struct Harvester {
    api: Arc<dyn LiteratureApi>,
    config: HarvesterConfig,
}

impl Harvester {
    pub fn new(api: Arc<dyn LiteratureApi>, config: HarvesterConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    /// Split `span` until every range's count fits the window.
    ///
    /// Ranges already in `journal` are returned as-is without a count request.
    async fn plan(
        &self,
        topic: &TopicQuery,
        span: DateRange,
        journal: Option<&HarvestJournal>,
        gaps: &mut Vec<HarvestGap>,
    ) -> Vec<Planned> {
        let mut planned = Vec::new();
        let mut stack = vec![span];

        while let Some(range) = stack.pop() {
            if let Some(ids) = journal.and_then(|j| j.completed(&topic.name, &range)) {
                planned.push(Planned::Journaled(range, ids.to_vec()));
                continue;
            }

            let count = match self.api.count(&topic.query, &range).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(topic = %topic.name, %range, error = %e, "Count failed, recording gap");
                    gaps.push(HarvestGap {
                        topic: Some(topic.name.clone()),
                        range: Some(range),
                        stage: HarvestStage::Count,
                        reason: e.reason_code(),
                    });
                    continue;
                }
            };

            if count <= self.config.window_limit {
                if count > 0 {
                    planned.push(Planned::Fresh(Leaf { range, count, truncated: false }));
                }
                continue;
            }

            match range.bisect() {
                Some((left, right)) => {
                    debug!(topic = %topic.name, %range, count, "Over window, bisecting");
                    // Right first so the left half is processed first.
                    stack.push(right);
                    stack.push(left);
                }
                None => {
                    warn!(
                        topic = %topic.name, %range, count,
                        window = self.config.window_limit,
                        "Single day exceeds window, results truncated"
                    );
                    planned.push(Planned::Fresh(Leaf { range, count, truncated: true }));
                }
            }
        }
        planned
    }

    /// Every id of one leaf, page by page. Stops at the first failed page.
    async fn paginate(&self, topic: &TopicQuery, leaf: Leaf) -> (Vec<String>, Option<HarvestGap>) {
        let limit = leaf.count.min(self.config.window_limit);
        let page_size = self.config.page_size.max(1);
        let mut ids = Vec::with_capacity(limit);
        let mut offset = 0;

        while offset < limit {
            let n = page_size.min(limit - offset);
            match self.api.search_page(&topic.query, &leaf.range, offset, n).await {
                Ok(page) => {
                    let got = page.len();
                    ids.extend(page);
                    if got < n {
                        break;
                    }
                }
                Err(e) => {
                    warn!(topic = %topic.name, range = %leaf.range, offset, error = %e, "Page failed, recording gap");
                    return (
                        ids,
                        Some(HarvestGap {
                            topic: Some(topic.name.clone()),
                            range: Some(leaf.range),
                            stage: HarvestStage::Page,
                            reason: e.reason_code(),
                        }),
                    );
                }
            }
            offset += n;
        }
        (ids, None)
    }

    /// Enumerate every id matching `topic` published inside `span`.
    #[instrument(skip(self, journal), fields(topic = %topic.name))]
    pub async fn harvest_topic(
        &self,
        topic: &TopicQuery,
        span: DateRange,
        journal: Option<&HarvestJournal>,
    ) -> TopicHarvest {
        let mut out = TopicHarvest { topic: topic.name.clone(), ..Default::default() };
        let planned = self.plan(topic, span, journal, &mut out.gaps).await;

        let mut fresh = Vec::new();
        for p in planned {
            match p {
                Planned::Journaled(range, ids) => {
                    out.resumed_leaves += 1;
                    out.leaves.push(range);
                    out.ids.extend(ids);
                }
                Planned::Fresh(leaf) => fresh.push(leaf),
            }
        }

        let this = self.clone();
        let query = topic.clone();
        let mut pages = WorkerPool::new(fresh, self.config.concurrency, move |leaf: Leaf| {
            let (this, query) = (this.clone(), query.clone());
            async move { this.paginate(&query, leaf).await }
        });

        while let Some((leaf, result)) = pages.next().await {
            let (ids, gap) = result.unwrap_or_else(|panic| {
                warn!(range = %leaf.range, %panic, "Leaf worker panicked, recording gap");
                (
                    Vec::new(),
                    Some(HarvestGap {
                        topic: Some(topic.name.clone()),
                        range: Some(leaf.range),
                        stage: HarvestStage::Page,
                        reason: "worker_panic".to_string(),
                    }),
                )
            });
            out.leaves.push(leaf.range);
            if leaf.truncated {
                out.truncated.push(leaf.range);
            }
            match gap {
                Some(g) => out.gaps.push(g),
                None => {
                    if let Some(j) = journal {
                        if let Err(e) = j.record(&topic.name, &leaf.range, &ids).await {
                            warn!(range = %leaf.range, error = %e, "Failed to journal leaf");
                        }
                    }
                }
            }
            out.ids.extend(ids);
        }

        out.leaves.sort();
        info!(
            ids = out.ids.len(),
            leaves = out.leaves.len(),
            resumed = out.resumed_leaves,
            truncated = out.truncated.len(),
            gaps = out.gaps.len(),
            "Topic harvested"
        );
        out
    }

    /// Bibliographic records for `ids`, fetched in batches. A failed batch is
    /// skipped and reported as a gap.
    #[instrument(skip(self, ids), fields(n = ids.len()))]
    pub async fn fetch_records(&self, ids: &[String]) -> (Vec<RawRecord>, Vec<HarvestGap>) {
        let batch = self.config.fetch_batch_size.max(1);
        let mut records = Vec::with_capacity(ids.len());
        let mut gaps = Vec::new();

        let chunks: Vec<Vec<String>> = ids.chunks(batch).map(<[String]>::to_vec).collect();
        let api = self.api.clone();
        let mut batches = WorkerPool::new(chunks, self.config.concurrency, move |chunk: Vec<String>| {
            let api = api.clone();
            async move { api.fetch_records(&chunk).await }
        });

        while let Some((chunk, result)) = batches.next().await {
            let n = chunk.len();
            let reason = match result {
                Ok(Ok(batch)) => {
                    records.extend(batch);
                    continue;
                }
                Ok(Err(e)) => e.reason_code(),
                Err(_) => "worker_panic".to_string(),
            };
            warn!(n, %reason, "Record batch failed, recording gap");
            gaps.push(HarvestGap {
                topic: None,
                range: None,
                stage: HarvestStage::Fetch,
                reason: format!("{reason} ({n} ids)"),
            });
        }

        info!(fetched = records.len(), gaps = gaps.len(), "Records fetched");
        (records, gaps)
    }
}
