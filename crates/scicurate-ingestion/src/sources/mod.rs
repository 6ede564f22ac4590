//! Literature and full-text source clients.

pub mod europepmc;
pub mod pmc;
pub mod pubmed;
pub mod unpaywall;

use async_trait::async_trait;
use scicurate_common::FetchError;

use crate::models::{DateRange, RawRecord};

/// Paginated literature search API bounded by a retrievable result window.
#[async_trait]
pub trait LiteratureApi: Send + Sync {
    /// Number of records matching `query` published inside `range`.
    async fn count(&self, query: &str, range: &DateRange) -> Result<usize, FetchError>;

    /// Identifiers `offset .. offset + limit` of the result set.
    async fn search_page(
        &self,
        query: &str,
        range: &DateRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, FetchError>;

    /// Full bibliographic records for a batch of identifiers.
    async fn fetch_records(&self, ids: &[String]) -> Result<Vec<RawRecord>, FetchError>;
}
