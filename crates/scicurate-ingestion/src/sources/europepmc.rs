//! Europe PMC full-text source.
//!
//! Endpoints:
//!   search:       https://www.ebi.ac.uk/europepmc/webservices/rest/search
//!   fullTextXML:  https://www.ebi.ac.uk/europepmc/webservices/rest/{pmcid}/fullTextXML

use async_trait::async_trait;
use scicurate_common::{FetchError, RateLimitedClient};
use tracing::{debug, instrument};

use crate::fulltext::extract::jats_body_text;
use crate::fulltext::validate::StructuralValidator;
use crate::fulltext::{AttemptTag, FulltextSource, SourceAttempt, SourceResult};
use crate::models::Record;

const EPMC_REST_BASE: &str = "https://www.ebi.ac.uk/europepmc/webservices/rest";

const SOURCE: &str = "europepmc";

pub struct EuropePmcClient {
    http: RateLimitedClient,
    rest_base: String,
}

impl EuropePmcClient {
    pub fn new(http: RateLimitedClient) -> Self {
        Self { http, rest_base: EPMC_REST_BASE.to_string() }
    }

    pub fn with_base_url(mut self, rest_base: impl Into<String>) -> Self {
        self.rest_base = rest_base.into().trim_end_matches('/').to_string();
        self
    }

    /// PMCID Europe PMC associates with a MEDLINE record.
    #[instrument(skip(self))]
    pub async fn lookup_pmcid(&self, pmid: &str) -> Result<Option<String>, FetchError> {
        let params = [
            ("query", format!("EXT_ID:{pmid} AND SRC:MED")),
            ("resultType", "lite".to_string()),
            ("format", "json".to_string()),
        ];

        let url = format!("{}/search", self.rest_base);
        let resp: serde_json::Value = self
            .http
            .fetch(&url, &params)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::terminal(&url, None, format!("invalid search JSON: {e}")))?;

        Ok(pmcid_from_search(&resp))
    }

    async fn fetch_full_text_xml(&self, pmcid: &str) -> Result<String, FetchError> {
        let url = format!("{}/{pmcid}/fullTextXML", self.rest_base);
        self.http
            .fetch(&url, &[])
            .await?
            .text()
            .await
            .map_err(|e| FetchError::terminal(&url, None, format!("fullTextXML body: {e}")))
    }
}

pub fn pmcid_from_search(resp: &serde_json::Value) -> Option<String> {
    resp["resultList"]["result"]
        .as_array()?
        .iter()
        .find_map(|r| r["pmcid"].as_str())
        .map(String::from)
}

#[async_trait]
impl FulltextSource for EuropePmcClient {
    fn name(&self) -> &'static str {
        SOURCE
    }

    #[instrument(skip(self, record, validator), fields(id = %record.id))]
    async fn fetch(&self, record: &Record, validator: &StructuralValidator) -> SourceResult {
        let pmcid = match &record.pmcid {
            Some(p) => p.clone(),
            None => match self.lookup_pmcid(&record.id).await {
                Ok(Some(p)) => p,
                Ok(None) => {
                    return SourceResult::single(
                        SourceAttempt::new(SOURCE, AttemptTag::NoIdentifier).with_detail("no pmcid"),
                    )
                }
                Err(e) => return SourceResult::single(SourceAttempt::from_fetch_error(SOURCE, &e)),
            },
        };

        let xml = match self.fetch_full_text_xml(&pmcid).await {
            Ok(x) if !x.trim().is_empty() => x,
            Ok(_) => {
                return SourceResult::single(
                    SourceAttempt::new(SOURCE, AttemptTag::NotFound).with_detail("empty fullTextXML"),
                )
            }
            Err(e) => return SourceResult::single(SourceAttempt::from_fetch_error(SOURCE, &e)),
        };

        match jats_body_text(&xml) {
            Some(text) => {
                debug!(%pmcid, chars = text.len(), "Europe PMC body extracted");
                SourceResult::validated(SOURCE, text, validator)
            }
            None => SourceResult::single(
                SourceAttempt::new(SOURCE, AttemptTag::ExtractionFailed).with_detail(format!("{pmcid}: no <body>")),
            ),
        }
    }
}
