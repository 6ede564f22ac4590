//! PubMed Central full-text source.
//!
//! The PMCID comes from the record when PubMed supplied one, otherwise from
//! the NCBI ID converter. The body is pulled as JATS via efetch (db=pmc).

use async_trait::async_trait;
use scicurate_common::{FetchError, RateLimitedClient};
use tracing::{debug, instrument};

use crate::fulltext::extract::jats_body_text;
use crate::fulltext::validate::StructuralValidator;
use crate::fulltext::{AttemptTag, FulltextSource, SourceAttempt, SourceResult};
use crate::models::Record;
use super::pubmed::EFETCH_URL;

pub const IDCONV_URL: &str = "https://www.ncbi.nlm.nih.gov/pmc/utils/idconv/v1.0/";

const SOURCE: &str = "pmc";

pub struct PmcClient {
    http: RateLimitedClient,
    api_key: Option<String>,
    email: Option<String>,
    idconv_url: String,
    efetch_url: String,
}

impl PmcClient {
    pub fn new(http: RateLimitedClient, api_key: Option<String>, email: Option<String>) -> Self {
        Self { http, api_key, email, idconv_url: IDCONV_URL.to_string(), efetch_url: EFETCH_URL.to_string() }
    }

    /// Sends idconv and efetch requests to other endpoints, e.g. a mirror.
    pub fn with_endpoints(mut self, idconv_url: impl Into<String>, efetch_url: impl Into<String>) -> Self {
        self.idconv_url = idconv_url.into();
        self.efetch_url = efetch_url.into();
        self
    }

    fn identity_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("tool", "scicurate".to_string())];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        if let Some(email) = &self.email {
            params.push(("email", email.clone()));
        }
        params
    }

    /// PMCID for a PubMed id, `None` when the article has no PMC deposit.
    pub async fn resolve_pmcid(&self, pmid: &str) -> Result<Option<String>, FetchError> {
        let mut params = self.identity_params();
        params.push(("ids", pmid.to_string()));
        params.push(("format", "json".to_string()));

        let resp: serde_json::Value = self
            .http
            .fetch(&self.idconv_url, &params)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::terminal(&self.idconv_url, None, format!("invalid idconv JSON: {e}")))?;

        Ok(pmcid_from_idconv(&resp))
    }

    async fn fetch_jats(&self, pmcid: &str) -> Result<String, FetchError> {
        let mut params = self.identity_params();
        params.push(("db", "pmc".to_string()));
        params.push(("id", numeric_pmcid(pmcid).to_string()));
        params.push(("retmode", "xml".to_string()));

        self.http
            .fetch(&self.efetch_url, &params)
            .await?
            .text()
            .await
            .map_err(|e| FetchError::terminal(&self.efetch_url, None, format!("efetch body: {e}")))
    }
}

/// First PMCID in an idconv response.
pub fn pmcid_from_idconv(resp: &serde_json::Value) -> Option<String> {
    resp["records"]
        .as_array()?
        .iter()
        .find_map(|r| r["pmcid"].as_str())
        .map(String::from)
}

/// `PMC1234567` → `1234567`.
pub fn numeric_pmcid(pmcid: &str) -> &str {
    pmcid.trim().trim_start_matches("PMC").trim_start_matches("pmc")
}

#[async_trait]
impl FulltextSource for PmcClient {
    fn name(&self) -> &'static str {
        SOURCE
    }

    #[instrument(skip(self, record, validator), fields(id = %record.id))]
    async fn fetch(&self, record: &Record, validator: &StructuralValidator) -> SourceResult {
        let pmcid = match &record.pmcid {
            Some(p) => p.clone(),
            None => match self.resolve_pmcid(&record.id).await {
                Ok(Some(p)) => p,
                Ok(None) => {
                    return SourceResult::single(
                        SourceAttempt::new(SOURCE, AttemptTag::NoIdentifier).with_detail("no pmcid"),
                    )
                }
                Err(e) => return SourceResult::single(SourceAttempt::from_fetch_error(SOURCE, &e)),
            },
        };

        let xml = match self.fetch_jats(&pmcid).await {
            Ok(x) => x,
            Err(e) => return SourceResult::single(SourceAttempt::from_fetch_error(SOURCE, &e)),
        };

        match jats_body_text(&xml) {
            Some(text) => {
                debug!(%pmcid, chars = text.len(), "PMC body extracted");
                SourceResult::validated(SOURCE, text, validator)
            }
            None => SourceResult::single(
                SourceAttempt::new(SOURCE, AttemptTag::ExtractionFailed).with_detail(format!("{pmcid}: no <body>")),
            ),
        }
    }
}
