//! Unpaywall open-access locator.
//!
//! API endpoint: https://api.unpaywall.org/v2/{doi}?email={email}
//!
//! Candidate locations are tried in three passes: direct PDFs, then direct
//! HTML articles, then a scrape of each landing page. Repository copies are
//! tried before publisher copies within each pass. Downloads go through a
//! separate open client since OA links point at arbitrary hosts.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use scicurate_common::{FetchError, RateLimitedClient};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::fulltext::extract::{html_article_text, html_page_text, is_pdf, pdf_text_blocking};
use crate::fulltext::validate::StructuralValidator;
use crate::fulltext::{AttemptTag, FulltextSource, SourceAttempt, SourceResult};
use crate::models::Record;

const UNPAYWALL_URL: &str = "https://api.unpaywall.org/v2";

const SOURCE: &str = "unpaywall";

#[derive(Debug, Clone, Deserialize)]
pub struct UnpaywallResponse {
    pub doi: Option<String>,
    #[serde(default)]
    pub is_oa: bool,
    pub best_oa_location: Option<OaLocation>,
    #[serde(default)]
    pub oa_locations: Vec<OaLocation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OaLocation {
    pub url: Option<String>,
    pub url_for_pdf: Option<String>,
    pub url_for_landing_page: Option<String>,
    pub host_type: Option<String>,
}

impl OaLocation {
    fn is_repository(&self) -> bool {
        self.host_type.as_deref() == Some("repository")
    }
}

/// Candidate URLs in the order they will be tried.
#[derive(Debug, Default, PartialEq)]
pub struct Candidates {
    pub pdf: Vec<String>,
    pub html: Vec<String>,
    pub landing: Vec<String>,
}

impl UnpaywallResponse {
    /// Repository locations first, then the rest, at most `max` per pass.
    pub fn candidates(&self, max: usize) -> Candidates {
        let mut ordered: Vec<&OaLocation> = self.oa_locations.iter().filter(|l| l.is_repository()).collect();
        ordered.extend(self.oa_locations.iter().filter(|l| !l.is_repository()));
        if let Some(best) = &self.best_oa_location {
            ordered.push(best);
        }

        let mut seen = HashSet::new();
        let mut out = Candidates::default();
        for loc in &ordered {
            if let Some(u) = &loc.url_for_pdf {
                if out.pdf.len() < max && seen.insert(u.clone()) {
                    out.pdf.push(u.clone());
                }
            }
        }
        for loc in &ordered {
            if let Some(u) = &loc.url {
                if out.html.len() < max && seen.insert(u.clone()) {
                    out.html.push(u.clone());
                }
            }
        }
        // Landing pages get a second, scraping pass even if fetched as HTML.
        let mut seen_landing = HashSet::new();
        for loc in &ordered {
            if let Some(u) = &loc.url_for_landing_page {
                if out.landing.len() < max && seen_landing.insert(u.clone()) {
                    out.landing.push(u.clone());
                }
            }
        }
        out
    }
}

/// `citation_pdf_url` meta tag of a landing page, resolved against the page URL.
pub fn citation_pdf_url(html: &str, page_url: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let meta = Selector::parse(r#"meta[name="citation_pdf_url"]"#).ok()?;
    let href = doc.select(&meta).find_map(|m| m.value().attr("content"))?;
    let base = Url::parse(page_url).ok()?;
    base.join(href.trim()).ok().map(|u| u.to_string())
}

struct Download {
    content_type: Option<String>,
    bytes: Vec<u8>,
}

pub struct UnpaywallClient {
    api: RateLimitedClient,
    downloads: RateLimitedClient,
    email: String,
    max_candidates: usize,
    api_base: String,
}

impl UnpaywallClient {
    pub fn new(api: RateLimitedClient, downloads: RateLimitedClient, email: String, max_candidates: usize) -> Self {
        Self { api, downloads, email, max_candidates: max_candidates.max(1), api_base: UNPAYWALL_URL.to_string() }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    #[instrument(skip(self))]
    pub async fn lookup(&self, doi: &str) -> Result<UnpaywallResponse, FetchError> {
        let url = format!("{}/{}", self.api_base, doi.trim());
        self.api
            .fetch(&url, &[("email", self.email.clone())])
            .await?
            .json()
            .await
            .map_err(|e| FetchError::terminal(&url, None, format!("invalid Unpaywall JSON: {e}")))
    }

    async fn download(&self, url: &str) -> Result<Download, FetchError> {
        let resp = self.downloads.fetch(url, &[]).await?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchError::terminal(url, None, format!("body: {e}")))?
            .to_vec();
        Ok(Download { content_type, bytes })
    }

    async fn try_pdf(&self, url: &str, validator: &StructuralValidator, out: &mut SourceResult) -> bool {
        let dl = match self.download(url).await {
            Ok(d) => d,
            Err(e) => {
                out.attempts.push(SourceAttempt::from_fetch_error(SOURCE, &e).with_detail(url));
                return false;
            }
        };
        if !is_pdf(dl.content_type.as_deref(), &dl.bytes) {
            let ct = dl.content_type.unwrap_or_default();
            out.attempts.push(
                SourceAttempt::new(SOURCE, AttemptTag::InvalidPdf).with_detail(format!("{url} ({ct})")),
            );
            return false;
        }
        self.accept_pdf(dl.bytes, url, validator, out).await
    }

    async fn accept_pdf(&self, bytes: Vec<u8>, url: &str, validator: &StructuralValidator, out: &mut SourceResult) -> bool {
        match pdf_text_blocking(bytes).await {
            Ok(text) => self.accept(text, url, validator, out),
            Err(e) => {
                out.attempts.push(
                    SourceAttempt::new(SOURCE, AttemptTag::ExtractionFailed).with_detail(format!("{url}: {e}")),
                );
                false
            }
        }
    }

    async fn try_html(
        &self,
        url: &str,
        landing: bool,
        validator: &StructuralValidator,
        out: &mut SourceResult,
    ) -> bool {
        let dl = match self.download(url).await {
            Ok(d) => d,
            Err(e) => {
                out.attempts.push(SourceAttempt::from_fetch_error(SOURCE, &e).with_detail(url));
                return false;
            }
        };
        if is_pdf(dl.content_type.as_deref(), &dl.bytes) {
            return self.accept_pdf(dl.bytes, url, validator, out).await;
        }

        let html = String::from_utf8_lossy(&dl.bytes);
        if landing {
            if let Some(pdf_url) = citation_pdf_url(&html, url) {
                debug!(%pdf_url, "Landing page advertises a PDF");
                if self.try_pdf(&pdf_url, validator, out).await {
                    return true;
                }
            }
        }

        let mut text = html_article_text(&html);
        if landing && !validator.check(&text).valid {
            text = html_page_text(&html);
        }
        if text.trim().is_empty() {
            out.attempts.push(SourceAttempt::new(SOURCE, AttemptTag::ExtractionFailed).with_detail(url));
            return false;
        }
        self.accept(text, url, validator, out)
    }

    fn accept(&self, text: String, url: &str, validator: &StructuralValidator, out: &mut SourceResult) -> bool {
        let result = SourceResult::validated(SOURCE, text, validator);
        out.attempts
            .extend(result.attempts.into_iter().map(|a| if a.detail.is_none() { a.with_detail(url) } else { a }));
        match result.body {
            Some(body) => {
                out.body = Some(body);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl FulltextSource for UnpaywallClient {
    fn name(&self) -> &'static str {
        SOURCE
    }

    #[instrument(skip(self, record, validator), fields(id = %record.id))]
    async fn fetch(&self, record: &Record, validator: &StructuralValidator) -> SourceResult {
        let Some(doi) = record.doi.as_deref().filter(|d| !d.trim().is_empty()) else {
            return SourceResult::single(SourceAttempt::new(SOURCE, AttemptTag::NoIdentifier).with_detail("no doi"));
        };

        let resp = match self.lookup(doi).await {
            Ok(r) => r,
            Err(e) => return SourceResult::single(SourceAttempt::from_fetch_error(SOURCE, &e)),
        };
        if !resp.is_oa {
            return SourceResult::single(SourceAttempt::new(SOURCE, AttemptTag::NotFound).with_detail("not open access"));
        }

        let candidates = resp.candidates(self.max_candidates);
        debug!(
            pdf = candidates.pdf.len(),
            html = candidates.html.len(),
            landing = candidates.landing.len(),
            "Unpaywall candidates"
        );

        let mut out = SourceResult::default();
        for url in &candidates.pdf {
            if self.try_pdf(url, validator, &mut out).await {
                return out;
            }
        }
        for url in &candidates.html {
            if self.try_html(url, false, validator, &mut out).await {
                return out;
            }
        }
        for url in &candidates.landing {
            if self.try_html(url, true, validator, &mut out).await {
                return out;
            }
        }

        if out.attempts.is_empty() {
            out.attempts.push(SourceAttempt::new(SOURCE, AttemptTag::NotFound).with_detail("no oa locations"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response() -> UnpaywallResponse {
        serde_json::from_value(json!({
            "doi": "10.1000/xyz",
            "is_oa": true,
            "best_oa_location": {
                "url": "https://publisher.example/article",
                "url_for_pdf": "https://publisher.example/article.pdf",
                "url_for_landing_page": "https://publisher.example/article",
                "host_type": "publisher"
            },
            "oa_locations": [
                {
                    "url": "https://publisher.example/article",
                    "url_for_pdf": "https://publisher.example/article.pdf",
                    "url_for_landing_page": "https://publisher.example/article",
                    "host_type": "publisher"
                },
                {
                    "url": "https://repo.example/record/1",
                    "url_for_pdf": "https://repo.example/record/1/file.pdf",
                    "url_for_landing_page": "https://repo.example/record/1",
                    "host_type": "repository"
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_candidates_prefer_repository_and_dedup() {
        let c = response().candidates(6);
        assert_eq!(
            c.pdf,
            vec!["https://repo.example/record/1/file.pdf", "https://publisher.example/article.pdf"]
        );
        assert_eq!(c.html, vec!["https://repo.example/record/1", "https://publisher.example/article"]);
        assert_eq!(c.landing, vec!["https://repo.example/record/1", "https://publisher.example/article"]);
    }

    #[test]
    fn test_candidates_respect_max() {
        let c = response().candidates(1);
        assert_eq!(c.pdf.len(), 1);
        assert_eq!(c.html.len(), 1);
    }

    #[test]
    fn test_citation_pdf_url_resolves_relative() {
        let html = r#"<html><head><meta name="citation_pdf_url" content="/content/1.pdf"></head></html>"#;
        assert_eq!(
            citation_pdf_url(html, "https://journal.example/article/1").as_deref(),
            Some("https://journal.example/content/1.pdf")
        );
        assert!(citation_pdf_url("<html></html>", "https://journal.example/").is_none());
    }
}
