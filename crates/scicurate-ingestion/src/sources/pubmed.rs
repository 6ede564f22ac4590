//! PubMed E-utilities client.
//!
//! Endpoints used:
//!   esearch: https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi
//!   efetch:  https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi
//!
//! esearch refuses `retstart` beyond its 10,000-record window, which is why
//! the harvester bisects date ranges before paginating.

use async_trait::async_trait;
use chrono::NaiveDate;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use scicurate_common::{FetchError, RateLimitedClient};
use tracing::{debug, instrument, warn};

use crate::models::{DateRange, RawRecord};
use super::LiteratureApi;

pub const ESEARCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi";
pub const EFETCH_URL:  &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

/// Maximum number of records esearch will page through for one query.
pub const PUBMED_WINDOW: usize = 10_000;

pub struct PubMedClient {
    http: RateLimitedClient,
    api_key: Option<String>,
    email: Option<String>,
}

impl PubMedClient {
    pub fn new(http: RateLimitedClient, api_key: Option<String>, email: Option<String>) -> Self {
        Self { http, api_key, email }
    }

    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("db", "pubmed".to_string()), ("tool", "scicurate".to_string())];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        if let Some(email) = &self.email {
            params.push(("email", email.clone()));
        }
        params
    }

    fn search_params(&self, query: &str, range: &DateRange) -> Vec<(&'static str, String)> {
        let mut params = self.base_params();
        params.push(("term", query.to_string()));
        params.push(("datetype", "pdat".to_string()));
        params.push(("mindate", range.start.format("%Y/%m/%d").to_string()));
        params.push(("maxdate", range.end.format("%Y/%m/%d").to_string()));
        params.push(("retmode", "json".to_string()));
        params
    }

    async fn esearch(&self, params: &[(&'static str, String)]) -> Result<serde_json::Value, FetchError> {
        let resp: serde_json::Value = self
            .http
            .fetch(ESEARCH_URL, params)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::terminal(ESEARCH_URL, None, format!("invalid esearch JSON: {e}")))?;

        if let Some(err) = resp["esearchresult"]["ERROR"].as_str() {
            return Err(FetchError::terminal(ESEARCH_URL, None, format!("esearch error: {err}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl LiteratureApi for PubMedClient {
    #[instrument(skip(self))]
    async fn count(&self, query: &str, range: &DateRange) -> Result<usize, FetchError> {
        let mut params = self.search_params(query, range);
        params.push(("rettype", "count".to_string()));

        let resp = self.esearch(&params).await?;
        let count = resp["esearchresult"]["count"]
            .as_str()
            .and_then(|c| c.parse::<usize>().ok())
            .ok_or_else(|| FetchError::terminal(ESEARCH_URL, None, "esearch response missing count"))?;

        debug!(count, %range, "PubMed count");
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn search_page(
        &self,
        query: &str,
        range: &DateRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, FetchError> {
        let mut params = self.search_params(query, range);
        params.push(("retstart", offset.to_string()));
        params.push(("retmax", limit.to_string()));

        let resp = self.esearch(&params).await?;
        let ids: Vec<String> = resp["esearchresult"]["idlist"]
            .as_array()
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        debug!(n = ids.len(), offset, "PubMed esearch page");
        Ok(ids)
    }

    #[instrument(skip(self, ids), fields(n = ids.len()))]
    async fn fetch_records(&self, ids: &[String]) -> Result<Vec<RawRecord>, FetchError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut params = self.base_params();
        params.push(("id", ids.join(",")));
        params.push(("rettype", "abstract".to_string()));
        params.push(("retmode", "xml".to_string()));

        let xml = self
            .http
            .fetch(EFETCH_URL, &params)
            .await?
            .text()
            .await
            .map_err(|e| FetchError::terminal(EFETCH_URL, None, format!("efetch body: {e}")))?;

        Ok(parse_pubmed_xml(&xml))
    }
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

fn parse_month(m: &str) -> Option<u32> {
    if let Ok(n) = m.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    const MONTHS: [&str; 12] = ["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"];
    let lower = m.to_lowercase();
    MONTHS.iter().position(|p| lower.starts_with(p)).map(|i| i as u32 + 1)
}

#[derive(Default)]
struct PubDateParts {
    year: Option<i32>,
    month: Option<u32>,
    day: Option<u32>,
    medline: Option<String>,
}

impl PubDateParts {
    fn resolve(&self) -> (Option<i32>, Option<NaiveDate>) {
        let year = self.year.or_else(|| {
            self.medline
                .as_deref()
                .and_then(|m| m.get(..4))
                .and_then(|y| y.parse().ok())
        });
        let date = year.and_then(|y| {
            NaiveDate::from_ymd_opt(y, self.month.unwrap_or(1), self.day.unwrap_or(1))
        });
        (year, date)
    }
}

/// Parse PubMed XML (efetch abstract mode) into raw records.
/// Handles the <PubmedArticleSet><PubmedArticle> structure; malformed XML
/// stops parsing and keeps what was read so far.
pub fn parse_pubmed_xml(xml: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current: Option<RawRecord> = None;
    let mut date = PubDateParts::default();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut article_id_type: Option<String> = None;
    let mut abstract_parts: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"PubmedArticle" => {
                        current = Some(RawRecord::default());
                        date = PubDateParts::default();
                        abstract_parts.clear();
                    }
                    b"ArticleId" => article_id_type = attr(e, b"IdType"),
                    b"AbstractText" => abstract_parts.push(String::new()),
                    _ => {}
                }
                path.push(name);
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                let Some(ref mut r) = current else { buf.clear(); continue };
                let in_refs = path.iter().any(|p| {
                    p.as_slice() == b"ReferenceList" || p.as_slice() == b"CommentsCorrectionsList"
                });
                let in_pubdate = path.iter().any(|p| p.as_slice() == b"PubDate");
                let in_abstract_text = path.iter().any(|p| p.as_slice() == b"AbstractText");
                let in_article_title = path.iter().any(|p| p.as_slice() == b"ArticleTitle");

                match path.last().map(|p| p.as_slice()) {
                    Some(b"PMID") if r.pmid.is_none() && !in_refs => r.pmid = Some(text),
                    Some(b"Title") if path.iter().any(|p| p.as_slice() == b"Journal") => {
                        r.journal = Some(text)
                    }
                    Some(b"PublicationType") => r.publication_types.push(text),
                    Some(b"ArticleId") if !in_refs => match article_id_type.as_deref() {
                        Some("doi") if r.doi.is_none() => r.doi = Some(text),
                        Some("pmc") if r.pmcid.is_none() => r.pmcid = Some(text),
                        _ => {}
                    },
                    Some(b"Year") if in_pubdate => date.year = text.parse().ok(),
                    Some(b"Month") if in_pubdate => date.month = parse_month(&text),
                    Some(b"Day") if in_pubdate => date.day = text.parse().ok(),
                    Some(b"MedlineDate") if in_pubdate => date.medline = Some(text),
                    _ if in_article_title => {
                        if !r.title.is_empty() {
                            r.title.push(' ');
                        }
                        r.title.push_str(&text);
                    }
                    _ if in_abstract_text => {
                        if let Some(part) = abstract_parts.last_mut() {
                            if !part.is_empty() {
                                part.push(' ');
                            }
                            part.push_str(&text);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                path.pop();
                if e.name().as_ref() == b"PubmedArticle" {
                    if let Some(mut r) = current.take() {
                        let (year, pub_date) = date.resolve();
                        r.pub_year = year;
                        r.pub_date = pub_date;
                        let joined = abstract_parts
                            .iter()
                            .filter(|p| !p.trim().is_empty())
                            .cloned()
                            .collect::<Vec<_>>()
                            .join("\n");
                        r.abstract_text = (!joined.is_empty()).then_some(joined);
                        records.push(r);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("XML parse error: {}", e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    records
}
