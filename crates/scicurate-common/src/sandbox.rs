use reqwest::{Client, ClientBuilder};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;
use crate::error::CurateError;

const USER_AGENT: &str = concat!("scicurate/", env!("CARGO_PKG_VERSION"), " (corpus curation)");

/// An HTTP client capped to approved domains.
///
/// Metadata APIs are always reached through an allowlisted client. Full-text
/// downloads follow publisher and repository links to arbitrary hosts, so that
/// client is built with [`SandboxClient::open`].
#[derive(Debug, Clone)]
pub struct SandboxClient {
    client: Client,
    allowlist: HashSet<String>,
    open: bool,
}

impl SandboxClient {
    /// Creates a client with the default allowlist of literature and full-text APIs.
    pub fn new(timeout: Duration) -> Result<Self, CurateError> {
        let mut allowlist = HashSet::new();
        let domains = [
            "eutils.ncbi.nlm.nih.gov", // PubMed / PMC E-utilities
            "www.ncbi.nlm.nih.gov",    // PMC ID converter
            "pmc.ncbi.nlm.nih.gov",    // PMC
            "www.ebi.ac.uk",           // Europe PMC
            "api.unpaywall.org",       // Unpaywall
            "localhost",
            "127.0.0.1",
        ];
        for d in domains {
            allowlist.insert(d.to_string());
        }

        Ok(Self { client: build_client(timeout)?, allowlist, open: false })
    }

    /// Creates a client that accepts any http(s) host.
    pub fn open(timeout: Duration) -> Result<Self, CurateError> {
        Ok(Self { client: build_client(timeout)?, allowlist: HashSet::new(), open: true })
    }

    /// Appends an exact hostname to the allowlist.
    pub fn allow_domain(&mut self, domain: &str) {
        self.allowlist.insert(domain.to_string());
    }

    /// Validates if a URL is permitted under the current sandbox policy.
    pub fn is_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else { return false };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = parsed.host_str() else { return false };
        if self.open {
            return true;
        }
        self.allowlist
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
    }

    pub fn get(&self, url: &str) -> Result<reqwest::RequestBuilder, CurateError> {
        if !self.is_allowed(url) {
            return Err(CurateError::SecurityError(format!(
                "Network capabilities capped: domain not in allowlist for URL {url}"
            )));
        }
        Ok(self.client.get(url))
    }
}

fn build_client(timeout: Duration) -> Result<Client, CurateError> {
    ClientBuilder::new()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| CurateError::Config(format!("Failed to build HTTP client: {e}")))
}
