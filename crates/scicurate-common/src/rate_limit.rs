//! Rate-limited, retrying HTTP fetches shared by every upstream client.
//!
//! Two limits apply to every request issued through one [`RateLimitedClient`]
//! (and all of its clones):
//!   - a concurrency ceiling (tokio `Semaphore`) on in-flight requests
//!   - a per-second ceiling (`governor` token bucket)
//!
//! HTTP 429, 5xx and transport timeouts are retried following the backoff
//! schedule; everything else fails immediately.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Response, StatusCode};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::sandbox::SandboxClient;

/// Throughput tier granted by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThroughputTier {
    Unauthenticated,
    Credentialed,
}

impl ThroughputTier {
    pub fn from_credential(has_key: bool) -> Self {
        if has_key { Self::Credentialed } else { Self::Unauthenticated }
    }

    /// NCBI E-utilities: 3 req/s without an API key, 10 req/s with one.
    pub fn requests_per_second(&self) -> u32 {
        match self {
            Self::Unauthenticated => 3,
            Self::Credentialed => 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub max_concurrent: usize,
    pub requests_per_second: u32,
    pub backoff: Vec<Duration>,
    pub timeout: Duration,
}

impl RateLimitPolicy {
    pub fn for_tier(tier: ThroughputTier) -> Self {
        Self {
            max_concurrent: 4,
            requests_per_second: tier.requests_per_second(),
            ..Self::default()
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            requests_per_second: ThroughputTier::Unauthenticated.requests_per_second(),
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(15),
            ],
            timeout: Duration::from_secs(30),
        }
    }
}

/// What to do with one attempt's outcome.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Done,
    Retry,
    Fail,
}

fn classify_status(status: StatusCode) -> Disposition {
    if status.is_success() {
        Disposition::Done
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Disposition::Retry
    } else {
        Disposition::Fail
    }
}

#[derive(Clone)]
pub struct RateLimitedClient {
    sandbox: SandboxClient,
    limiter: Arc<DefaultDirectRateLimiter>,
    permits: Arc<Semaphore>,
    policy: Arc<RateLimitPolicy>,
}

impl RateLimitedClient {
    pub fn new(sandbox: SandboxClient, policy: RateLimitPolicy) -> Self {
        let rps = NonZeroU32::new(policy.requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            sandbox,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
            permits: Arc::new(Semaphore::new(policy.max_concurrent.max(1))),
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// GET `url` with `query`, honouring both rate limits and the retry schedule.
    pub async fn fetch(&self, url: &str, query: &[(&str, String)]) -> Result<Response, FetchError> {
        let mut attempt = 0usize;
        loop {
            let builder = self
                .sandbox
                .get(url)
                .map_err(|e| FetchError::terminal(url, None, e.to_string()))?
                .query(query)
                .timeout(self.policy.timeout);

            let sent = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| FetchError::terminal(url, None, "rate limiter closed"))?;
                self.limiter.until_ready().await;
                builder.send().await
            };

            let (disposition, status, message) = match sent {
                Ok(resp) => {
                    let status = resp.status();
                    match classify_status(status) {
                        Disposition::Done => return Ok(resp),
                        d => (d, Some(status.as_u16()), format!("HTTP {status}")),
                    }
                }
                Err(e) if e.is_timeout() => (Disposition::Retry, None, "request timed out".to_string()),
                Err(e) if e.is_connect() => (Disposition::Retry, None, format!("connect error: {e}")),
                Err(e) => (Disposition::Fail, None, e.to_string()),
            };

            if disposition == Disposition::Retry {
                if let Some(delay) = self.policy.backoff.get(attempt).copied() {
                    attempt += 1;
                    warn!(url, ?status, attempt, delay_ms = delay.as_millis() as u64, "Retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            debug!(url, ?status, attempts = attempt + 1, "Request failed terminally");
            return Err(FetchError::terminal(url, status, message));
        }
    }
}
