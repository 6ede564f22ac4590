use thiserror::Error;

#[derive(Debug, Error)]
pub enum CurateError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error: {0}")]
    Xml(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CurateError>;

/// Failure of a single outbound request after the retry policy gave up.
///
/// `retryable` tells the caller whether the failure class is transient
/// (throttling, 5xx, timeout). Once the client has exhausted its own retries
/// it surfaces the error with `retryable: false`, so callers never loop again.
#[derive(Debug, Clone, Error)]
#[error("fetch failed for {url}: {message} (status: {status:?}, retryable: {retryable})")]
pub struct FetchError {
    pub url: String,
    pub status: Option<u16>,
    pub retryable: bool,
    pub message: String,
}

impl FetchError {
    pub fn terminal(url: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            status,
            retryable: false,
            message: message.into(),
        }
    }

    /// Short reason code recorded in run manifests.
    pub fn reason_code(&self) -> String {
        match self.status {
            Some(429) => "throttled".to_string(),
            Some(s) => format!("http_{s}"),
            None if self.message.contains("timed out") => "timeout".to_string(),
            None => "transport".to_string(),
        }
    }
}
