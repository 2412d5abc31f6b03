use std::time::Duration;

/// Failures while driving or reading a rendered page.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("no element matches `{selector}`")]
    ElementNotFound { selector: String },

    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("`{selector}` shows no data for years {years:?}")]
    NoData { selector: String, years: Vec<i32> },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("browser error: {0}")]
    Browser(String),
}

impl ScrapeError {
    pub fn element_not_found(selector: impl Into<String>) -> Self {
        ScrapeError::ElementNotFound {
            selector: selector.into(),
        }
    }
}

/// Failures reported by the spreadsheet backend for one append attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppendError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("network failure: {0}")]
    Network(String),
}

impl AppendError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AppendError::RateLimited(_))
    }
}
