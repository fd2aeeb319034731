use thiserror::Error;

/// Failures that stop the monitor before (or instead of) running the retry loop.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("no product pages configured")]
    EmptyUrlSet,

    #[error("invalid product page URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid stock selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("content rule list failed to compile: {0}")]
    ContentRules(String),

    #[error("webdriver unavailable: {0}")]
    WebDriver(String),
}
