use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("invalid feed: {0}")]
    Feed(String),
}

/// Outcome of a single provider call that did not produce a usable answer.
///
/// None of these are fatal to a record: the geocoder moves on to the next
/// candidate and keeps the error for diagnostics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("provider call timed out after {0} ms")]
    Timeout(u64),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transient(_) => "transient",
            ProviderError::RateLimited => "rate_limited",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Malformed(_) => "malformed",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProviderError::Timeout(0);
        }
        if err.status().map(|s| s.as_u16()) == Some(429) {
            return ProviderError::RateLimited;
        }
        if err.is_decode() {
            return ProviderError::Malformed(err.to_string());
        }
        ProviderError::Transient(err.to_string())
    }
}
