#![forbid(unsafe_code)]

//! Error kinds shared across the tubevault core.
//!
//! Binaries wrap these in `anyhow` for context; the core keeps them typed so
//! callers can branch on classification (retry, skip, sleep, abort).

use std::time::Duration;

/// Core error type. Storage failures are fatal to the invocation; most other
/// kinds are handled at the batch loop and never propagate past it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The catalog database could not be opened or a statement failed.
    #[error("catalog unavailable: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed extractor output: {0}")]
    ExtractorJson(#[from] serde_json::Error),

    /// Connection reset / temporary DNS failure; retried with back-off.
    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    /// The extractor exited successfully but produced zero entries.
    #[error("extractor returned no entries")]
    ExtractorEmpty,

    /// Zero entries persisted across every retry attempt.
    #[error("listing for '{0}' was empty after all retries")]
    EmptyList(String),

    /// The item sits behind a paywall; collected into its own bucket.
    #[error("payment required for '{0}'")]
    PaymentRequired(String),

    /// Unavailable / members-only / age-gated / private; the item is marked
    /// skip and the batch continues.
    #[error("item unavailable: {0}")]
    Unavailable(String),

    /// Live or upcoming broadcast. Carries the parsed lead time when the
    /// extractor message stated one.
    #[error("item is live or upcoming")]
    LiveOrUpcoming(Option<Duration>),

    #[error("invalid alias '{0}': must be ASCII alphanumeric")]
    InvalidAlias(String),

    #[error("invalid name '{0}': not in canonical form")]
    InvalidName(String),

    #[error("source or item '{0}' not found in catalog")]
    NotFound(String),

    #[error("unrecognized URL: {0}")]
    BadUrl(String),

    #[error("unrecognized sleep instant '{0}': expected 'YYYY-MM-DD HH:MM:SS' or '<d|h|m|s>+N'")]
    InvalidSleep(String),

    /// Operator interrupt; aborts the current batch, committed work stands.
    #[error("interrupted")]
    Interrupted,

    /// External tool exited with a failure that fits no other class.
    #[error("{tool} failed: {detail}")]
    Tool { tool: &'static str, detail: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the network-layer faults that the back-off loop retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkTransient(_))
    }
}
