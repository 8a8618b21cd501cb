use thiserror::Error;

/// Request-path errors, propagated as tagged variants rather than panics.
///
/// Background workers never surface these to callers; they log and feed
/// their own backoff state instead.
#[derive(Debug, Error)]
pub enum ZipError {
    /// Malformed URL, malformed custom code or negative encoder input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Custom short code already taken.
    #[error("short code '{0}' is already taken")]
    Conflict(String),

    /// Unknown short code.
    #[error("short URL not found")]
    NotFound,

    /// Lock contention exhausted retries or a degraded backend answered.
    /// The caller may retry.
    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// No backend could serve the request; no recovery possible here.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Schema violation, decoding failure or other unexpected state.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ZipResult<T> = Result<T, ZipError>;
