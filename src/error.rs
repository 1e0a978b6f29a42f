//! Error types for the Trickster proxy

use crate::cache::CacheError;
use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, TricksterError>;

/// Error types that can occur while serving a request or starting the process
#[derive(Error, Debug)]
pub enum TricksterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unable to parse request: {0}")]
    Parse(String),

    #[error("unable to encode response: {0}")]
    Encode(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream request timed out: {0}")]
    Timeout(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("timeseries merge failed: {0}")]
    Merge(String),

    #[error("collapsed forwarding failed: {0}")]
    Collapse(String),

    #[error("no route for request: {0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed,
}

impl TricksterError {
    /// Map an error to the HTTP status code sent downstream.
    ///
    /// Parse errors are the client's fault (400), encode and merge failures
    /// are ours (500/502), and upstream failures distinguish unreachable
    /// origins (502) from deadline expiry (504).
    pub fn to_http_status(&self) -> u16 {
        match self {
            TricksterError::Parse(_) => 400,
            TricksterError::NotFound(_) => 404,
            TricksterError::MethodNotAllowed => 405,
            TricksterError::Encode(_) => 500,
            TricksterError::Config(_) => 500,
            TricksterError::Upstream(_) => 502,
            TricksterError::Merge(_) => 502,
            TricksterError::Collapse(_) => 502,
            TricksterError::Timeout(_) => 504,
            // Cache failures degrade to proxy-only before reaching the
            // client, so this mapping is a last resort.
            TricksterError::Cache(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(TricksterError::Parse("x".into()).to_http_status(), 400);
        assert_eq!(TricksterError::Upstream("x".into()).to_http_status(), 502);
        assert_eq!(TricksterError::Timeout("x".into()).to_http_status(), 504);
        assert_eq!(TricksterError::Merge("x".into()).to_http_status(), 502);
        assert_eq!(TricksterError::MethodNotAllowed.to_http_status(), 405);
    }
}
