#![forbid(unsafe_code)]

use thiserror::Error;

/// Centralized error type for `kinema-net`.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("timeout")]
    Timeout,

    #[error("invalid range header: {0}")]
    InvalidRange(String),

    #[error("request failed after {max_retries} retries: {source}")]
    RetryExhausted {
        max_retries: u32,
        source: Box<NetError>,
    },
}

impl NetError {
    pub fn http<S: Into<String>>(msg: S) -> Self {
        Self::Http(msg.into())
    }

    pub fn http_status(status: u16, url: String) -> Self {
        Self::HttpStatus { status, url }
    }

    /// Whether this error is transient: retried internally with backoff,
    /// never surfaced unless retries are exhausted.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::Http(msg) => {
                msg.contains("timeout") || msg.contains("connection") || msg.contains("network")
            }
            NetError::Timeout => true,
            NetError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            NetError::RetryExhausted { .. } | NetError::InvalidRange(_) => false,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Timeout)
    }

    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            NetError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for NetError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(error.to_string())
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(NetError::Timeout, true)]
    #[case(NetError::HttpStatus { status: 500, url: String::new() }, true)]
    #[case(NetError::HttpStatus { status: 503, url: String::new() }, true)]
    #[case(NetError::HttpStatus { status: 429, url: String::new() }, true)]
    #[case(NetError::HttpStatus { status: 408, url: String::new() }, true)]
    #[case(NetError::HttpStatus { status: 404, url: String::new() }, false)]
    #[case(NetError::HttpStatus { status: 400, url: String::new() }, false)]
    #[case(NetError::Http("connection reset".to_string()), true)]
    #[case(NetError::Http("tls handshake".to_string()), false)]
    #[case(NetError::InvalidRange("bad".to_string()), false)]
    fn retryability_classification(#[case] error: NetError, #[case] expected: bool) {
        assert_eq!(error.is_retryable(), expected);
    }

    #[test]
    fn retry_exhausted_is_terminal() {
        let err = NetError::RetryExhausted {
            max_retries: 3,
            source: Box::new(NetError::Timeout),
        };
        assert!(!err.is_retryable());
    }
}
