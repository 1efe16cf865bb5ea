#![forbid(unsafe_code)]

//! Cache-key derivation for kinema.
//!
//! A [`CacheKey`] is a stable identifier for a remote video resource,
//! derived from its URL through a pluggable canonicalization [`KeyRule`].
//! Every disk and index lookup in the cache layer is addressed by it, so
//! the invariant here is simple: same logical resource, same key.

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL canonicalization failed: {0}")]
    Canonicalization(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Pluggable URL canonicalization rule.
///
/// The default rule strips volatile query parameters; callers whose URLs
/// encode resource identity in the query string use [`KeepQueryKeyRule`]
/// (or their own rule) instead.
pub trait KeyRule: Send + Sync + 'static {
    /// Produce the canonical string form a [`CacheKey`] is hashed from.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidUrl`] if the URL lacks a scheme or host.
    fn canonicalize(&self, url: &Url) -> CoreResult<String>;
}

/// Strips query and fragment; normalizes scheme/host case and default ports.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultKeyRule;

impl KeyRule for DefaultKeyRule {
    fn canonicalize(&self, url: &Url) -> CoreResult<String> {
        normalize(url, false)
    }
}

/// Like [`DefaultKeyRule`] but keeps the query string.
///
/// For hosts where `?track_id=...` is the resource identity, not a token.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepQueryKeyRule;

impl KeyRule for KeepQueryKeyRule {
    fn canonicalize(&self, url: &Url) -> CoreResult<String> {
        normalize(url, true)
    }
}

fn normalize(url: &Url, keep_query: bool) -> CoreResult<String> {
    if url.scheme().is_empty() {
        return Err(CoreError::InvalidUrl("missing scheme".to_string()));
    }
    if url.host().is_none() {
        return Err(CoreError::InvalidUrl("missing host".to_string()));
    }

    let mut canonical = url.clone();

    canonical.set_fragment(None);
    if !keep_query {
        canonical.set_query(None);
    }

    let scheme = canonical.scheme();
    let scheme_lower = scheme.to_lowercase();
    if scheme != scheme_lower {
        let _ = canonical.set_scheme(&scheme_lower);
    }

    if let Some(host) = canonical.host_str() {
        let host_lower = host.to_lowercase();
        if host != host_lower {
            let _ = canonical.set_host(Some(&host_lower));
        }
    }

    match (canonical.scheme(), canonical.port()) {
        ("https", Some(443)) | ("http", Some(80)) => {
            let _ = canonical.set_port(None);
        }
        _ => {}
    }

    Ok(canonical.to_string())
}

/// Normalized identifier for a cached video resource.
///
/// SHA-256 over the canonical URL form. `Copy`, hashable, and stable
/// across processes; the disk layout is addressed by its hex form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Derive a key with the [`DefaultKeyRule`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidUrl`] for URLs without scheme or host.
    pub fn from_url(url: &Url) -> CoreResult<CacheKey> {
        Self::from_url_with(&DefaultKeyRule, url)
    }

    /// Derive a key with a caller-provided rule.
    ///
    /// # Errors
    ///
    /// Propagates the rule's canonicalization error.
    pub fn from_url_with(rule: &dyn KeyRule, url: &Url) -> CoreResult<CacheKey> {
        let canonical = rule.canonicalize(url)?;
        let hash = Sha256::digest(canonical.as_bytes());
        Ok(CacheKey(hash.into()))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex form, used for directory names in the disk layout.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
