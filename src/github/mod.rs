//! GitHub clients used by discovery and enrichment.
//!
//! - [`graphql`]: per-repository detail fetch, the [`DetailApi`] used by the
//!   enrichment pool.
//! - [`parse`]: turns a detail response into an [`EnrichedRecord`].
//! - [`search`]: time-windowed repository search.
//! - [`archive`]: GH Archive hourly event dumps.
//!
//! [`EnrichedRecord`]: crate::storage::EnrichedRecord

pub mod archive;
pub mod graphql;
pub mod parse;
pub mod search;

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::error::FetchError;

pub use archive::{ArchiveClient, HourFetch};
pub use graphql::GraphQlClient;
pub use parse::parse_repository;
pub use search::SearchClient;

pub(crate) const USER_AGENT: &str = "repo-scout/0.1";

/// Per-item detail lookup.
///
/// Implementations return the raw response body; classification of HTTP and
/// API-level failures into [`FetchError`] happens here, shape validation in
/// [`parse_repository`].
#[async_trait]
pub trait DetailApi: Send + Sync {
    async fn fetch_detail(&self, owner: &str, name: &str) -> Result<Value, FetchError>;
}

/// Split `owner/name`, rejecting anything GitHub would not accept.
pub fn split_full_name(full_name: &str) -> Result<(&str, &str), FetchError> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,38})/[A-Za-z0-9._-]{1,100}$").ok()
    });

    let valid = pattern.as_ref().is_some_and(|re| re.is_match(full_name));
    if !valid {
        return Err(FetchError::InvalidIdentifier(full_name.to_string()));
    }
    match full_name.split_once('/') {
        Some((owner, name)) if name != "." && name != ".." => Ok((owner, name)),
        _ => Err(FetchError::InvalidIdentifier(full_name.to_string())),
    }
}

/// Parse a `Retry-After` header value in seconds.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_full_name() {
        assert_eq!(split_full_name("rust-lang/rust").unwrap(), ("rust-lang", "rust"));
        assert_eq!(split_full_name("a/x.y_z-1").unwrap(), ("a", "x.y_z-1"));
    }

    #[test]
    fn test_split_full_name_rejects_malformed() {
        for bad in ["", "noslash", "a/b/c", "/repo", "owner/", "-bad/repo", "a/..", "a b/c"] {
            assert!(
                matches!(split_full_name(bad), Err(FetchError::InvalidIdentifier(_))),
                "accepted {bad:?}"
            );
        }
    }
}
