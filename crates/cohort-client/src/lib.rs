//! Cohort Client - HTTP transports
//!
//! REST implementations of the `cohort-core` remote seams:
//! - [`HttpRuleService`] evaluates a library through
//!   `POST {base}/Library/{id}/$evaluate` with a Parameters body
//! - [`RestResourceStore`] reads and searches resources under `{base}`
//!
//! Both are cheap to clone and safe to share between concurrent subject
//! evaluations.

pub mod rules;
pub mod store;

pub use rules::HttpRuleService;
pub use store::RestResourceStore;

use std::time::Duration;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid base url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Parse and check a base url that path segments can be appended to.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url, ClientError> {
    let url = Url::parse(raw).map_err(|e| ClientError::InvalidBaseUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ClientError::InvalidBaseUrl {
            url: raw.to_string(),
            reason: "url cannot be a base".into(),
        });
    }
    Ok(url)
}

/// `base` with `segments` appended, each percent-encoded as one segment.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    // parse_base_url rejected cannot-be-a-base urls
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}
