//! URL canonicalization used as the comparison key for sources and candidates.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::UrlError;

/// Query parameters that only carry campaign/click tracking.
pub const TRACKING_PARAMS: &[&str] = &[
    "gclid", "fbclid", "mc_cid", "mc_eid", "msclkid", "dclid", "_ga", "yclid", "igshid",
];

/// Comparison-stable form of a URL plus its normalized host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalUrl {
    pub canonical: String,
    pub host: String,
}

impl CanonicalUrl {
    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl std::fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

pub fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("utm_") || TRACKING_PARAMS.contains(&lower.as_str())
}

fn has_scheme(input: &str) -> bool {
    match input.find("://") {
        Some(idx) if idx > 0 => input[..idx]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')),
        _ => false,
    }
}

fn invalid(input: &str, reason: impl Into<String>) -> UrlError {
    UrlError::InvalidUrl {
        input: input.to_string(),
        reason: reason.into(),
    }
}

/// Canonicalize `raw`: default to https, lower-case host without `www.`,
/// no fragment, tracking parameters removed, remaining parameters kept in order.
pub fn normalize(raw: &str) -> Result<CanonicalUrl, UrlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid(raw, "empty input"));
    }
    let with_scheme = if has_scheme(trimmed) {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| invalid(raw, e.to_string()))?;
    if url.scheme() == "http" {
        url.set_scheme("https")
            .map_err(|_| invalid(raw, "cannot rewrite scheme"))?;
    }

    let host = url
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| invalid(raw, "missing host"))?;
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        return Err(invalid(raw, "missing host"));
    }
    url.set_host(Some(&host))
        .map_err(|e| invalid(raw, e.to_string()))?;
    url.set_fragment(None);

    let kept = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&kept);
    }

    Ok(CanonicalUrl {
        canonical: url.to_string(),
        host,
    })
}

/// Normalized host of `raw`, used for per-host limits and dead-domain lookups.
pub fn host_of(raw: &str) -> Result<String, UrlError> {
    normalize(raw).map(|c| c.host)
}

/// Resolve `href` against `base` and normalize the result.
pub fn join(base: &str, href: &str) -> Result<CanonicalUrl, UrlError> {
    let base_url = normalize(base)?;
    let parsed = Url::parse(&base_url.canonical).map_err(|e| invalid(base, e.to_string()))?;
    let joined = parsed.join(href.trim()).map_err(|e| invalid(href, e.to_string()))?;
    normalize(joined.as_str())
}
