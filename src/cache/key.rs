//! Request signature normalization.
//!
//! Two requests share a cache and dedup key when they have the same method,
//! the same URL after normalization, and the same canonical body.

use url::Url;

use crate::upstream::UpstreamRequest;

/// Normalized request signature: `METHOD normalized-url #body-hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    /// Use `raw` verbatim as a key (caller-defined signatures).
    pub fn raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build the key for an upstream request.
    pub fn for_request(request: &UpstreamRequest) -> Self {
        Self::from_parts(&request.method, &request.url, request.body.as_deref())
    }

    pub fn from_parts(method: &str, url: &str, body: Option<&[u8]>) -> Self {
        let mut key = format!("{} {}", method.to_ascii_uppercase(), normalize_url(url));
        if let Some(body) = body.filter(|b| !b.is_empty()) {
            key.push_str(" #");
            key.push_str(&body_hash(body));
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(raw: &str) -> Self {
        Self::raw(raw)
    }
}

/// Lowercase scheme and host, drop default ports and fragments, sort query pairs.
/// Unparseable input is returned trimmed.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let mut normalized = url.to_string();
    if normalized.ends_with('/') && url.path() != "/" {
        normalized.pop();
    }
    normalized
}

/// Hash of the canonical form of `body`: JSON bodies are re-serialized with
/// sorted keys so field order does not matter; other bodies are hashed as-is.
pub fn body_hash(body: &[u8]) -> String {
    let canonical = match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec()),
        Err(_) => body.to_vec(),
    };
    blake3::hash(&canonical).to_hex().as_str()[..16].to_string()
}
