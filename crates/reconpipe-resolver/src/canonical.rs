//! URL canonicalization and hashing (spec.md §4.8.1). Deliberately
//! does not lean on `url::Url`'s own serialization: the WHATWG
//! algorithm it implements silently drops a port that matches the
//! scheme's default (`https://example.com:443/` round-trips to
//! `https://example.com/`), but scenario 1 in spec.md §8 requires the
//! literal `:443` to survive. So parsing is split in two: `url::Url`
//! for host/path/query structure, and a manual authority scan to keep
//! whatever port text, if any, the caller actually wrote.

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalizeError {
    #[error("url has no scheme or is not a valid url: {0}")]
    Unparseable(String),
    #[error("url has no host: {0}")]
    MissingHost(String),
}

/// Compute `canonical(url)` per spec.md §4.8.1.
pub fn canonicalize(raw: &str) -> Result<String, CanonicalizeError> {
    let parsed = url::Url::parse(raw).map_err(|_| CanonicalizeError::Unparseable(raw.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| CanonicalizeError::MissingHost(raw.to_string()))?
        .to_ascii_lowercase();
    let scheme = parsed.scheme().to_ascii_lowercase();
    let port = literal_port(raw);

    let mut path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if path.is_empty() {
        path.push('/');
    }

    let query = sorted_query(&parsed);

    let mut out = String::with_capacity(raw.len());
    out.push_str(&scheme);
    out.push_str("://");
    out.push_str(&host);
    if let Some(port) = port {
        out.push(':');
        out.push_str(&port);
    }
    out.push_str(&path);
    if let Some(query) = query {
        out.push('?');
        out.push_str(&query);
    }
    Ok(out)
}

/// `hex(SHA256(canonical(url)))`. Always re-canonicalizes before
/// hashing (spec.md §9 open-question resolution) — there is no code
/// path that hashes a value assumed already canonical.
pub fn url_hash(raw: &str) -> Result<String, CanonicalizeError> {
    let canonical = canonicalize(raw)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// The port exactly as written in the authority component, if any —
/// `url::Url::port()` returns `None` whenever the port equals the
/// scheme's default, which loses information this module needs.
fn literal_port(raw: &str) -> Option<String> {
    let after_scheme = raw.split_once("://")?.1;
    let authority_end = after_scheme
        .find(['/', '?', '#'])
        .unwrap_or(after_scheme.len());
    let authority = &after_scheme[..authority_end];
    let host_and_port = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    split_host_port(host_and_port).1
}

/// Bracket-aware host/port split shared by `literal_port` and
/// `decompose_host_and_port`: IPv6 literals are bracketed
/// (`[::1]:8080`), so a naive `rsplit_once(':')` over the whole
/// authority splits on the first colon inside the brackets instead of
/// the one separating host from port.
fn split_host_port(host_and_port: &str) -> (String, Option<String>) {
    if let Some(bracket_end) = host_and_port.find(']') {
        let host = &host_and_port[..=bracket_end];
        let after_host = &host_and_port[bracket_end + 1..];
        let port = after_host
            .strip_prefix(':')
            .filter(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
            .map(|p| p.to_string());
        (host.to_string(), port)
    } else {
        match host_and_port.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
                (host.to_string(), Some(port.to_string()))
            }
            _ => (host_and_port.to_string(), None),
        }
    }
}

/// Query pairs sorted by key, then by value within a key (spec.md
/// §4.8.1 step 4), re-emitted with standard percent-encoding. `None`
/// when the query string is empty (no encoded pairs at all).
fn sorted_query(parsed: &url::Url) -> Option<String> {
    if parsed.query().is_none() {
        return None;
    }
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        return None;
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &pairs {
        serializer.append_pair(k, v);
    }
    Some(serializer.finish())
}

pub fn decompose_host_and_port(canonical: &str) -> Option<(String, Option<String>)> {
    let after_scheme = canonical.split_once("://")?.1;
    let authority_end = after_scheme.find('/').unwrap_or(after_scheme.len());
    let authority = &after_scheme[..authority_end];
    Some(split_host_port(authority))
}
