//! URL decomposition for storage (spec.md §4.8.2): pull `domain`,
//! `path`, `query_params`, and `file_extension` back out of an
//! already-canonical URL string.

use std::collections::BTreeMap;

use reconpipe_common::domain::QueryParamValue;

use crate::canonical::decompose_host_and_port;

#[derive(Debug, Clone)]
pub struct Decomposed {
    pub domain: String,
    pub path: String,
    pub query_params: BTreeMap<String, QueryParamValue>,
    pub file_extension: Option<String>,
}

/// `canonical` must already be the output of [`crate::canonical::canonicalize`].
pub fn decompose(canonical: &str) -> Decomposed {
    let (domain, _port) = decompose_host_and_port(canonical).unwrap_or_default();
    let parsed = url::Url::parse(canonical).ok();

    let path = parsed
        .as_ref()
        .map(|u| u.path().to_string())
        .unwrap_or_else(|| "/".to_string());

    let query_params = parsed
        .as_ref()
        .map(|u| query_params_from(u))
        .unwrap_or_default();

    let file_extension = extension_of(&path);

    Decomposed {
        domain,
        path,
        query_params,
        file_extension,
    }
}

fn query_params_from(parsed: &url::Url) -> BTreeMap<String, QueryParamValue> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in parsed.query_pairs() {
        grouped.entry(key.into_owned()).or_default().push(value.into_owned());
    }

    grouped
        .into_iter()
        .map(|(key, mut values)| {
            let value = if values.len() == 1 {
                QueryParamValue::Single(values.remove(0))
            } else {
                QueryParamValue::Multi(values)
            };
            (key, value)
        })
        .collect()
}

/// Lowercase extension of the last path segment. `.`, `/`, and empty
/// paths yield `None` (spec.md §4.8.2).
fn extension_of(path: &str) -> Option<String> {
    let last_segment = path.rsplit('/').next().unwrap_or("");
    if last_segment.is_empty() || last_segment == "." {
        return None;
    }
    let (_, ext) = last_segment.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;

    #[test]
    fn scenario_1_decomposition() {
        let canonical = canonicalize("https://Example.com:443/A/B/?b=2&a=1#frag").unwrap();
        let decomposed = decompose(&canonical);
        assert_eq!(decomposed.domain, "example.com");
        assert_eq!(decomposed.path, "/A/B");
        assert_eq!(
            decomposed.query_params.get("a"),
            Some(&QueryParamValue::Single("1".to_string()))
        );
    }

    #[test]
    fn repeated_query_key_becomes_multi() {
        let canonical = canonicalize("https://example.com/x?a=1&a=2").unwrap();
        let decomposed = decompose(&canonical);
        assert_eq!(
            decomposed.query_params.get("a"),
            Some(&QueryParamValue::Multi(vec!["1".to_string(), "2".to_string()]))
        );
    }

    #[test]
    fn root_path_has_no_extension() {
        let canonical = canonicalize("https://example.com/").unwrap();
        assert_eq!(decompose(&canonical).file_extension, None);
    }

    #[test]
    fn extracts_a_lowercase_extension() {
        let canonical = canonicalize("https://example.com/app.JS").unwrap();
        assert_eq!(decompose(&canonical).file_extension, Some("js".to_string()));
    }

    #[test]
    fn trailing_dot_segment_has_no_extension() {
        let canonical = canonicalize("https://example.com/download.").unwrap();
        assert_eq!(decompose(&canonical).file_extension, None);
    }
}
