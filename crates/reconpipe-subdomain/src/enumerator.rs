//! Passive subdomain enumeration against certificate-transparency logs.
//! One concrete `Enumerator`, in the style of `rootsignal-scout`'s
//! `sources.rs` pluggable-source pattern, so additional active/passive
//! sources can be added later without touching the stage core.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;

/// A pluggable subdomain discovery source, tagged so callers can carry
/// its name through as the `SubdomainMessage.source` field.
#[async_trait]
pub trait Enumerator: Send + Sync {
    fn source_tag(&self) -> &'static str;
    async fn enumerate(&self, apex_domain: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Deserialize)]
struct CrtShEntry {
    name_value: String,
}

/// Queries crt.sh's certificate-transparency search for every name seen
/// on a certificate covering `*.{domain}`.
pub struct CrtShEnumerator {
    client: reqwest::Client,
    base_url: String,
}

impl CrtShEnumerator {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: "https://crt.sh".to_string(),
        }
    }

    /// Override the service base URL, for pointing at a `wiremock`
    /// server in tests.
    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl Default for CrtShEnumerator {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl Enumerator for CrtShEnumerator {
    fn source_tag(&self) -> &'static str {
        "crtsh"
    }

    async fn enumerate(&self, apex_domain: &str) -> anyhow::Result<Vec<String>> {
        let url = format!(
            "{base}/?q=%25.{apex_domain}&output=json",
            base = self.base_url,
            apex_domain = apex_domain
        );
        let entries: Vec<CrtShEntry> = self
            .client
            .get(&url)
            .send()
            .await?
            .json()
            .await
            .unwrap_or_default();

        let mut names = BTreeSet::new();
        for entry in entries {
            for line in entry.name_value.split('\n') {
                let name = line.trim().trim_start_matches("*.").to_lowercase();
                if !name.is_empty() && (name == apex_domain || name.ends_with(&format!(".{apex_domain}"))) {
                    names.insert(name);
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn parses_and_dedups_names_scoped_to_the_apex() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name_value": "api.example.com\nwww.example.com"},
                {"name_value": "www.example.com"},
                {"name_value": "*.other.com"},
            ])))
            .mount(&server)
            .await;

        let enumerator = CrtShEnumerator::with_base_url(reqwest::Client::new(), server.uri());
        let mut names = enumerator.enumerate("example.com").await.unwrap();
        names.sort();

        assert_eq!(names, vec!["api.example.com", "www.example.com"]);
        assert_eq!(enumerator.source_tag(), "crtsh");
    }
}
