//! Threat-intel URL discovery (spec.md §4.7), queried per unique
//! host. Grounded on the same reqwest-plus-JSON shape as the
//! certificate-transparency enumerator: a pluggable trait with one
//! concrete source, OTX's passive `url_list` indicator feed.

use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub trait IntelProvider: Send + Sync {
    fn source_tag(&self) -> &'static str;
    async fn discover_urls(&self, host: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Deserialize)]
struct OtxUrlEntry {
    url: String,
}

#[derive(Deserialize, Default)]
struct OtxUrlListResponse {
    #[serde(default)]
    url_list: Vec<OtxUrlEntry>,
}

/// AlienVault OTX's `hostname/{host}/url_list` indicator endpoint.
pub struct OtxIntelProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OtxIntelProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: "https://otx.alienvault.com".to_string(),
        }
    }

    /// Override the service base URL, for pointing at a mock server in
    /// tests.
    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl Default for OtxIntelProvider {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl IntelProvider for OtxIntelProvider {
    fn source_tag(&self) -> &'static str {
        "threat-intel"
    }

    async fn discover_urls(&self, host: &str) -> anyhow::Result<Vec<String>> {
        let url = format!(
            "{base}/api/v1/indicators/hostname/{host}/url_list?limit=100&page=1",
            base = self.base_url
        );
        let response: OtxUrlListResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .json()
            .await
            .unwrap_or_default();

        Ok(response.url_list.into_iter().map(|e| e.url).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn parses_the_url_list_from_the_indicator_feed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/indicators/hostname/api.example.com/url_list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url_list": [
                    {"url": "https://api.example.com/admin"},
                    {"url": "https://api.example.com/login"},
                ]
            })))
            .mount(&server)
            .await;

        let provider = OtxIntelProvider::with_base_url(reqwest::Client::new(), server.uri());
        let urls = provider.discover_urls("api.example.com").await.unwrap();

        assert_eq!(
            urls,
            vec![
                "https://api.example.com/admin".to_string(),
                "https://api.example.com/login".to_string(),
            ]
        );
        assert_eq!(provider.source_tag(), "threat-intel");
    }
}
