//! Single-target HTTP probing (spec.md §4.5): one GET per scheme,
//! redirects followed manually up to a cap so every hop's status code
//! can be recorded, content captured for title/tech/favicon
//! extraction.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, LOCATION};
use sha2::{Digest, Sha256};

use crate::fingerprint::{detect_cdn, detect_technologies, extract_title, server_header};

/// Redirects are capped at 10 hops (spec.md §4.5).
const MAX_REDIRECTS: usize = 10;
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub status_code: u16,
    pub title: Option<String>,
    pub server: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub final_url: String,
    pub chain_status_codes: Vec<i32>,
    pub location: Option<String>,
    pub technologies: Vec<String>,
    pub cdn: Option<String>,
    pub favicon_hash: Option<String>,
    pub response_time_ms: i64,
}

#[async_trait]
pub trait HttpProber: Send + Sync {
    /// Probe `{scheme}://{host}`. `Ok(None)` means no response at all
    /// (connection refused, DNS failure, timeout) — a benign outcome,
    /// not an error; `Err` is reserved for caller-side misuse.
    async fn probe(&self, scheme: &str, host: &str) -> anyhow::Result<Option<ProbeResult>>;
}

pub struct ReqwestProber {
    client: reqwest::Client,
}

impl ReqwestProber {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("reqwest client with static config always builds");
        Self { client }
    }

    async fn fetch_favicon(&self, scheme: &str, host: &str) -> Option<String> {
        let url = format!("{scheme}://{host}/favicon.ico");
        let resp = self.client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let bytes = resp.bytes().await.ok()?;
        if bytes.is_empty() {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Some(hex::encode(hasher.finalize()))
    }
}

impl Default for ReqwestProber {
    fn default() -> Self {
        Self::new()
    }
}

fn location_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(|s| s.to_string())
}

#[async_trait]
impl HttpProber for ReqwestProber {
    async fn probe(&self, scheme: &str, host: &str) -> anyhow::Result<Option<ProbeResult>> {
        let started = Instant::now();
        let mut current = format!("{scheme}://{host}/");
        let mut chain = Vec::new();

        for hop in 0..=MAX_REDIRECTS {
            let response = match self.client.get(&current).send().await {
                Ok(r) => r,
                Err(_) => return Ok(None),
            };

            let status = response.status().as_u16();
            chain.push(status as i32);
            let headers = response.headers().clone();

            if response.status().is_redirection() && hop < MAX_REDIRECTS {
                if let Some(location) = location_header(&headers) {
                    current = match reqwest::Url::parse(&current).and_then(|base| base.join(&location)) {
                        Ok(joined) => joined.to_string(),
                        Err(_) => break,
                    };
                    continue;
                }
            }

            let content_type = headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let content_length = response.content_length().map(|n| n as i64);
            let final_url = response.url().to_string();
            let location = location_header(&headers);
            let body = response.text().await.unwrap_or_default();

            let title = extract_title(&body);
            let technologies = detect_technologies(&headers, &body);
            let cdn = detect_cdn(&headers);
            let server = server_header(&headers);
            let favicon_hash = self.fetch_favicon(scheme, host).await;

            return Ok(Some(ProbeResult {
                status_code: status,
                title,
                server,
                content_type,
                content_length,
                final_url,
                chain_status_codes: chain,
                location,
                technologies,
                cdn,
                favicon_hash,
                response_time_ms: started.elapsed().as_millis() as i64,
            }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn follows_a_single_redirect_and_records_both_hops() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", format!("{}/landing", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Server", "nginx")
                    .set_body_string("<html><head><title>Landing</title></head><body>hi</body></html>"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/favicon.ico"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let prober = ReqwestProber::new();
        let uri = server.uri();
        let host_port = uri.strip_prefix("http://").unwrap();
        let result = prober.probe("http", host_port).await.unwrap().unwrap();

        assert_eq!(result.chain_status_codes, vec![302, 200]);
        assert_eq!(result.status_code, 200);
        assert_eq!(result.title, Some("Landing".to_string()));
        assert_eq!(result.server, Some("nginx".to_string()));
        assert!(result.favicon_hash.is_none());
    }

    #[tokio::test]
    async fn connection_failure_yields_no_response() {
        let prober = ReqwestProber::new();
        let result = prober.probe("http", "127.0.0.1:1").await.unwrap();
        assert!(result.is_none());
    }
}
