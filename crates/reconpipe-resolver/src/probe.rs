//! Single-URL probe contract (spec.md §4.8.4): one GET against an
//! already-canonical URL, up to 10 redirects, a 15s timeout, up to 2
//! retries on transient (connection-level) errors. Shares its
//! fingerprinting helpers with the HTTP prober stage rather than
//! duplicating them.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reconpipe_http::fingerprint::{detect_cdn, detect_technologies, extract_title, server_header};
use reconpipe_store::ProbeResolution;
use reqwest::header::{HeaderMap, HeaderValue, LOCATION};

const MAX_REDIRECTS: usize = 10;
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// A probe always produces a resolution, even on total failure
/// (spec.md §4.8.4: "A probe error still yields an outcome"); `error`
/// carries the last transport error for logging when `is_alive` is
/// false.
pub struct ProbeOutcome {
    pub resolution: ProbeResolution,
    pub error: Option<String>,
}

#[async_trait]
pub trait UrlProbe: Send + Sync {
    async fn probe(&self, canonical_url: &str) -> ProbeOutcome;
}

pub struct ReqwestUrlProbe {
    client: reqwest::Client,
}

impl ReqwestUrlProbe {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("reqwest client with static config always builds");
        Self { client }
    }

    async fn attempt(&self, url: &str) -> Result<Success, String> {
        let mut current = url.to_string();
        let mut chain = Vec::new();

        for hop in 0..=MAX_REDIRECTS {
            let response = self
                .client
                .get(&current)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            let status = response.status().as_u16();
            chain.push(status as i32);
            let headers = response.headers().clone();

            if response.status().is_redirection() && hop < MAX_REDIRECTS {
                if let Some(location) = location_header(&headers) {
                    if let Ok(joined) =
                        reqwest::Url::parse(&current).and_then(|base| base.join(&location))
                    {
                        current = joined.to_string();
                        continue;
                    }
                }
            }

            let content_type = headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let content_length = response.content_length().map(|n| n as i64);
            let final_url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();

            return Ok(Success {
                status_code: status,
                content_type,
                content_length,
                final_url,
                chain,
                title: extract_title(&body),
                server: server_header(&headers),
                technologies: detect_technologies(&headers, &body),
                cdn: detect_cdn(&headers),
            });
        }

        Err(format!("exceeded {MAX_REDIRECTS} redirects"))
    }
}

fn location_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(|s| s.to_string())
}

struct Success {
    status_code: u16,
    content_type: Option<String>,
    content_length: Option<i64>,
    final_url: String,
    chain: Vec<i32>,
    title: Option<String>,
    server: Option<String>,
    technologies: Vec<String>,
    cdn: Option<String>,
}

#[async_trait]
impl UrlProbe for ReqwestUrlProbe {
    async fn probe(&self, canonical_url: &str) -> ProbeOutcome {
        let started = Instant::now();
        let mut last_error = None;

        for attempt_number in 0..MAX_ATTEMPTS {
            match self.attempt(canonical_url).await {
                Ok(success) => {
                    return ProbeOutcome {
                        resolution: ProbeResolution {
                            is_alive: true,
                            status_code: Some(success.status_code),
                            content_type: success.content_type,
                            content_length: success.content_length,
                            response_time_ms: Some(started.elapsed().as_millis() as i64),
                            title: success.title,
                            final_url: Some(success.final_url),
                            redirect_chain: success.chain,
                            server: success.server,
                            technologies: success.technologies,
                        },
                        error: None,
                    };
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt_number + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        ProbeOutcome {
            resolution: ProbeResolution {
                is_alive: false,
                status_code: None,
                content_type: None,
                content_length: None,
                response_time_ms: None,
                title: None,
                final_url: None,
                redirect_chain: Vec::new(),
                server: None,
                technologies: Vec::new(),
            },
            error: last_error,
        }
    }
}

impl Default for ReqwestUrlProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn successful_probe_captures_status_and_title() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Server", "nginx")
                    .set_body_string("<html><head><title>Hi</title></head></html>"),
            )
            .mount(&server)
            .await;

        let probe = ReqwestUrlProbe::new();
        let outcome = probe.probe(&format!("{}/a", server.uri())).await;

        assert!(outcome.resolution.is_alive);
        assert_eq!(outcome.resolution.status_code, Some(200));
        assert_eq!(outcome.resolution.title, Some("Hi".to_string()));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn connection_failure_yields_is_alive_false_with_error_surfaced() {
        let probe = ReqwestUrlProbe::new();
        let outcome = probe.probe("http://127.0.0.1:1/").await;

        assert!(!outcome.resolution.is_alive);
        assert!(outcome.error.is_some());
    }
}
