pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reconpipe_common::domain::{
    ApexDomain, BatchStatus, DnsRecord, HistoricalUrlRecord, HttpProbeRecord, SubdomainRecord,
    UrlRecord,
};
use thiserror::Error;
use uuid::Uuid;

/// Structured store error (spec.md §4.9: "may fail with a structured
/// error {code, message, details, hint}").
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct StoreError {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl StoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
            hint: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsInsertOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errored: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubdomainInsertOutcome {
    pub inserted: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpProbeInsertOutcome {
    pub inserted: u64,
    pub skipped: u64,
    pub errored: u64,
}

/// Fields a successful or failed probe contributes to an existing or
/// new `UrlRecord` (spec.md §4.8.3 step 6 / §4.8.4).
#[derive(Debug, Clone)]
pub struct ProbeResolution {
    pub is_alive: bool,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub response_time_ms: Option<i64>,
    pub title: Option<String>,
    pub final_url: Option<String>,
    pub redirect_chain: Vec<i32>,
    pub server: Option<String>,
    pub technologies: Vec<String>,
}

/// Small, purely-contractual layer over the relational store (spec.md
/// §4.9). Implementations: `postgres::PostgresStore` for production,
/// `memory::MemoryStore` for tests.
#[async_trait]
pub trait Store: Send + Sync {
    async fn bulk_insert_dns(&self, records: &[DnsRecord]) -> Result<DnsInsertOutcome>;

    async fn bulk_insert_subdomains(
        &self,
        records: &[SubdomainRecord],
    ) -> Result<SubdomainInsertOutcome>;

    async fn bulk_insert_http_probes(
        &self,
        probes: &[HttpProbeRecord],
    ) -> Result<HttpProbeInsertOutcome>;

    /// Inserts in sub-batches of 500 with conflict resolution =
    /// merge-on-duplicate (spec.md §4.9).
    async fn bulk_insert_historical_urls(&self, records: &[HistoricalUrlRecord]) -> Result<u64>;

    async fn get_url_by_hash(&self, asset_id: Uuid, url_hash: &str) -> Result<Option<UrlRecord>>;

    async fn insert_url(&self, record: &UrlRecord) -> Result<()>;

    async fn update_url_resolution(
        &self,
        asset_id: Uuid,
        url_hash: &str,
        probe: &ProbeResolution,
        optional_new_source: Option<&str>,
    ) -> Result<()>;

    /// No-op if `source` is already present (spec.md §3 invariant).
    async fn add_source_to_url(&self, asset_id: Uuid, url_hash: &str, source: &str)
        -> Result<()>;

    async fn get_subdomains_for_asset(
        &self,
        asset_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SubdomainRecord>>;

    async fn fetch_apex_domains(&self, asset_id: Uuid) -> Result<Vec<ApexDomain>>;

    /// Retries with exponential backoff (1s, 2s, 4s; up to 3 attempts)
    /// per spec.md §4.9.
    async fn update_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<()>;

    async fn update_scan_job_status(
        &self,
        scan_job_id: Uuid,
        status: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Paged historical-URL fetch for backfill mode (spec.md §4.8.5),
    /// page size fixed at 100 by the caller.
    async fn get_historical_urls_page(
        &self,
        asset_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<HistoricalUrlRecord>>;
}

/// Retry an `update_batch_status`-shaped call with the fixed backoff
/// schedule spec.md §4.9 requires (1s, 2s, 4s; up to 3 attempts).
/// Shared between the Postgres and in-memory stores so both honor the
/// same retry contract.
pub(crate) async fn retry_with_backoff<F, Fut, T>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    const DELAYS_MS: [u64; 3] = [1000, 2000, 4000];
    let mut last_err = None;
    for (attempt, delay_ms) in DELAYS_MS.into_iter().enumerate() {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::warn!(error = %e.message, "store call failed, retrying");
                last_err = Some(e);
                if attempt + 1 < DELAYS_MS.len() {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
