//! In-memory `Store`, for unit and stage tests without a live Postgres.
//! Mirrors `reconpipe_stream::memory::MemoryBus`'s shape: a `Mutex`-guarded
//! table map keyed the same way the real schema's unique constraints are.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use reconpipe_common::domain::{
    ApexDomain, BatchStatus, DnsRecord, HistoricalUrlRecord, HttpProbeRecord, SubdomainRecord,
    UrlRecord,
};
use uuid::Uuid;

use crate::{
    retry_with_backoff, DnsInsertOutcome, HttpProbeInsertOutcome, ProbeResolution, Result, Store,
    SubdomainInsertOutcome,
};

#[derive(Default)]
struct Tables {
    apex_domains: Vec<ApexDomain>,
    subdomains: HashMap<(Uuid, String), SubdomainRecord>,
    dns_records: HashMap<(Uuid, String, String, String), DnsRecord>,
    http_probes: Vec<HttpProbeRecord>,
    historical_urls: HashMap<(Uuid, String), HistoricalUrlRecord>,
    urls: HashMap<(Uuid, String), UrlRecord>,
    batch_statuses: HashMap<Uuid, (BatchStatus, Option<serde_json::Value>)>,
    scan_job_statuses: HashMap<Uuid, (String, Option<serde_json::Value>)>,
    /// When set, `update_batch_status` fails this many times before
    /// succeeding, to exercise the retry contract in tests.
    fail_batch_updates_remaining: u32,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_apex_domain(&self, domain: ApexDomain) {
        self.tables.lock().unwrap().apex_domains.push(domain);
    }

    pub fn seed_historical_url(&self, record: HistoricalUrlRecord) {
        let key = (record.asset_id, record.url.clone());
        self.tables
            .lock()
            .unwrap()
            .historical_urls
            .insert(key, record);
    }

    pub fn seed_subdomain(&self, record: SubdomainRecord) {
        let key = (record.asset_id, record.subdomain.clone());
        self.tables.lock().unwrap().subdomains.insert(key, record);
    }

    /// Test hook: force the next `n` `update_batch_status` calls to fail
    /// before succeeding, to exercise the backoff retry contract.
    pub fn fail_next_batch_updates(&self, n: u32) {
        self.tables.lock().unwrap().fail_batch_updates_remaining = n;
    }

    pub fn url_count(&self) -> usize {
        self.tables.lock().unwrap().urls.len()
    }

    /// Test hook: read back what `update_scan_job_status` last recorded
    /// for a given scan job.
    pub fn scan_job_status(&self, scan_job_id: Uuid) -> Option<(String, Option<serde_json::Value>)> {
        self.tables
            .lock()
            .unwrap()
            .scan_job_statuses
            .get(&scan_job_id)
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn bulk_insert_dns(&self, records: &[DnsRecord]) -> Result<DnsInsertOutcome> {
        let mut tables = self.tables.lock().unwrap();
        let mut outcome = DnsInsertOutcome::default();
        for r in records {
            let key = (
                r.asset_id,
                r.subdomain.clone(),
                r.record_type.to_string(),
                r.value.clone(),
            );
            if tables.dns_records.insert(key, r.clone()).is_some() {
                outcome.updated += 1;
            } else {
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn bulk_insert_subdomains(
        &self,
        records: &[SubdomainRecord],
    ) -> Result<SubdomainInsertOutcome> {
        let mut tables = self.tables.lock().unwrap();
        let mut outcome = SubdomainInsertOutcome::default();
        for r in records {
            let key = (r.asset_id, r.subdomain.clone());
            if tables.subdomains.contains_key(&key) {
                outcome.skipped += 1;
            } else {
                tables.subdomains.insert(key, r.clone());
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn bulk_insert_http_probes(
        &self,
        probes: &[HttpProbeRecord],
    ) -> Result<HttpProbeInsertOutcome> {
        let mut tables = self.tables.lock().unwrap();
        tables.http_probes.extend(probes.iter().cloned());
        Ok(HttpProbeInsertOutcome {
            inserted: probes.len() as u64,
            skipped: 0,
            errored: 0,
        })
    }

    async fn bulk_insert_historical_urls(&self, records: &[HistoricalUrlRecord]) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let mut inserted = 0u64;
        for r in records {
            let key = (r.asset_id, r.url.clone());
            tables.historical_urls.insert(key, r.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn get_url_by_hash(&self, asset_id: Uuid, url_hash: &str) -> Result<Option<UrlRecord>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .urls
            .get(&(asset_id, url_hash.to_string()))
            .cloned())
    }

    async fn insert_url(&self, record: &UrlRecord) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let key = (record.asset_id, record.url_hash.clone());
        tables.urls.entry(key).or_insert_with(|| record.clone());
        Ok(())
    }

    async fn update_url_resolution(
        &self,
        asset_id: Uuid,
        url_hash: &str,
        probe: &ProbeResolution,
        optional_new_source: Option<&str>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(record) = tables.urls.get_mut(&(asset_id, url_hash.to_string())) {
            record.is_alive = Some(probe.is_alive);
            record.status_code = probe.status_code;
            record.content_type = probe.content_type.clone();
            record.content_length = probe.content_length;
            record.response_time_ms = probe.response_time_ms;
            record.title = probe.title.clone();
            record.final_url = probe.final_url.clone();
            record.redirect_chain = probe.redirect_chain.clone();
            record.server = probe.server.clone();
            record.technologies = probe.technologies.clone();
            record.resolved_at = Some(Utc::now());
            record.updated_at = Utc::now();
            if let Some(source) = optional_new_source {
                record.add_source(source);
            }
        }
        Ok(())
    }

    async fn add_source_to_url(&self, asset_id: Uuid, url_hash: &str, source: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(record) = tables.urls.get_mut(&(asset_id, url_hash.to_string())) {
            if record.add_source(source) {
                record.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn get_subdomains_for_asset(
        &self,
        asset_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<SubdomainRecord>> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<_> = tables
            .subdomains
            .values()
            .filter(|r| r.asset_id == asset_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        let start = offset.max(0) as usize;
        let end = (start + limit.max(0) as usize).min(rows.len());
        Ok(if start >= rows.len() {
            Vec::new()
        } else {
            rows[start..end].to_vec()
        })
    }

    async fn fetch_apex_domains(&self, asset_id: Uuid) -> Result<Vec<ApexDomain>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .apex_domains
            .iter()
            .filter(|d| d.asset_id == asset_id && d.active)
            .cloned()
            .collect())
    }

    async fn update_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        retry_with_backoff(|| async {
            let mut tables = self.tables.lock().unwrap();
            if tables.fail_batch_updates_remaining > 0 {
                tables.fail_batch_updates_remaining -= 1;
                return Err(crate::StoreError::new("transient", "forced test failure"));
            }
            tables
                .batch_statuses
                .insert(batch_id, (status, metadata.clone()));
            Ok(())
        })
        .await
    }

    async fn update_scan_job_status(
        &self,
        scan_job_id: Uuid,
        status: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .scan_job_statuses
            .insert(scan_job_id, (status.to_string(), metadata));
        Ok(())
    }

    async fn get_historical_urls_page(
        &self,
        asset_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<HistoricalUrlRecord>> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<_> = tables
            .historical_urls
            .values()
            .filter(|r| r.asset_id == asset_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.url.cmp(&b.url));
        let start = offset.max(0) as usize;
        let end = (start + limit.max(0) as usize).min(rows.len());
        Ok(if start >= rows.len() {
            Vec::new()
        } else {
            rows[start..end].to_vec()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_record(asset_id: Uuid, hash: &str) -> UrlRecord {
        let now = Utc::now();
        UrlRecord {
            id: Uuid::new_v4(),
            asset_id,
            canonical_url: format!("https://example.com/{hash}"),
            url_hash: hash.to_string(),
            domain: "example.com".to_string(),
            path: Some(format!("/{hash}")),
            query_params: Default::default(),
            sources: vec!["historical".to_string()],
            first_discovered_by: "historical".to_string(),
            first_discovered_at: now,
            resolved_at: None,
            is_alive: None,
            status_code: None,
            content_type: None,
            content_length: None,
            response_time_ms: None,
            title: None,
            final_url: None,
            redirect_chain: Vec::new(),
            server: None,
            technologies: Vec::new(),
            file_extension: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_url_is_idempotent_on_hash() {
        let store = MemoryStore::new();
        let asset_id = Uuid::new_v4();
        let record = url_record(asset_id, "abc");
        store.insert_url(&record).await.unwrap();
        store.insert_url(&record).await.unwrap();
        assert_eq!(store.url_count(), 1);
    }

    #[tokio::test]
    async fn add_source_to_url_is_a_no_op_when_already_present() {
        let store = MemoryStore::new();
        let asset_id = Uuid::new_v4();
        let record = url_record(asset_id, "abc");
        store.insert_url(&record).await.unwrap();

        store
            .add_source_to_url(asset_id, "abc", "historical")
            .await
            .unwrap();
        let fetched = store.get_url_by_hash(asset_id, "abc").await.unwrap().unwrap();
        assert_eq!(fetched.sources, vec!["historical".to_string()]);

        store
            .add_source_to_url(asset_id, "abc", "intel")
            .await
            .unwrap();
        let fetched = store.get_url_by_hash(asset_id, "abc").await.unwrap().unwrap();
        assert_eq!(fetched.sources.len(), 2);
    }

    #[tokio::test]
    async fn update_batch_status_retries_through_transient_failures() {
        let store = MemoryStore::new();
        store.fail_next_batch_updates(2);
        let batch_id = Uuid::new_v4();
        store
            .update_batch_status(batch_id, BatchStatus::Completed, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_batch_status_gives_up_after_exactly_three_attempts() {
        let store = MemoryStore::new();
        store.fail_next_batch_updates(3);
        let batch_id = Uuid::new_v4();
        let result = store
            .update_batch_status(batch_id, BatchStatus::Completed, None)
            .await;
        assert!(result.is_err());
    }
}
