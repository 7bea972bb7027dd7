//! DNS resolver stage core (spec.md §4.4). Consumes `topic[sub]`; for
//! each subdomain resolves {A, AAAA, CNAME, MX, TXT}, flattens to
//! `DnsRecord` rows and bulk-inserts them. Purely a consumer — it has
//! no downstream topic to forward to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reconpipe_common::config::StageConfig;
use reconpipe_common::domain::DnsRecord;
use reconpipe_common::{parent_domain, StreamMessage};
use reconpipe_store::Store;
use reconpipe_stream::{Delivery, StreamBus};
use reconpipe_worker::{report_scan_job_counts, run_streaming_loop, StageCore, StageOutcome, WorkerError};
use uuid::Uuid;

use crate::resolver::DnsResolver;

pub struct DnsStageCore {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn StreamBus>,
    pub resolver: Arc<dyn DnsResolver>,
}

impl DnsStageCore {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn StreamBus>, resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            store,
            bus,
            resolver,
        }
    }

    async fn resolve_one(
        &self,
        subdomain: &str,
        asset_id: Uuid,
        scan_job_id: Option<Uuid>,
    ) -> Vec<DnsRecord> {
        let parent = parent_domain(subdomain);
        let now = Utc::now();
        self.resolver
            .resolve_all(subdomain)
            .await
            .into_iter()
            .map(|resolved| DnsRecord {
                subdomain: subdomain.to_string(),
                parent_domain: parent.clone(),
                record_type: resolved.record_type,
                value: resolved.value,
                ttl: resolved.ttl,
                mx_priority: resolved.mx_priority,
                resolved_at: now,
                asset_id,
                scan_job_id,
            })
            .collect()
    }

    /// `report_scan_jobs` is true only for batch mode (spec.md §4.4:
    /// "In batch mode it also: ... updates per-scan-job completion
    /// counters") — simple mode has no scan-job mapping to report.
    async fn resolve_and_persist(
        &self,
        subdomains: &[(String, Uuid, Option<Uuid>)],
        report_scan_jobs: bool,
    ) -> Result<StageOutcome, WorkerError> {
        let mut records = Vec::new();
        for (subdomain, asset_id, scan_job_id) in subdomains {
            records.extend(self.resolve_one(subdomain, *asset_id, *scan_job_id).await);
        }

        if records.is_empty() {
            return Ok(StageOutcome::default());
        }

        let scan_job_counts = report_scan_jobs.then(|| counts_by_scan_job(&records));

        let outcome = self.store.bulk_insert_dns(&records).await?;

        if let Some(counts) = scan_job_counts {
            report_scan_job_counts(self.store.as_ref(), counts).await;
        }

        Ok(StageOutcome {
            total_results: outcome.inserted + outcome.updated,
            errored: outcome.errored,
        })
    }
}

fn counts_by_scan_job(records: &[DnsRecord]) -> HashMap<Uuid, u64> {
    let mut counts = HashMap::new();
    for r in records {
        if let Some(scan_job_id) = r.scan_job_id {
            *counts.entry(scan_job_id).or_insert(0) += 1;
        }
    }
    counts
}

#[async_trait]
impl StageCore for DnsStageCore {
    async fn run_simple(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        let asset_id = env
            .resolve_asset_id(None)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or(Uuid::nil());
        let scan_job_id = Uuid::parse_str(&env.scan_job_id).ok();
        let targets: Vec<_> = env
            .domains
            .iter()
            .map(|d| (d.clone(), asset_id, scan_job_id))
            .collect();
        self.resolve_and_persist(&targets, false).await
    }

    async fn run_batch(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        let asset_id = env
            .batch_asset_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| WorkerError::MissingVariable("ASSET_ID".to_string()))?;

        let targets = reconpipe_worker::resolve_targets(env, self.store.as_ref()).await?;
        let rows: Vec<_> = targets
            .into_iter()
            .map(|t| (t.subdomain, asset_id, t.scan_job_id))
            .collect();
        self.resolve_and_persist(&rows, true).await
    }

    async fn run_streaming(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        let topic = env
            .stream_input_key
            .as_deref()
            .ok_or_else(|| WorkerError::MissingVariable("STREAM_INPUT_KEY".to_string()))?;
        let group = env
            .consumer_group_name
            .as_deref()
            .ok_or_else(|| WorkerError::MissingVariable("CONSUMER_GROUP_NAME".to_string()))?;
        let consumer = env
            .consumer_name
            .as_deref()
            .ok_or_else(|| WorkerError::MissingVariable("CONSUMER_NAME".to_string()))?;

        let mut total = 0u64;
        let mut errored = 0u64;
        let mut scan_job_counts: HashMap<Uuid, u64> = HashMap::new();

        let processed = run_streaming_loop(
            self.bus.as_ref(),
            topic,
            group,
            consumer,
            env.batch_size,
            env.block_milliseconds,
            Duration::from_secs(env.max_processing_time_secs),
            |delivery: Delivery| async {
                let StreamMessage::Subdomain(msg) = delivery.message else {
                    return Ok(());
                };
                let asset_id = msg
                    .asset_id
                    .or_else(|| env.asset_id_fallback.as_deref().and_then(|s| Uuid::parse_str(s).ok()))
                    .unwrap_or(Uuid::nil());
                let records = self
                    .resolve_one(&msg.subdomain, asset_id, msg.scan_job_id)
                    .await;
                if !records.is_empty() {
                    match self.store.bulk_insert_dns(&records).await {
                        Ok(outcome) => {
                            total += outcome.inserted + outcome.updated;
                            errored += outcome.errored;
                            for (scan_job_id, count) in counts_by_scan_job(&records) {
                                *scan_job_counts.entry(scan_job_id).or_insert(0) += count;
                            }
                        }
                        Err(e) => {
                            errored += 1;
                            tracing::warn!(subdomain = %msg.subdomain, error = %e, "failed to persist dns records");
                        }
                    }
                }
                Ok(())
            },
        )
        .await?;

        report_scan_job_counts(self.store.as_ref(), scan_job_counts).await;

        tracing::info!(processed, total, errored, "dns streaming loop done");
        Ok(StageOutcome {
            total_results: total,
            errored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconpipe_common::config::RunMode;
    use reconpipe_common::stream_message::SubdomainMessage;
    use reconpipe_stream::memory::MemoryBus;
    use reconpipe_store::memory::MemoryStore;

    struct FakeResolver(std::collections::HashMap<String, Vec<crate::resolver::ResolvedValue>>);

    #[async_trait]
    impl DnsResolver for FakeResolver {
        async fn resolve_all(&self, name: &str) -> Vec<crate::resolver::ResolvedValue> {
            self.0.get(name).cloned().unwrap_or_default()
        }
    }

    fn a_record(value: &str) -> crate::resolver::ResolvedValue {
        crate::resolver::ResolvedValue {
            record_type: reconpipe_common::domain::DnsRecordType::A,
            value: value.to_string(),
            ttl: Some(300),
            mx_priority: None,
        }
    }

    fn simple_env(domains: Vec<String>) -> StageConfig {
        StageConfig {
            scan_job_id: Uuid::new_v4().to_string(),
            user_id: "user".to_string(),
            store_url: "postgres://localhost".to_string(),
            store_service_key: "key".to_string(),
            asset_id_fallback: Some(Uuid::new_v4().to_string()),
            mode: RunMode::Simple,
            batch_id: None,
            batch_asset_id: None,
            batch_offset: None,
            batch_limit: None,
            fetch_subdomains: false,
            asset_scan_mapping: serde_json::Map::new(),
            domains,
            stream_input_key: None,
            stream_output_key: None,
            consumer_group_name: None,
            consumer_name: None,
            stream_host: None,
            stream_port: None,
            batch_size: 50,
            block_milliseconds: 5000,
            max_processing_time_secs: 3600,
        }
    }

    #[tokio::test]
    async fn simple_mode_resolves_and_persists_only_known_names() {
        let mut names = std::collections::HashMap::new();
        names.insert("www.example.com".to_string(), vec![a_record("1.2.3.4")]);
        let resolver = Arc::new(FakeResolver(names));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let core = DnsStageCore::new(store.clone(), bus, resolver);

        let env = simple_env(vec!["www.example.com".to_string(), "missing.example.com".to_string()]);
        let outcome = core.run_simple(&env).await.unwrap();

        assert_eq!(outcome.total_results, 1);
        assert_eq!(outcome.errored, 0);
    }

    #[tokio::test]
    async fn streaming_mode_skips_the_completion_marker_and_acks_it() {
        let mut names = std::collections::HashMap::new();
        names.insert("a.example.com".to_string(), vec![a_record("5.6.7.8")]);
        let resolver = Arc::new(FakeResolver(names));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let scan_job_id = Uuid::new_v4();

        bus.ensure_group("sub", "g").await.unwrap();
        bus.append(
            "sub",
            &StreamMessage::Subdomain(SubdomainMessage {
                subdomain: "a.example.com".to_string(),
                source: "crtsh".to_string(),
                discovered_at: Utc::now(),
                parent_domain: "example.com".to_string(),
                scan_job_id: Some(scan_job_id),
                asset_id: None,
                metadata: None,
            }),
            None,
            false,
        )
        .await
        .unwrap();
        reconpipe_worker::append_completion(bus.as_ref(), "sub", "subdomain-producer", None, 1)
            .await
            .unwrap();

        let core = DnsStageCore::new(store.clone(), bus, resolver);
        let mut env = simple_env(Vec::new());
        env.mode = RunMode::Streaming;
        env.stream_input_key = Some("sub".to_string());
        env.consumer_group_name = Some("g".to_string());
        env.consumer_name = Some("c1".to_string());
        env.max_processing_time_secs = 5;

        let outcome = core.run_streaming(&env).await.unwrap();

        assert_eq!(outcome.total_results, 1);
        let (status, metadata) = store.scan_job_status(scan_job_id).unwrap();
        assert_eq!(status, "completed");
        assert_eq!(metadata.unwrap()["records"], 1);
    }

    #[tokio::test]
    async fn batch_mode_reports_completion_counters_per_scan_job() {
        let mut names = std::collections::HashMap::new();
        names.insert("www.example.com".to_string(), vec![a_record("1.2.3.4")]);
        let resolver = Arc::new(FakeResolver(names));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let scan_job_id = Uuid::new_v4();

        let core = DnsStageCore::new(store.clone(), bus, resolver);
        let mut env = simple_env(vec!["www.example.com".to_string()]);
        env.mode = RunMode::Batch;
        env.batch_id = Some(Uuid::new_v4().to_string());
        env.batch_asset_id = Some(Uuid::new_v4().to_string());
        env.batch_offset = Some(0);
        env.batch_limit = Some(100);
        env.asset_scan_mapping
            .insert("example.com".to_string(), serde_json::json!(scan_job_id.to_string()));

        let outcome = core.run_batch(&env).await.unwrap();

        assert_eq!(outcome.total_results, 1);
        let (status, metadata) = store.scan_job_status(scan_job_id).unwrap();
        assert_eq!(status, "completed");
        assert_eq!(metadata.unwrap()["records"], 1);
    }
}
