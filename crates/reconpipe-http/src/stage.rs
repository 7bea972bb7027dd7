//! HTTP prober stage core (spec.md §4.5). Consumes `topic[sub]`; for
//! each subdomain probes `http` and `https`, persists one
//! `HttpProbeRecord` per responsive scheme, and — for any subdomain
//! that responded on at least one scheme — forwards a
//! subdomain-shaped message to `topic[http]` for the threat-intel
//! miner (spec.md §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reconpipe_common::config::StageConfig;
use reconpipe_common::domain::HttpProbeRecord;
use reconpipe_common::stream_message::SubdomainMessage;
use reconpipe_common::{parent_domain, StreamMessage};
use reconpipe_store::Store;
use reconpipe_stream::{Delivery, StreamBus};
use reconpipe_worker::{
    append_completion, report_scan_job_counts, run_streaming_loop, StageCore, StageOutcome,
    WorkerError,
};
use uuid::Uuid;

use crate::prober::HttpProber;

const MODULE: &str = "http-prober";
const SCHEMES: [(&str, u16); 2] = [("https", 443), ("http", 80)];

pub struct HttpStageCore {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn StreamBus>,
    pub prober: Arc<dyn HttpProber>,
}

impl HttpStageCore {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn StreamBus>, prober: Arc<dyn HttpProber>) -> Self {
        Self { store, bus, prober }
    }

    async fn probe_subdomain(
        &self,
        subdomain: &str,
        asset_id: Uuid,
        scan_job_id: Option<Uuid>,
    ) -> Vec<HttpProbeRecord> {
        let parent = parent_domain(subdomain);
        let now = Utc::now();
        let mut records = Vec::new();

        for (scheme, port) in SCHEMES {
            let result = match self.prober.probe(scheme, subdomain).await {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(subdomain, scheme, error = %e, "probe failed");
                    continue;
                }
            };

            records.push(HttpProbeRecord {
                url: format!("{scheme}://{subdomain}/"),
                subdomain: subdomain.to_string(),
                parent_domain: parent.clone(),
                scheme: scheme.to_string(),
                port,
                status_code: Some(result.status_code),
                title: result.title,
                server: result.server,
                content_type: result.content_type,
                content_length: result.content_length,
                final_url: Some(result.final_url),
                ip: None,
                technologies: result.technologies,
                cdn: result.cdn,
                asn: None,
                chain_status_codes: result.chain_status_codes,
                location: result.location,
                favicon_hash: result.favicon_hash,
                created_at: now,
                asset_id,
                scan_job_id,
            });
        }

        records
    }

    async fn forward_to_intel(
        &self,
        env: &StageConfig,
        subdomain: &str,
        parent: &str,
        asset_id: Uuid,
        scan_job_id: Option<Uuid>,
    ) -> Result<(), WorkerError> {
        if let Some(topic) = env.stream_output_key.as_deref() {
            let message = StreamMessage::Subdomain(SubdomainMessage {
                subdomain: subdomain.to_string(),
                source: MODULE.to_string(),
                discovered_at: Utc::now(),
                parent_domain: parent.to_string(),
                scan_job_id,
                asset_id: Some(asset_id),
                metadata: None,
            });
            self.bus.append(topic, &message, None, false).await?;
        }
        Ok(())
    }

    /// `report_scan_jobs` is true only for batch mode (spec.md §4.4's
    /// per-scan-job completion counters requirement, mirrored for
    /// HTTP probing) — simple mode has no scan-job mapping to report.
    async fn run_for_subdomains(
        &self,
        env: &StageConfig,
        rows: &[(String, Uuid, Option<Uuid>)],
        report_scan_jobs: bool,
    ) -> Result<StageOutcome, WorkerError> {
        let mut total = 0u64;
        let mut errored = 0u64;
        let mut scan_job_counts: HashMap<Uuid, u64> = HashMap::new();

        for (subdomain, asset_id, scan_job_id) in rows {
            let records = self.probe_subdomain(subdomain, *asset_id, *scan_job_id).await;
            if records.is_empty() {
                continue;
            }
            match self.store.bulk_insert_http_probes(&records).await {
                Ok(outcome) => {
                    total += outcome.inserted;
                    errored += outcome.errored;
                    if let Some(scan_job_id) = scan_job_id {
                        *scan_job_counts.entry(*scan_job_id).or_insert(0) += records.len() as u64;
                    }
                }
                Err(e) => {
                    errored += 1;
                    tracing::warn!(subdomain, error = %e, "failed to persist http probes");
                    continue;
                }
            }
            self.forward_to_intel(env, subdomain, &parent_domain(subdomain), *asset_id, *scan_job_id)
                .await?;
        }

        if report_scan_jobs {
            report_scan_job_counts(self.store.as_ref(), scan_job_counts).await;
        }

        if total > 0 {
            if let Some(topic) = env.stream_output_key.as_deref() {
                let scan_job_id = rows.first().and_then(|(_, _, s)| *s);
                append_completion(self.bus.as_ref(), topic, MODULE, scan_job_id, total).await?;
            }
        }

        Ok(StageOutcome {
            total_results: total,
            errored,
        })
    }
}

#[async_trait]
impl StageCore for HttpStageCore {
    async fn run_simple(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        let asset_id = env
            .resolve_asset_id(None)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or(Uuid::nil());
        let scan_job_id = Uuid::parse_str(&env.scan_job_id).ok();
        let rows: Vec<_> = env
            .domains
            .iter()
            .map(|d| (d.clone(), asset_id, scan_job_id))
            .collect();
        self.run_for_subdomains(env, &rows, false).await
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
        self.run_for_subdomains(env, &rows, true).await
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
        let mut last_scan_job_id: Option<Uuid> = None;

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
                    .probe_subdomain(&msg.subdomain, asset_id, msg.scan_job_id)
                    .await;
                if !records.is_empty() {
                    match self.store.bulk_insert_http_probes(&records).await {
                        Ok(outcome) => {
                            total += outcome.inserted;
                            errored += outcome.errored;
                            if let Some(scan_job_id) = msg.scan_job_id {
                                *scan_job_counts.entry(scan_job_id).or_insert(0) += records.len() as u64;
                                last_scan_job_id = Some(scan_job_id);
                            }
                        }
                        Err(e) => {
                            errored += 1;
                            tracing::warn!(subdomain = %msg.subdomain, error = %e, "failed to persist http probes");
                            return Ok(());
                        }
                    }
                    self.forward_to_intel(
                        env,
                        &msg.subdomain,
                        &msg.parent_domain,
                        asset_id,
                        msg.scan_job_id,
                    )
                    .await?;
                }
                Ok(())
            },
        )
        .await?;

        report_scan_job_counts(self.store.as_ref(), scan_job_counts).await;

        // Every streaming producer that emits >=1 record terminates
        // its output stream with exactly one completion marker
        // (spec.md §3) so downstream consumers (the intel miner on
        // `topic[http]`) exit on completion instead of idling out.
        if total > 0 {
            if let Some(out_topic) = env.stream_output_key.as_deref() {
                append_completion(self.bus.as_ref(), out_topic, MODULE, last_scan_job_id, total).await?;
            }
        }

        tracing::info!(processed, total, errored, "http streaming loop done");
        Ok(StageOutcome {
            total_results: total,
            errored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::ProbeResult;
    use reconpipe_common::config::RunMode;
    use reconpipe_stream::memory::MemoryBus;
    use reconpipe_store::memory::MemoryStore;
    use std::collections::HashMap;

    struct FakeProber(HashMap<(&'static str, String), ProbeResult>);

    #[async_trait]
    impl HttpProber for FakeProber {
        async fn probe(&self, scheme: &str, host: &str) -> anyhow::Result<Option<ProbeResult>> {
            Ok(self.0.get(&(scheme, host.to_string())).cloned())
        }
    }

    fn ok_result() -> ProbeResult {
        ProbeResult {
            status_code: 200,
            title: Some("Example".to_string()),
            server: Some("nginx".to_string()),
            content_type: Some("text/html".to_string()),
            content_length: Some(512),
            final_url: "https://www.example.com/".to_string(),
            chain_status_codes: vec![200],
            location: None,
            technologies: vec!["nginx".to_string()],
            cdn: None,
            favicon_hash: None,
            response_time_ms: 12,
        }
    }

    fn simple_env(domains: Vec<String>, output: Option<String>) -> StageConfig {
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
            stream_output_key: output,
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
    async fn only_responsive_scheme_produces_a_row_and_forwards_once() {
        let mut responses = HashMap::new();
        responses.insert(("https", "www.example.com".to_string()), ok_result());
        let prober = Arc::new(FakeProber(responses));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let core = HttpStageCore::new(store, bus.clone(), prober);

        let env = simple_env(vec!["www.example.com".to_string()], Some("http".to_string()));
        bus.ensure_group("http", "g").await.unwrap();

        let outcome = core.run_simple(&env).await.unwrap();
        assert_eq!(outcome.total_results, 1);

        let deliveries = bus.read("http", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries[1].message.is_completion());
    }

    #[tokio::test]
    async fn unresponsive_subdomain_contributes_nothing() {
        let prober = Arc::new(FakeProber(HashMap::new()));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let core = HttpStageCore::new(store, bus, prober);

        let env = simple_env(vec!["dead.example.com".to_string()], None);
        let outcome = core.run_simple(&env).await.unwrap();
        assert_eq!(outcome.total_results, 0);
        assert_eq!(outcome.errored, 0);
    }

    #[tokio::test]
    async fn streaming_mode_terminates_its_output_with_a_completion_marker() {
        use reconpipe_common::stream_message::SubdomainMessage;

        let mut responses = HashMap::new();
        responses.insert(("https", "a.example.com".to_string()), ok_result());
        let prober = Arc::new(FakeProber(responses));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let scan_job_id = Uuid::new_v4();

        bus.ensure_group("sub", "g").await.unwrap();
        bus.ensure_group("http", "g2").await.unwrap();
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

        let core = HttpStageCore::new(store.clone(), bus.clone(), prober);
        let mut env = simple_env(Vec::new(), Some("http".to_string()));
        env.mode = RunMode::Streaming;
        env.stream_input_key = Some("sub".to_string());
        env.consumer_group_name = Some("g".to_string());
        env.consumer_name = Some("c1".to_string());
        env.max_processing_time_secs = 5;

        let outcome = core.run_streaming(&env).await.unwrap();
        assert_eq!(outcome.total_results, 1);

        let forwarded = bus.read("http", "g2", "c1", 10, 0).await.unwrap();
        assert_eq!(forwarded.len(), 2);
        assert!(forwarded[1].message.is_completion());
    }

    #[tokio::test]
    async fn batch_mode_reports_completion_counters_per_scan_job() {
        let mut responses = HashMap::new();
        responses.insert(("https", "www.example.com".to_string()), ok_result());
        let prober = Arc::new(FakeProber(responses));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let scan_job_id = Uuid::new_v4();

        let core = HttpStageCore::new(store.clone(), bus, prober);
        let mut env = simple_env(vec!["www.example.com".to_string()], None);
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
