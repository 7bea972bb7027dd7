//! Threat-intel URL miner stage core (spec.md §4.7). Consumes the
//! subdomain-shaped stream the HTTP prober writes to `topic[http]`;
//! per unique host, in-memory set), queries an intel provider,
//! persists discoveries, and forwards them to `topic[url]`. Unlike
//! every other consumer, it emits its own completion marker once the
//! upstream marker arrives and its own queued work has drained,
//! rather than simply acking the marker and exiting.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reconpipe_common::config::StageConfig;
use reconpipe_common::domain::HistoricalUrlRecord;
use reconpipe_common::stream_message::UrlMessage;
use reconpipe_common::StreamMessage;
use reconpipe_store::Store;
use reconpipe_stream::StreamBus;
use reconpipe_worker::{append_completion, StageCore, StageOutcome, WorkerError};
use uuid::Uuid;

use crate::provider::IntelProvider;

const MODULE: &str = "intel-miner";

pub struct IntelStageCore {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn StreamBus>,
    pub provider: Arc<dyn IntelProvider>,
    seen_hosts: Mutex<HashSet<String>>,
}

impl IntelStageCore {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn StreamBus>, provider: Arc<dyn IntelProvider>) -> Self {
        Self {
            store,
            bus,
            provider,
            seen_hosts: Mutex::new(HashSet::new()),
        }
    }

    fn mark_seen(&self, host: &str) -> bool {
        let mut seen = self.seen_hosts.lock().unwrap();
        seen.insert(host.to_string())
    }

    async fn mine_host(
        &self,
        env: &StageConfig,
        host: &str,
        parent_domain: &str,
        asset_id: Uuid,
        scan_job_id: Option<Uuid>,
    ) -> Result<u64, WorkerError> {
        if !self.mark_seen(host) {
            return Ok(0);
        }

        let urls = match self.provider.discover_urls(host).await {
            Ok(urls) if !urls.is_empty() => urls,
            Ok(_) => return Ok(0),
            Err(e) => {
                tracing::warn!(host, error = %e, "threat-intel lookup failed, skipping host");
                return Ok(0);
            }
        };

        let now = Utc::now();
        let records: Vec<HistoricalUrlRecord> = urls
            .iter()
            .map(|url| HistoricalUrlRecord {
                url: url.clone(),
                parent_domain: parent_domain.to_string(),
                source: self.provider.source_tag().to_string(),
                asset_id,
                scan_job_id,
                discovered_at: now,
                metadata: None,
            })
            .collect();

        let inserted = self.store.bulk_insert_historical_urls(&records).await?;

        if let Some(topic) = env.stream_output_key.as_deref() {
            for record in &records {
                let message = StreamMessage::Url(UrlMessage {
                    url: record.url.clone(),
                    parent_domain: record.parent_domain.clone(),
                    source: record.source.clone(),
                    asset_id: Some(asset_id),
                    scan_job_id,
                    discovered_at: record.discovered_at,
                });
                self.bus.append(topic, &message, None, false).await?;
            }
        }

        Ok(inserted)
    }
}

#[async_trait]
impl StageCore for IntelStageCore {
    async fn run_simple(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        let asset_id = env
            .resolve_asset_id(None)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or(Uuid::nil());
        let scan_job_id = Uuid::parse_str(&env.scan_job_id).ok();

        let mut total = 0u64;
        for host in &env.domains {
            let parent = reconpipe_common::parent_domain(host);
            total += self.mine_host(env, host, &parent, asset_id, scan_job_id).await?;
        }

        if total > 0 {
            if let Some(topic) = env.stream_output_key.as_deref() {
                append_completion(self.bus.as_ref(), topic, MODULE, scan_job_id, total).await?;
            }
        }

        Ok(StageOutcome {
            total_results: total,
            errored: 0,
        })
    }

    async fn run_batch(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        let asset_id = env
            .batch_asset_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| WorkerError::MissingVariable("ASSET_ID".to_string()))?;

        let targets = reconpipe_worker::resolve_targets(env, self.store.as_ref()).await?;
        let mut total = 0u64;
        for target in targets {
            total += self
                .mine_host(env, &target.subdomain, &target.parent_domain, asset_id, target.scan_job_id)
                .await?;
        }

        Ok(StageOutcome {
            total_results: total,
            errored: 0,
        })
    }

    /// Reads `topic[http]` until the upstream completion marker
    /// arrives, mines every subdomain seen along the way, then emits
    /// its own completion marker once that queued work has drained
    /// (spec.md §4.7) instead of exiting immediately.
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
        let deadline = Duration::from_secs(env.max_processing_time_secs);

        self.bus.ensure_group(topic, group).await?;
        let started = Instant::now();
        let mut total = 0u64;
        let mut upstream_scan_job_id = None;

        loop {
            if started.elapsed() >= deadline {
                tracing::warn!(topic, group, "intel streaming loop hit wall-clock deadline");
                break;
            }

            let deliveries = self
                .bus
                .read(topic, group, consumer, env.batch_size, env.block_milliseconds)
                .await?;
            if deliveries.is_empty() {
                tokio::time::sleep(Duration::from_millis(env.block_milliseconds.min(250))).await;
                continue;
            }

            let mut saw_completion = false;
            for delivery in deliveries {
                if delivery.message.is_completion() {
                    if let StreamMessage::Completion(marker) = &delivery.message {
                        upstream_scan_job_id = marker.scan_job_id;
                    }
                    self.bus.ack(topic, group, &delivery.id).await?;
                    saw_completion = true;
                    continue;
                }

                if let StreamMessage::Subdomain(msg) = delivery.message {
                    let asset_id = msg
                        .asset_id
                        .or_else(|| env.asset_id_fallback.as_deref().and_then(|s| Uuid::parse_str(s).ok()))
                        .unwrap_or(Uuid::nil());
                    total += self
                        .mine_host(env, &msg.subdomain, &msg.parent_domain, asset_id, msg.scan_job_id)
                        .await?;
                }
                self.bus.ack(topic, group, &delivery.id).await?;
            }

            if saw_completion {
                break;
            }
        }

        if let Some(topic) = env.stream_output_key.as_deref() {
            append_completion(self.bus.as_ref(), topic, MODULE, upstream_scan_job_id, total).await?;
        }

        Ok(StageOutcome {
            total_results: total,
            errored: 0,
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

    struct FixedProvider(Vec<String>);

    #[async_trait]
    impl IntelProvider for FixedProvider {
        fn source_tag(&self) -> &'static str {
            "threat-intel"
        }
        async fn discover_urls(&self, _host: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    fn env_for_streaming() -> StageConfig {
        StageConfig {
            scan_job_id: Uuid::new_v4().to_string(),
            user_id: "user".to_string(),
            store_url: "postgres://localhost".to_string(),
            store_service_key: "key".to_string(),
            asset_id_fallback: Some(Uuid::new_v4().to_string()),
            mode: RunMode::Streaming,
            batch_id: None,
            batch_asset_id: None,
            batch_offset: None,
            batch_limit: None,
            fetch_subdomains: false,
            asset_scan_mapping: serde_json::Map::new(),
            domains: Vec::new(),
            stream_input_key: Some("http".to_string()),
            stream_output_key: Some("url".to_string()),
            consumer_group_name: Some("g".to_string()),
            consumer_name: Some("c1".to_string()),
            stream_host: None,
            stream_port: None,
            batch_size: 50,
            block_milliseconds: 0,
            max_processing_time_secs: 5,
        }
    }

    #[tokio::test]
    async fn dedups_hosts_and_emits_its_own_completion_after_draining() {
        let provider = Arc::new(FixedProvider(vec!["https://a.example.com/secret".to_string()]));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let core = IntelStageCore::new(store, bus.clone(), provider);

        let env = env_for_streaming();
        bus.ensure_group("http", "g").await.unwrap();
        bus.ensure_group("url", "g").await.unwrap();

        for _ in 0..2 {
            bus.append(
                "http",
                &StreamMessage::Subdomain(SubdomainMessage {
                    subdomain: "a.example.com".to_string(),
                    source: "http-prober".to_string(),
                    discovered_at: Utc::now(),
                    parent_domain: "example.com".to_string(),
                    scan_job_id: None,
                    asset_id: None,
                    metadata: None,
                }),
                None,
                false,
            )
            .await
            .unwrap();
        }
        reconpipe_worker::append_completion(bus.as_ref(), "http", "http-prober", None, 2)
            .await
            .unwrap();

        let outcome = core.run_streaming(&env).await.unwrap();
        assert_eq!(outcome.total_results, 1);

        let forwarded = bus.read("url", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(forwarded.len(), 2);
        assert!(forwarded[1].message.is_completion());
    }
}
