//! Subdomain producer stage core (spec.md §4.3). Enumerates subdomains
//! for one or more apex domains, persists them, and streams them to
//! `topic[sub]` followed by one completion marker.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reconpipe_common::config::StageConfig;
use reconpipe_common::domain::SubdomainRecord;
use reconpipe_common::stream_message::SubdomainMessage;
use reconpipe_common::StreamMessage;
use reconpipe_store::Store;
use reconpipe_stream::StreamBus;
use reconpipe_worker::{append_completion, StageCore, StageOutcome, WorkerError};
use uuid::Uuid;

use crate::enumerator::Enumerator;

const MODULE: &str = "subdomain-producer";

pub struct SubdomainStageCore {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn StreamBus>,
    pub enumerator: Arc<dyn Enumerator>,
}

impl SubdomainStageCore {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn StreamBus>, enumerator: Arc<dyn Enumerator>) -> Self {
        Self {
            store,
            bus,
            enumerator,
        }
    }

    /// Enumerate every apex domain, persist discovered subdomains, and
    /// stream them (plus a trailing completion marker) when an output
    /// topic is configured.
    async fn run_for_apex_domains(
        &self,
        env: &StageConfig,
        asset_id: Option<Uuid>,
        scan_job_id: Option<Uuid>,
        apex_domains: &[String],
    ) -> Result<StageOutcome, WorkerError> {
        let source = self.enumerator.source_tag();
        let mut total = 0u64;
        let mut errored = 0u64;

        for apex in apex_domains {
            let names = match self.enumerator.enumerate(apex).await {
                Ok(names) => names,
                Err(e) => {
                    tracing::warn!(apex, error = %e, "subdomain enumeration failed, skipping domain");
                    errored += 1;
                    continue;
                }
            };

            if names.is_empty() {
                continue;
            }

            let now = Utc::now();
            let records: Vec<SubdomainRecord> = names
                .iter()
                .map(|name| SubdomainRecord {
                    subdomain: name.clone(),
                    parent_domain: apex.clone(),
                    source: source.to_string(),
                    discovered_at: now,
                    asset_id: asset_id.unwrap_or(Uuid::nil()),
                    scan_job_id,
                })
                .collect();

            self.store.bulk_insert_subdomains(&records).await?;

            if let Some(topic) = env.stream_output_key.as_deref() {
                for record in &records {
                    let message = StreamMessage::Subdomain(SubdomainMessage {
                        subdomain: record.subdomain.clone(),
                        source: record.source.clone(),
                        discovered_at: record.discovered_at,
                        parent_domain: record.parent_domain.clone(),
                        scan_job_id: record.scan_job_id,
                        asset_id,
                        metadata: None,
                    });
                    self.bus.append(topic, &message, None, false).await?;
                }
            }

            total += records.len() as u64;
        }

        if total > 0 {
            if let Some(topic) = env.stream_output_key.as_deref() {
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
impl StageCore for SubdomainStageCore {
    async fn run_simple(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        let asset_id = env.resolve_asset_id(None).and_then(|s| Uuid::parse_str(s).ok());
        let scan_job_id = Uuid::parse_str(&env.scan_job_id).ok();
        self.run_for_apex_domains(env, asset_id, scan_job_id, &env.domains)
            .await
    }

    async fn run_batch(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        let asset_id = env
            .batch_asset_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| WorkerError::MissingVariable("ASSET_ID".to_string()))?;
        let scan_job_id = Uuid::parse_str(&env.scan_job_id).ok();

        let apex_domains = self.store.fetch_apex_domains(asset_id).await?;
        let offset = env.batch_offset.unwrap_or(0).max(0) as usize;
        let limit = env.batch_limit.unwrap_or(apex_domains.len() as i64).max(0) as usize;
        let slice: Vec<String> = apex_domains
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|d| d.domain)
            .collect();

        self.run_for_apex_domains(env, Some(asset_id), scan_job_id, &slice)
            .await
    }

    async fn run_streaming(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        // The subdomain producer has no upstream topic to consume; in
        // streaming mode it enumerates every active apex domain for the
        // asset and streams continuously rather than pulling a
        // pre-sliced batch.
        let asset_id = env
            .asset_id_fallback
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| WorkerError::MissingVariable("ASSET_ID".to_string()))?;
        let scan_job_id = Uuid::parse_str(&env.scan_job_id).ok();

        let apex_domains: Vec<String> = self
            .store
            .fetch_apex_domains(asset_id)
            .await?
            .into_iter()
            .map(|d| d.domain)
            .collect();

        self.run_for_apex_domains(env, Some(asset_id), scan_job_id, &apex_domains)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconpipe_common::config::RunMode;
    use reconpipe_stream::memory::MemoryBus;
    use reconpipe_store::memory::MemoryStore;

    struct FixedEnumerator(Vec<String>);

    #[async_trait]
    impl Enumerator for FixedEnumerator {
        fn source_tag(&self) -> &'static str {
            "fixed"
        }
        async fn enumerate(&self, _apex_domain: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.0.clone())
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
    async fn simple_mode_persists_and_streams_with_trailing_completion() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let enumerator = Arc::new(FixedEnumerator(vec!["a.example.com".to_string()]));
        let core = SubdomainStageCore::new(store, bus.clone(), enumerator);

        let env = simple_env(vec!["example.com".to_string()], Some("sub".to_string()));
        bus.ensure_group("sub", "g").await.unwrap();

        let outcome = core.run_simple(&env).await.unwrap();
        assert_eq!(outcome.total_results, 1);

        let deliveries = bus.read("sub", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries[1].message.is_completion());
    }
}
