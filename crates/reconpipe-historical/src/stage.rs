//! Historical-URL producer stage core (spec.md §4.6). Per apex
//! domain, shells out to an archive aggregator, persists the
//! discovered URLs, and streams them to `topic[url]` with a trailing
//! completion marker, soft-capped at ~100,000 entries total.

use std::sync::Arc;

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

use crate::aggregator::UrlAggregator;

const MODULE: &str = "historical-producer";
const SOURCE: &str = "historical-aggregator";

/// Approximate soft cap on total URLs streamed per run (spec.md §4.6).
const SOFT_CAP: usize = 100_000;

pub struct HistoricalStageCore {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn StreamBus>,
    pub aggregator: Arc<dyn UrlAggregator>,
}

impl HistoricalStageCore {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn StreamBus>, aggregator: Arc<dyn UrlAggregator>) -> Self {
        Self {
            store,
            bus,
            aggregator,
        }
    }

    async fn run_for_apex_domains(
        &self,
        env: &StageConfig,
        asset_id: Option<Uuid>,
        scan_job_id: Option<Uuid>,
        apex_domains: &[String],
    ) -> Result<StageOutcome, WorkerError> {
        let mut total = 0u64;
        let mut errored = 0u64;
        let mut remaining_budget = SOFT_CAP;

        for apex in apex_domains {
            if remaining_budget == 0 {
                tracing::warn!(apex, "historical URL soft cap reached, skipping remaining domains");
                break;
            }

            let urls = match self.aggregator.aggregate(apex).await {
                Ok(urls) => urls,
                Err(e) => {
                    tracing::warn!(apex, error = %e, "historical aggregation failed, skipping domain");
                    errored += 1;
                    continue;
                }
            };
            if urls.is_empty() {
                continue;
            }

            let trimmed: Vec<&String> = urls.iter().take(remaining_budget).collect();
            if trimmed.len() < urls.len() {
                tracing::warn!(
                    apex,
                    dropped = urls.len() - trimmed.len(),
                    "historical URL soft cap trimmed this domain's results"
                );
            }
            remaining_budget -= trimmed.len();

            let now = Utc::now();
            let records: Vec<HistoricalUrlRecord> = trimmed
                .iter()
                .map(|url| HistoricalUrlRecord {
                    url: (*url).clone(),
                    parent_domain: apex.clone(),
                    source: SOURCE.to_string(),
                    asset_id: asset_id.unwrap_or(Uuid::nil()),
                    scan_job_id,
                    discovered_at: now,
                    metadata: None,
                })
                .collect();

            match self.store.bulk_insert_historical_urls(&records).await {
                Ok(n) => total += n,
                Err(e) => {
                    errored += 1;
                    tracing::warn!(apex, error = %e, "failed to persist historical urls");
                    continue;
                }
            }

            if let Some(topic) = env.stream_output_key.as_deref() {
                for record in &records {
                    let message = StreamMessage::Url(UrlMessage {
                        url: record.url.clone(),
                        parent_domain: record.parent_domain.clone(),
                        source: record.source.clone(),
                        asset_id,
                        scan_job_id,
                        discovered_at: record.discovered_at,
                    });
                    self.bus.append(topic, &message, Some(SOFT_CAP), true).await?;
                }
            }
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
impl StageCore for HistoricalStageCore {
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
        // Same rationale as the subdomain producer: there is no
        // upstream topic feeding this stage, so streaming mode fetches
        // every active apex domain for the asset and runs the same
        // per-domain pipeline as batch mode.
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

    struct FixedAggregator(Vec<String>);

    #[async_trait]
    impl UrlAggregator for FixedAggregator {
        async fn aggregate(&self, _domain: &str) -> anyhow::Result<Vec<String>> {
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
    async fn simple_mode_persists_tagged_urls_and_streams_with_completion() {
        let aggregator = Arc::new(FixedAggregator(vec![
            "https://www.example.com/a".to_string(),
            "https://www.example.com/b".to_string(),
        ]));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let core = HistoricalStageCore::new(store, bus.clone(), aggregator);

        let env = simple_env(vec!["example.com".to_string()], Some("url".to_string()));
        bus.ensure_group("url", "g").await.unwrap();

        let outcome = core.run_simple(&env).await.unwrap();
        assert_eq!(outcome.total_results, 2);

        let deliveries = bus.read("url", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(deliveries.len(), 3);
        assert!(deliveries[2].message.is_completion());
        match &deliveries[0].message {
            StreamMessage::Url(m) => assert_eq!(m.source, "historical-aggregator"),
            other => panic!("expected Url message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn aggregation_failure_on_one_domain_does_not_abort_the_run() {
        struct FlakyAggregator;
        #[async_trait]
        impl UrlAggregator for FlakyAggregator {
            async fn aggregate(&self, domain: &str) -> anyhow::Result<Vec<String>> {
                if domain == "broken.com" {
                    anyhow::bail!("subprocess failed")
                }
                Ok(vec!["https://ok.com/a".to_string()])
            }
        }

        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let core = HistoricalStageCore::new(store, bus, Arc::new(FlakyAggregator));

        let env = simple_env(vec!["broken.com".to_string(), "ok.com".to_string()], None);
        let outcome = core.run_simple(&env).await.unwrap();

        assert_eq!(outcome.total_results, 1);
        assert_eq!(outcome.errored, 1);
    }
}
