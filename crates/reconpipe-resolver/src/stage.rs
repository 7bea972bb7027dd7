//! URL resolver ingress pipeline (spec.md §4.8.3): canonicalize, look
//! up by `(asset_id, url_hash)`, decide freshness, probe when stale or
//! new, persist, ack. Consumes `topic[url]`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reconpipe_common::config::StageConfig;
use reconpipe_common::domain::{HistoricalUrlRecord, UrlRecord};
use reconpipe_common::stream_message::UrlMessage;
use reconpipe_common::StreamMessage;
use reconpipe_store::{ProbeResolution, Store};
use reconpipe_stream::{Delivery, StreamBus};
use reconpipe_worker::{run_streaming_loop, StageCore, StageOutcome, WorkerError};
use uuid::Uuid;

use crate::canonical::{canonicalize, url_hash};
use crate::config::ResolverConfig;
use crate::decompose::decompose;
use crate::probe::UrlProbe;

pub struct ResolverStageCore {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn StreamBus>,
    pub probe: Arc<dyn UrlProbe>,
    pub config: ResolverConfig,
}

/// One URL to resolve, stripped of its source shape (stream message vs
/// historical-URL row) before it enters the pipeline.
struct IngressInput {
    url: String,
    source: String,
    asset_id: Uuid,
    scan_job_id: Option<Uuid>,
}

/// Whether a message was fully handled by the pipeline, or rejected at
/// the parse step (spec.md §4.8.7: "log, skip, ack").
pub enum IngressResult {
    ParseFailed,
    Handled,
}

impl ResolverStageCore {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn StreamBus>, probe: Arc<dyn UrlProbe>, config: ResolverConfig) -> Self {
        Self {
            store,
            bus,
            probe,
            config,
        }
    }

    /// Runs the full §4.8.3 pipeline for one URL. Store lookup/write
    /// failures propagate (caller must not ack); a source-merge
    /// failure on an otherwise-successful path is logged and
    /// swallowed (spec.md §4.8.7).
    async fn process(&self, input: IngressInput) -> Result<IngressResult, WorkerError> {
        let canonical = match canonicalize(&input.url) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(url = %input.url, error = %e, "failed to canonicalize url, skipping");
                return Ok(IngressResult::ParseFailed);
            }
        };
        let hash = url_hash(&canonical).expect("already-canonical url always hashes");

        let existing = self.store.get_url_by_hash(input.asset_id, &hash).await?;

        if let Some(record) = &existing {
            if let Some(resolved_at) = record.resolved_at {
                let age = Utc::now().signed_duration_since(resolved_at);
                let ttl = chrono::Duration::from_std(self.config.resolution_ttl)
                    .unwrap_or(chrono::Duration::hours(24));
                if age < ttl {
                    if !record.sources.iter().any(|s| s == &input.source) {
                        if let Err(e) = self
                            .store
                            .add_source_to_url(input.asset_id, &hash, &input.source)
                            .await
                        {
                            tracing::warn!(url = %canonical, error = %e, "source merge failed, continuing");
                        }
                    }
                    return Ok(IngressResult::Handled);
                }
            }
        }

        let outcome = self.probe.probe(&canonical).await;
        if let Some(error) = &outcome.error {
            tracing::debug!(url = %canonical, error, "probe did not succeed, persisting is_alive=false");
        }

        match &existing {
            Some(record) => {
                let new_source = (!record.sources.iter().any(|s| s == &input.source))
                    .then_some(input.source.as_str());
                self.store
                    .update_url_resolution(input.asset_id, &hash, &outcome.resolution, new_source)
                    .await?;
            }
            None => {
                let decomposed = decompose(&canonical);
                let now = Utc::now();
                let record = UrlRecord {
                    id: Uuid::new_v4(),
                    asset_id: input.asset_id,
                    canonical_url: canonical.clone(),
                    url_hash: hash,
                    domain: decomposed.domain,
                    path: Some(decomposed.path),
                    query_params: decomposed.query_params,
                    sources: vec![input.source.clone()],
                    first_discovered_by: input.source,
                    first_discovered_at: now,
                    resolved_at: Some(now),
                    is_alive: Some(outcome.resolution.is_alive),
                    status_code: outcome.resolution.status_code,
                    content_type: outcome.resolution.content_type,
                    content_length: outcome.resolution.content_length,
                    response_time_ms: outcome.resolution.response_time_ms,
                    title: outcome.resolution.title,
                    final_url: outcome.resolution.final_url,
                    redirect_chain: outcome.resolution.redirect_chain,
                    server: outcome.resolution.server,
                    technologies: outcome.resolution.technologies,
                    file_extension: decomposed.file_extension,
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_url(&record).await?;
            }
        }

        let _ = input.scan_job_id;
        Ok(IngressResult::Handled)
    }

    fn input_from_message(env: &StageConfig, msg: UrlMessage) -> IngressInput {
        let asset_id = msg
            .asset_id
            .or_else(|| env.asset_id_fallback.as_deref().and_then(|s| Uuid::parse_str(s).ok()))
            .unwrap_or(Uuid::nil());
        IngressInput {
            url: msg.url,
            source: msg.source,
            asset_id,
            scan_job_id: msg.scan_job_id,
        }
    }

    fn input_from_historical(record: HistoricalUrlRecord) -> IngressInput {
        IngressInput {
            url: record.url,
            source: record.source,
            asset_id: record.asset_id,
            scan_job_id: record.scan_job_id,
        }
    }
}

#[async_trait]
impl StageCore for ResolverStageCore {
    async fn run_simple(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        let asset_id = env
            .resolve_asset_id(None)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or(Uuid::nil());
        let scan_job_id = Uuid::parse_str(&env.scan_job_id).ok();

        let mut total = 0u64;
        let mut errored = 0u64;
        for url in &env.domains {
            let input = IngressInput {
                url: url.clone(),
                source: "simple".to_string(),
                asset_id,
                scan_job_id,
            };
            match self.process(input).await? {
                IngressResult::Handled => total += 1,
                IngressResult::ParseFailed => errored += 1,
            }
        }

        Ok(StageOutcome {
            total_results: total,
            errored,
        })
    }

    /// Processes one page of the historical-URL table through the
    /// same pipeline the streaming consumer uses — `BATCH_OFFSET`/
    /// `BATCH_LIMIT` select the page. The repeated, all-pages,
    /// semaphore-bounded sweep is [`crate::backfill::run_backfill`],
    /// reached separately from `BACKFILL_MODE`, not through this mode.
    async fn run_batch(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError> {
        let asset_id = env
            .batch_asset_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| WorkerError::MissingVariable("ASSET_ID".to_string()))?;
        let offset = env.batch_offset.unwrap_or(0);
        let limit = env.batch_limit.unwrap_or(100);

        let page = self
            .store
            .get_historical_urls_page(asset_id, offset, limit)
            .await?;

        let mut total = 0u64;
        let mut errored = 0u64;
        for record in page {
            match self.process(Self::input_from_historical(record)).await? {
                IngressResult::Handled => total += 1,
                IngressResult::ParseFailed => errored += 1,
            }
        }

        Ok(StageOutcome {
            total_results: total,
            errored,
        })
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

        let processed = run_streaming_loop(
            self.bus.as_ref(),
            topic,
            group,
            consumer,
            env.batch_size,
            env.block_milliseconds,
            Duration::from_secs(env.max_processing_time_secs),
            |delivery: Delivery| async {
                let StreamMessage::Url(msg) = delivery.message else {
                    return Ok(());
                };
                match self.process(Self::input_from_message(env, msg)).await? {
                    IngressResult::Handled => total += 1,
                    IngressResult::ParseFailed => errored += 1,
                }
                Ok(())
            },
        )
        .await?;

        tracing::info!(processed, total, errored, "resolver streaming loop done");
        Ok(StageOutcome {
            total_results: total,
            errored,
        })
    }
}
