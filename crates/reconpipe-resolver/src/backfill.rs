//! Offline reprocess-all loop over the historical-URL table for one
//! asset (spec.md §4.8.5): paged fetch, bounded concurrency via a
//! semaphore, an inter-batch sleep, optional `dry_run`. Grounded on
//! `ChromeFetcher`'s `Semaphore::new(MAX_CONCURRENT_CHROME)` fan-out
//! shape in `rootsignal-archive::fetchers::page`.

use std::sync::Arc;
use std::time::Duration;

use reconpipe_common::domain::HistoricalUrlRecord;
use reconpipe_store::Store;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::config::ResolverConfig;
use crate::stage::ResolverStageCore;

const INTER_BATCH_SLEEP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct BackfillCounters {
    pub fetched: u64,
    pub skipped_fresh: u64,
    pub processed: u64,
    pub errored: u64,
}

/// Reprocess every historical URL for `asset_id` that isn't already
/// fresh in the URL catalog. `dry_run` still probes (so statistics
/// reflect real reachability) but issues no store writes.
pub async fn run_backfill(
    core: &ResolverStageCore,
    asset_id: Uuid,
    config: &ResolverConfig,
) -> Result<BackfillCounters, anyhow::Error> {
    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let counters = Arc::new(Mutex::new(BackfillCounters::default()));
    let mut offset = 0i64;

    loop {
        if let Some(max) = config.max_urls {
            let seen = counters.lock().await.fetched;
            if seen >= max {
                tracing::info!(max, "backfill hit MAX_URLS cap");
                break;
            }
        }

        let page = core
            .store
            .get_historical_urls_page(asset_id, offset, config.probe_batch_size)
            .await?;
        if page.is_empty() {
            break;
        }
        let page_len = page.len();

        let mut handles = Vec::with_capacity(page_len);
        for record in page {
            let permit = semaphore.clone().acquire_owned().await?;
            let counters = counters.clone();
            let fresh = is_fresh(core.store.as_ref(), asset_id, &record, config).await?;
            {
                let mut c = counters.lock().await;
                c.fetched += 1;
                if fresh {
                    c.skipped_fresh += 1;
                }
            }
            if fresh {
                drop(permit);
                continue;
            }

            let dry_run = config.dry_run;
            let source = record.source.clone();
            let url = record.url.clone();
            let store = core.store.clone();
            let probe = core.probe.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = process_one(store.as_ref(), probe.as_ref(), asset_id, &url, &source, dry_run).await;
                let mut c = counters.lock().await;
                match result {
                    Ok(()) => c.processed += 1,
                    Err(e) => {
                        tracing::warn!(url, error = %e, "backfill probe/persist failed for one url");
                        c.errored += 1;
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        offset += page_len as i64;
        tokio::time::sleep(INTER_BATCH_SLEEP).await;
    }

    let final_counters = counters.lock().await.clone();
    tracing::info!(
        fetched = final_counters.fetched,
        skipped_fresh = final_counters.skipped_fresh,
        processed = final_counters.processed,
        errored = final_counters.errored,
        dry_run = config.dry_run,
        "backfill run complete"
    );
    Ok(final_counters)
}

async fn is_fresh(
    store: &dyn Store,
    asset_id: Uuid,
    record: &HistoricalUrlRecord,
    config: &ResolverConfig,
) -> Result<bool, anyhow::Error> {
    let hash = match crate::canonical::url_hash(&record.url) {
        Ok(h) => h,
        Err(_) => return Ok(false),
    };
    let existing = store.get_url_by_hash(asset_id, &hash).await?;
    Ok(match existing.and_then(|r| r.resolved_at) {
        Some(resolved_at) => {
            let ttl = chrono::Duration::from_std(config.resolution_ttl).unwrap_or(chrono::Duration::hours(24));
            chrono::Utc::now().signed_duration_since(resolved_at) < ttl
        }
        None => false,
    })
}

/// The single-URL pipeline used by backfill, independent of
/// [`ResolverStageCore::process`] because `dry_run` must suppress
/// writes without suppressing the probe.
async fn process_one(
    store: &dyn Store,
    probe: &dyn crate::probe::UrlProbe,
    asset_id: Uuid,
    raw_url: &str,
    source: &str,
    dry_run: bool,
) -> Result<(), anyhow::Error> {
    let canonical = crate::canonical::canonicalize(raw_url)?;
    let hash = crate::canonical::url_hash(&canonical)?;
    let outcome = probe.probe(&canonical).await;

    if dry_run {
        return Ok(());
    }

    let existing = store.get_url_by_hash(asset_id, &hash).await?;
    match existing {
        Some(record) => {
            let new_source = (!record.sources.iter().any(|s| s == source)).then_some(source);
            store
                .update_url_resolution(asset_id, &hash, &outcome.resolution, new_source)
                .await?;
        }
        None => {
            let decomposed = crate::decompose::decompose(&canonical);
            let now = chrono::Utc::now();
            let record = reconpipe_common::domain::UrlRecord {
                id: Uuid::new_v4(),
                asset_id,
                canonical_url: canonical,
                url_hash: hash,
                domain: decomposed.domain,
                path: Some(decomposed.path),
                query_params: decomposed.query_params,
                sources: vec![source.to_string()],
                first_discovered_by: source.to_string(),
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
            store.insert_url(&record).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reconpipe_store::memory::MemoryStore;
    use reconpipe_store::ProbeResolution;
    use reconpipe_stream::memory::MemoryBus;

    struct AlwaysAliveProbe;

    #[async_trait]
    impl crate::probe::UrlProbe for AlwaysAliveProbe {
        async fn probe(&self, _canonical_url: &str) -> crate::probe::ProbeOutcome {
            crate::probe::ProbeOutcome {
                resolution: ProbeResolution {
                    is_alive: true,
                    status_code: Some(200),
                    content_type: None,
                    content_length: None,
                    response_time_ms: Some(1),
                    title: None,
                    final_url: None,
                    redirect_chain: vec![200],
                    server: None,
                    technologies: Vec::new(),
                },
                error: None,
            }
        }
    }

    fn config(dry_run: bool) -> ResolverConfig {
        ResolverConfig {
            resolution_ttl: Duration::from_secs(86_400),
            probe_batch_size: 100,
            concurrency: 4,
            max_urls: None,
            dry_run,
        }
    }

    #[tokio::test]
    async fn backfill_inserts_new_urls_from_the_historical_table() {
        let store = Arc::new(MemoryStore::new());
        let asset_id = Uuid::new_v4();
        store
            .bulk_insert_historical_urls(&[HistoricalUrlRecord {
                url: "https://example.com/found".to_string(),
                parent_domain: "example.com".to_string(),
                source: "historical-aggregator".to_string(),
                asset_id,
                scan_job_id: None,
                discovered_at: chrono::Utc::now(),
                metadata: None,
            }])
            .await
            .unwrap();

        let core = ResolverStageCore::new(
            store.clone(),
            Arc::new(MemoryBus::new()),
            Arc::new(AlwaysAliveProbe),
            config(false),
        );

        let counters = run_backfill(&core, asset_id, &config(false)).await.unwrap();
        assert_eq!(counters.processed, 1);
        assert_eq!(counters.skipped_fresh, 0);

        let hash = crate::canonical::url_hash("https://example.com/found").unwrap();
        let record = store.get_url_by_hash(asset_id, &hash).await.unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn dry_run_probes_but_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let asset_id = Uuid::new_v4();
        store
            .bulk_insert_historical_urls(&[HistoricalUrlRecord {
                url: "https://example.com/found".to_string(),
                parent_domain: "example.com".to_string(),
                source: "historical-aggregator".to_string(),
                asset_id,
                scan_job_id: None,
                discovered_at: chrono::Utc::now(),
                metadata: None,
            }])
            .await
            .unwrap();

        let core = ResolverStageCore::new(
            store.clone(),
            Arc::new(MemoryBus::new()),
            Arc::new(AlwaysAliveProbe),
            config(true),
        );

        let counters = run_backfill(&core, asset_id, &config(true)).await.unwrap();
        assert_eq!(counters.processed, 1);

        let hash = crate::canonical::url_hash("https://example.com/found").unwrap();
        let record = store.get_url_by_hash(asset_id, &hash).await.unwrap();
        assert!(record.is_none());
    }
}
