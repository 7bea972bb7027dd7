use std::env;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use reconpipe_common::config::StageConfig;
use reconpipe_resolver::{run_backfill, ReqwestUrlProbe, ResolverConfig, ResolverStageCore};
use reconpipe_store::postgres::PostgresStore;
use reconpipe_stream::redis_bus::RedisStreamBus;
use reconpipe_worker::run;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("reconpipe=info".parse()?))
        .init();

    info!("resolver-worker starting");

    let resolver_config = ResolverConfig::from_env();

    let store_url = reconpipe_common::required_env("STORE_URL")?;
    let store = PostgresStore::connect(&store_url).await?;
    store.migrate().await?;
    let store = Arc::new(store);

    let stream_host = env::var("STREAM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let stream_port: u16 = env::var("STREAM_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(6379);
    let bus = Arc::new(RedisStreamBus::connect(&stream_host, stream_port).await?);

    let core = ResolverStageCore::new(
        store.clone(),
        bus,
        Arc::new(ReqwestUrlProbe::new()),
        resolver_config.clone(),
    );

    // Backfill is an offline reprocess-all loop (spec.md §4.8.5), not
    // one of the three `StageCore` run modes — it is reached through
    // its own flag rather than `BATCH_MODE`/`STREAMING_MODE`.
    if env::var("BACKFILL_MODE").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false) {
        let asset_id = Uuid::parse_str(&reconpipe_common::required_env("ASSET_ID")?)?;
        let counters = run_backfill(&core, asset_id, &resolver_config).await?;
        info!(
            fetched = counters.fetched,
            processed = counters.processed,
            skipped_fresh = counters.skipped_fresh,
            errored = counters.errored,
            "resolver-worker backfill done"
        );
        return Ok(());
    }

    let env_cfg = StageConfig::from_env()?;
    env_cfg.log_redacted();

    let outcome = run(&core, &env_cfg, store.as_ref()).await?;
    info!(total = outcome.total_results, errored = outcome.errored, "resolver-worker done");

    Ok(())
}
