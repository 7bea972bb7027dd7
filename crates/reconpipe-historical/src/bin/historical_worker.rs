use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reconpipe_common::config::StageConfig;
use reconpipe_historical::{HistoricalStageCore, SubprocessAggregator};
use reconpipe_store::postgres::PostgresStore;
use reconpipe_stream::redis_bus::RedisStreamBus;
use reconpipe_worker::run;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("reconpipe=info".parse()?))
        .init();

    info!("historical-worker starting");

    let env = StageConfig::from_env()?;
    env.log_redacted();

    let store = PostgresStore::connect(&env.store_url).await?;
    store.migrate().await?;
    let store = Arc::new(store);

    let bus = Arc::new(
        RedisStreamBus::connect(
            env.stream_host.as_deref().unwrap_or("127.0.0.1"),
            env.stream_port.unwrap_or(6379),
        )
        .await?,
    );

    let core = HistoricalStageCore::new(store.clone(), bus, Arc::new(SubprocessAggregator::from_env()));

    let outcome = run(&core, &env, store.as_ref()).await?;
    info!(total = outcome.total_results, errored = outcome.errored, "historical-worker done");

    Ok(())
}
