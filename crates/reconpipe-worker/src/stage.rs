//! The stage-core capability trait and the thin `Mode` dispatch every
//! stage binary's `main.rs` runs (spec.md §9: "prefer tagged variants
//! over deep type hierarchies"; grounded on
//! `rootsignal-scout-supervisor/src/main.rs`'s
//! config → connect → construct → `.run()` shape).

use async_trait::async_trait;
use reconpipe_common::config::{RunMode, StageConfig};
use reconpipe_common::domain::BatchStatus;
use reconpipe_store::Store;
use uuid::Uuid;

use crate::WorkerError;

/// How many records (of whatever shape the stage produces) a run
/// emitted, logged and folded into the batch-status metadata on exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageOutcome {
    pub total_results: u64,
    pub errored: u64,
}

/// A stage's three mode-specific entry points (spec.md §9's `{validate_env, run}`
/// capability set, specialized per mode rather than a single
/// polymorphic `run`). A stage binary implements this once, over
/// whatever dependencies it needs, and hands it to [`run`].
#[async_trait]
pub trait StageCore: Send + Sync {
    async fn run_simple(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError>;
    async fn run_batch(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError>;
    async fn run_streaming(&self, env: &StageConfig) -> Result<StageOutcome, WorkerError>;
}

/// Dispatch to the stage core's mode-appropriate entry point and, for
/// batch mode, flip `BatchJob.status` to `completed`/`failed` before
/// returning (spec.md §4.1 "Failure semantics").
pub async fn run(
    core: &dyn StageCore,
    env: &StageConfig,
    store: &dyn Store,
) -> Result<StageOutcome, WorkerError> {
    let result = match env.mode {
        RunMode::Simple => core.run_simple(env).await,
        RunMode::Batch => core.run_batch(env).await,
        RunMode::Streaming => core.run_streaming(env).await,
    };

    if env.mode == RunMode::Batch {
        if let Some(batch_id) = env.batch_id.as_deref() {
            report_batch_status(store, batch_id, &result).await;
        }
    }

    result
}

async fn report_batch_status(
    store: &dyn Store,
    batch_id: &str,
    result: &Result<StageOutcome, WorkerError>,
) {
    let Ok(batch_id) = Uuid::parse_str(batch_id) else {
        tracing::error!(batch_id, "invalid BATCH_ID, cannot report status");
        return;
    };

    let (status, metadata) = match result {
        Ok(outcome) => (
            BatchStatus::Completed,
            Some(serde_json::json!({
                "total_results": outcome.total_results,
                "errored": outcome.errored,
            })),
        ),
        Err(e) => (
            BatchStatus::Failed,
            Some(serde_json::json!({ "error": e.to_string() })),
        ),
    };

    if let Err(e) = store.update_batch_status(batch_id, status, metadata).await {
        tracing::error!(error = %e, "failed to update batch status after stage run");
    }
}
