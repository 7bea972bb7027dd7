//! Per-scan-job completion reporting (spec.md §4.4: DNS batch mode
//! "updates per-scan-job completion counters"). A scan job is looked
//! up per parent domain via `ASSET_SCAN_MAPPING`, so several records
//! processed in one run can belong to the same job — callers group
//! their produced records by `scan_job_id` before reporting.

use std::collections::HashMap;

use reconpipe_store::Store;
use uuid::Uuid;

/// Call `Store::update_scan_job_status` once per distinct scan job in
/// `counts`, each carrying that job's own record count as metadata. A
/// failure to update one job's status is logged and does not stop the
/// others from being reported — this is completion bookkeeping, not
/// the record write itself, so it follows spec.md §4.8.7's pattern of
/// "log, don't fail the run" for non-essential side effects.
pub async fn report_scan_job_counts(store: &dyn Store, counts: HashMap<Uuid, u64>) {
    for (scan_job_id, count) in counts {
        let metadata = serde_json::json!({ "records": count });
        if let Err(e) = store
            .update_scan_job_status(scan_job_id, "completed", Some(metadata))
            .await
        {
            tracing::warn!(%scan_job_id, error = %e, "failed to update scan job status");
        }
    }
}
