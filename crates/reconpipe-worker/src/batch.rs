//! Batch-mode pagination/assignment (spec.md §2, §4.1's "batch-mode
//! pagination/assignment machinery" generalized across every
//! subdomain-consuming stage).

use reconpipe_common::config::StageConfig;
use reconpipe_common::parent_domain;
use reconpipe_store::Store;
use uuid::Uuid;

use crate::WorkerError;

/// One subdomain resolved for a batch run, with its scan-job id looked
/// up through `ASSET_SCAN_MAPPING` by parent domain.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub subdomain: String,
    pub parent_domain: String,
    pub scan_job_id: Option<Uuid>,
}

/// Resolve the subdomain list for a batch-mode run: from the store when
/// `FETCH_SUBDOMAINS=true`, otherwise treating `DOMAINS` as the input
/// set directly (simple mode re-used for a batch-shaped target list).
pub async fn resolve_targets(
    env: &StageConfig,
    store: &dyn Store,
) -> Result<Vec<ResolvedTarget>, WorkerError> {
    let raw: Vec<(String, String)> = if env.fetch_subdomains {
        let asset_id = env
            .batch_asset_id
            .as_deref()
            .ok_or_else(|| WorkerError::MissingVariable("ASSET_ID".to_string()))?;
        let asset_id = Uuid::parse_str(asset_id)
            .map_err(|e| WorkerError::Stage(anyhow::anyhow!("invalid ASSET_ID: {e}")))?;
        let offset = env.batch_offset.unwrap_or(0);
        let limit = env.batch_limit.unwrap_or(100);
        let records = store
            .get_subdomains_for_asset(asset_id, offset, limit)
            .await?;
        records
            .into_iter()
            .map(|r| (r.subdomain, r.parent_domain))
            .collect()
    } else {
        env.domains
            .iter()
            .map(|d| (d.clone(), parent_domain(d)))
            .collect()
    };

    Ok(raw
        .into_iter()
        .map(|(subdomain, parent)| {
            let scan_job_id = scan_job_for_parent(env, &parent);
            ResolvedTarget {
                subdomain,
                parent_domain: parent,
                scan_job_id,
            }
        })
        .collect())
}

fn scan_job_for_parent(env: &StageConfig, parent: &str) -> Option<Uuid> {
    env.asset_scan_mapping
        .get(parent)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconpipe_common::config::RunMode;
    use reconpipe_store::memory::MemoryStore;
    use serde_json::json;

    fn env_with_domains(domains: Vec<String>) -> StageConfig {
        StageConfig {
            scan_job_id: "job".to_string(),
            user_id: "user".to_string(),
            store_url: "postgres://localhost".to_string(),
            store_service_key: "key".to_string(),
            asset_id_fallback: None,
            mode: RunMode::Batch,
            batch_id: Some(Uuid::new_v4().to_string()),
            batch_asset_id: Some(Uuid::new_v4().to_string()),
            batch_offset: Some(0),
            batch_limit: Some(100),
            fetch_subdomains: false,
            asset_scan_mapping: serde_json::Map::new(),
            domains,
            stream_input_key: None,
            stream_output_key: None,
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
    async fn resolves_targets_from_domains_and_maps_scan_job() {
        let mut env = env_with_domains(vec!["www.example.com".to_string()]);
        env.asset_scan_mapping
            .insert("example.com".to_string(), json!(Uuid::nil().to_string()));
        let store = MemoryStore::new();

        let targets = resolve_targets(&env, &store).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].parent_domain, "example.com");
        assert_eq!(targets[0].scan_job_id, Some(Uuid::nil()));
    }
}
