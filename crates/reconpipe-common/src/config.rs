//! Environment-variable configuration, one struct per worker mode.
//!
//! Follows the teacher's `Config::*_from_env()` split (one constructor
//! per binary, reading only what that binary needs) but returns a
//! `Result` instead of panicking: spec.md §4.1 requires a missing
//! required variable to be fatal *before any side effect*, and a
//! batch-mode stage still needs the chance to flip its `BatchJob`
//! status to `failed` before the process exits, which a panic would
//! skip.

use std::env;

use crate::error::ReconError;

/// Which of the three run modes a stage selected, per spec.md §4.1's
/// precedence: streaming > batch > simple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Simple,
    Batch,
    Streaming,
}

impl RunMode {
    /// Select a mode from the `BATCH_MODE` / `STREAMING_MODE` flags.
    pub fn select(streaming: bool, batch: bool) -> Self {
        if streaming {
            RunMode::Streaming
        } else if batch {
            RunMode::Batch
        } else {
            RunMode::Simple
        }
    }
}

fn flag(key: &str) -> bool {
    env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Read a required environment variable, surfacing a `ReconError`
/// instead of panicking (see module docs).
pub fn required_env(key: &str) -> Result<String, ReconError> {
    env::var(key).map_err(|_| ReconError::MissingEnvVar(key.to_string()))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ReconError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ReconError::InvalidEnvVar {
            name: key.to_string(),
            reason: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

/// Identity and infrastructure variables every stage needs regardless
/// of mode ("Always" row of spec.md §4.1).
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub scan_job_id: String,
    pub user_id: String,
    pub store_url: String,
    pub store_service_key: String,
    pub asset_id_fallback: Option<String>,

    pub mode: RunMode,

    // Batch
    pub batch_id: Option<String>,
    pub batch_asset_id: Option<String>,
    pub batch_offset: Option<i64>,
    pub batch_limit: Option<i64>,
    pub fetch_subdomains: bool,
    pub asset_scan_mapping: serde_json::Map<String, serde_json::Value>,

    // Simple
    pub domains: Vec<String>,

    // Streaming
    pub stream_input_key: Option<String>,
    pub stream_output_key: Option<String>,
    pub consumer_group_name: Option<String>,
    pub consumer_name: Option<String>,
    pub stream_host: Option<String>,
    pub stream_port: Option<u16>,
    pub batch_size: usize,
    pub block_milliseconds: u64,
    pub max_processing_time_secs: u64,
}

impl StageConfig {
    /// Load and validate configuration for the given mode. Missing
    /// required variables are reported as a `Vec` so the caller can
    /// log every problem at once, not just the first (spec.md §4.1:
    /// "missing required variable ⇒ fatal before any side effect").
    pub fn from_env() -> Result<Self, ReconError> {
        let streaming = flag("STREAMING_MODE");
        let batch = flag("BATCH_MODE");
        let mode = RunMode::select(streaming, batch);

        let scan_job_id = required_env("SCAN_JOB_ID")?;
        let user_id = required_env("USER_ID")?;
        let store_url = required_env("STORE_URL")?;
        let store_service_key = required_env("STORE_SERVICE_KEY")?;
        let asset_id_fallback = env::var("ASSET_ID").ok();

        let (batch_id, batch_asset_id, batch_offset, batch_limit) = match mode {
            RunMode::Batch => (
                Some(required_env("BATCH_ID")?),
                Some(required_env("ASSET_ID")?),
                Some(parse_env::<i64>("BATCH_OFFSET", 0)?),
                Some(parse_env::<i64>("BATCH_LIMIT", 100)?),
            ),
            _ => (None, None, None, None),
        };
        let fetch_subdomains = flag("FETCH_SUBDOMAINS");
        let asset_scan_mapping = match env::var("ASSET_SCAN_MAPPING") {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| ReconError::InvalidEnvVar {
                    name: "ASSET_SCAN_MAPPING".to_string(),
                    reason: e.to_string(),
                })?,
            Err(_) => serde_json::Map::new(),
        };

        let domains = match mode {
            RunMode::Simple => {
                let raw = required_env("DOMAINS")?;
                serde_json::from_str(&raw).map_err(|e| ReconError::InvalidEnvVar {
                    name: "DOMAINS".to_string(),
                    reason: e.to_string(),
                })?
            }
            _ => Vec::new(),
        };

        // STREAM_OUTPUT_KEY / STREAM_HOST / STREAM_PORT matter to any
        // stage that publishes (every producer, regardless of mode),
        // not just streaming-mode consumers, so these are read
        // unconditionally with defaults. Only the *reading* side
        // (input topic, consumer identity) is mode-gated below.
        let stream_output_key = env::var("STREAM_OUTPUT_KEY").ok();
        let stream_host = Some(
            env::var("STREAM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        );
        let stream_port = Some(parse_env::<u16>("STREAM_PORT", 6379)?);

        let (stream_input_key, consumer_group_name, consumer_name) = match mode {
            RunMode::Streaming => (
                Some(required_env("STREAM_INPUT_KEY")?),
                Some(required_env("CONSUMER_GROUP_NAME")?),
                Some(required_env("CONSUMER_NAME")?),
            ),
            _ => (None, None, None),
        };

        Ok(Self {
            scan_job_id,
            user_id,
            store_url,
            store_service_key,
            asset_id_fallback,
            mode,
            batch_id,
            batch_asset_id,
            batch_offset,
            batch_limit,
            fetch_subdomains,
            asset_scan_mapping,
            domains,
            stream_input_key,
            stream_output_key,
            consumer_group_name,
            consumer_name,
            stream_host,
            stream_port,
            batch_size: parse_env("BATCH_SIZE", 50usize)?,
            block_milliseconds: parse_env("BLOCK_MILLISECONDS", 5000u64)?,
            max_processing_time_secs: parse_env("MAX_PROCESSING_TIME", 3600u64)?,
        })
    }

    /// Log the first few characters of sensitive values, not the
    /// values themselves — mirrors `Config::log_redacted` in the
    /// teacher.
    pub fn log_redacted(&self) {
        for (name, value) in [
            ("STORE_URL", &self.store_url),
            ("STORE_SERVICE_KEY", &self.store_service_key),
        ] {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
    }

    /// Resolve an asset id for a message: message-level value wins,
    /// falling back to the process-wide `ASSET_ID` (spec.md §9, open
    /// question 3).
    pub fn resolve_asset_id<'a>(&'a self, message_asset_id: Option<&'a str>) -> Option<&'a str> {
        message_asset_id.or(self.asset_id_fallback.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_precedence_streaming_wins() {
        assert_eq!(RunMode::select(true, true), RunMode::Streaming);
        assert_eq!(RunMode::select(true, false), RunMode::Streaming);
        assert_eq!(RunMode::select(false, true), RunMode::Batch);
        assert_eq!(RunMode::select(false, false), RunMode::Simple);
    }

    #[test]
    fn resolve_asset_id_prefers_message_value() {
        let mut cfg = minimal_config();
        cfg.asset_id_fallback = Some("env-asset".to_string());
        assert_eq!(cfg.resolve_asset_id(Some("msg-asset")), Some("msg-asset"));
        assert_eq!(cfg.resolve_asset_id(None), Some("env-asset"));
    }

    fn minimal_config() -> StageConfig {
        StageConfig {
            scan_job_id: "job".to_string(),
            user_id: "user".to_string(),
            store_url: "postgres://localhost".to_string(),
            store_service_key: "key".to_string(),
            asset_id_fallback: None,
            mode: RunMode::Simple,
            batch_id: None,
            batch_asset_id: None,
            batch_offset: None,
            batch_limit: None,
            fetch_subdomains: false,
            asset_scan_mapping: serde_json::Map::new(),
            domains: Vec::new(),
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
}
