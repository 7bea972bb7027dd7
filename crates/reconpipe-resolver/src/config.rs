//! Resolver-only environment knobs (spec.md §6), read independently of
//! the shared `StageConfig` the same way the historical stage reads
//! `HISTORICAL_AGGREGATOR_BIN`/`HISTORICAL_TIMEOUT_SECS` directly —
//! these variables have no meaning to any other stage.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Freshness window past which a record is re-probed rather than
    /// merely source-merged (spec.md §4.8.3). Default 24h.
    pub resolution_ttl: Duration,
    /// Backfill page size (spec.md §4.8.5). Default 100.
    pub probe_batch_size: i64,
    /// Backfill fan-out bound (spec.md §4.8.5/§5). Default 10.
    pub concurrency: usize,
    /// Optional cap on how many URLs a single backfill run processes.
    pub max_urls: Option<u64>,
    /// When true, backfill probes and reports statistics but performs
    /// no store writes (spec.md §4.8.5).
    pub dry_run: bool,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl ResolverConfig {
    pub fn from_env() -> Self {
        let ttl_hours: u64 = parse_or("RESOLUTION_TTL_HOURS", 24);
        Self {
            resolution_ttl: Duration::from_secs(ttl_hours * 3600),
            probe_batch_size: parse_or("PROBE_BATCH_SIZE", 100),
            concurrency: parse_or("CONCURRENCY", 10),
            max_urls: env::var("MAX_URLS").ok().and_then(|v| v.parse().ok()),
            dry_run: env::var("DRY_RUN")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_defaults_to_24_hours() {
        let cfg = ResolverConfig {
            resolution_ttl: Duration::from_secs(24 * 3600),
            probe_batch_size: 100,
            concurrency: 10,
            max_urls: None,
            dry_run: false,
        };
        assert_eq!(cfg.resolution_ttl, Duration::from_secs(86_400));
    }
}
