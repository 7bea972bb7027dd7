//! Historical-URL discovery via an external archive-aggregation
//! subprocess (spec.md §4.6), invoked the way `ChromeFetcher::run_chrome`
//! invokes Chrome — `tokio::process::Command` wrapped in
//! `tokio::time::timeout` — minus Chrome's retry loop: §4.6 specifies
//! one bounded invocation, not a backoff retry.

use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;

#[async_trait]
pub trait UrlAggregator: Send + Sync {
    /// Discover historical URLs for `domain`, deduplicated within this
    /// single run. Any subprocess failure (non-zero exit, timeout,
    /// spawn failure) is an error the caller decides how to treat, not
    /// a partial result.
    async fn aggregate(&self, domain: &str) -> anyhow::Result<Vec<String>>;
}

/// Shells out to a CLI archive aggregator (e.g. `gau`) that writes a
/// line-oriented URL list to a file given via `-o`.
pub struct SubprocessAggregator {
    binary: String,
    timeout: Duration,
}

impl SubprocessAggregator {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Reads `HISTORICAL_AGGREGATOR_BIN` (default `gau`) and
    /// `HISTORICAL_TIMEOUT_SECS` (default 120s).
    pub fn from_env() -> Self {
        let binary = std::env::var("HISTORICAL_AGGREGATOR_BIN").unwrap_or_else(|_| "gau".to_string());
        let timeout_secs = std::env::var("HISTORICAL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(120);
        Self::new(binary, Duration::from_secs(timeout_secs))
    }
}

#[async_trait]
impl UrlAggregator for SubprocessAggregator {
    async fn aggregate(&self, domain: &str) -> anyhow::Result<Vec<String>> {
        let output_file = NamedTempFile::new()?;
        let output_path = output_file.path().to_path_buf();

        let run = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.binary)
                .arg(domain)
                .arg("-o")
                .arg(&output_path)
                .output(),
        )
        .await;

        let output = match run {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => anyhow::bail!("failed to launch {}: {e}", self.binary),
            Err(_) => anyhow::bail!("{} timed out after {:?} for {domain}", self.binary, self.timeout),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} exited with {}: {stderr}", self.binary, output.status);
        }

        let contents = tokio::fs::read_to_string(&output_path).await.unwrap_or_default();
        Ok(dedup_lines(&contents))
    }
}

fn dedup_lines(contents: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();
    for line in contents.lines() {
        let url = line.trim();
        if !url.is_empty() && seen.insert(url.to_string()) {
            urls.push(url.to_string());
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_lines_drops_blanks_and_repeats() {
        let contents = "https://a.example.com/x\n\nhttps://a.example.com/x\nhttps://a.example.com/y\n";
        assert_eq!(
            dedup_lines(contents),
            vec![
                "https://a.example.com/x".to_string(),
                "https://a.example.com/y".to_string(),
            ]
        );
    }
}
