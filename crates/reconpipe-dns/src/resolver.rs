//! DNS lookups against the five record types spec.md §4.4 names, with
//! a bounded retry baked into the resolver's own options rather than
//! retried by hand at the call site.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use reconpipe_common::domain::DnsRecordType;

/// One resolved value for one record type, before it is stamped into
/// a `DnsRecord` row.
#[derive(Debug, Clone)]
pub struct ResolvedValue {
    pub record_type: DnsRecordType,
    pub value: String,
    pub ttl: Option<i64>,
    pub mx_priority: Option<i32>,
}

#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Query every record type spec.md §4.4 names for `name`. A type
    /// with no records (NXDOMAIN, NoRecordsFound) contributes nothing
    /// and is not an error; only unexpected resolver failures on
    /// individual types are logged and skipped the same way.
    async fn resolve_all(&self, name: &str) -> Vec<ResolvedValue>;
}

pub struct HickoryDnsResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryDnsResolver {
    /// Two retries (three attempts total) per spec.md §4.4's "bounded
    /// retry" before a record type is treated as unresolved.
    pub fn new() -> Self {
        let mut opts = ResolverOpts::default();
        opts.attempts = 3;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        Self { resolver }
    }
}

impl Default for HickoryDnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_trailing_dot(s: &str) -> String {
    s.strip_suffix('.').unwrap_or(s).to_string()
}

/// `NoRecordsFound` (which covers NXDOMAIN) is an expected outcome,
/// not an error; anything else is logged once per (name, record
/// type).
fn is_benign_absence(kind: &ResolveErrorKind) -> bool {
    matches!(kind, ResolveErrorKind::NoRecordsFound { .. })
}

/// Run a single-record-type lookup through the generic `lookup` API
/// and flatten its records into `ResolvedValue`s via `extract`. Used
/// for every type; A/AAAA/MX/TXT ride the convenience lookups below
/// instead, since hickory exposes stronger typing for those, but all
/// of them bottom out in the same `RData` match.
async fn lookup_records<F>(
    resolver: &TokioAsyncResolver,
    name: &str,
    record_type: RecordType,
    label: &str,
    extract: F,
) -> Vec<ResolvedValue>
where
    F: Fn(&RData, i64) -> Option<ResolvedValue>,
{
    match resolver.lookup(name, record_type).await {
        Ok(lookup) => lookup
            .record_iter()
            .filter_map(|record| {
                record
                    .data()
                    .and_then(|data| extract(data, record.ttl() as i64))
            })
            .collect(),
        Err(e) if is_benign_absence(e.kind()) => Vec::new(),
        Err(e) => {
            tracing::debug!(name, %label, error = %e, "dns lookup failed");
            Vec::new()
        }
    }
}

#[async_trait]
impl DnsResolver for HickoryDnsResolver {
    async fn resolve_all(&self, name: &str) -> Vec<ResolvedValue> {
        let mut out = Vec::new();

        out.extend(
            lookup_records(&self.resolver, name, RecordType::A, "A", |data, ttl| match data {
                RData::A(ip) => Some(ResolvedValue {
                    record_type: DnsRecordType::A,
                    value: ip.to_string(),
                    ttl: Some(ttl),
                    mx_priority: None,
                }),
                _ => None,
            })
            .await,
        );

        out.extend(
            lookup_records(&self.resolver, name, RecordType::AAAA, "AAAA", |data, ttl| match data {
                RData::AAAA(ip) => Some(ResolvedValue {
                    record_type: DnsRecordType::Aaaa,
                    value: ip.to_string(),
                    ttl: Some(ttl),
                    mx_priority: None,
                }),
                _ => None,
            })
            .await,
        );

        out.extend(
            lookup_records(&self.resolver, name, RecordType::CNAME, "CNAME", |data, ttl| match data {
                RData::CNAME(target) => Some(ResolvedValue {
                    record_type: DnsRecordType::Cname,
                    value: strip_trailing_dot(&target.to_string()),
                    ttl: Some(ttl),
                    mx_priority: None,
                }),
                _ => None,
            })
            .await,
        );

        out.extend(
            lookup_records(&self.resolver, name, RecordType::MX, "MX", |data, _ttl| match data {
                RData::MX(mx) => Some(ResolvedValue {
                    record_type: DnsRecordType::Mx,
                    value: strip_trailing_dot(&mx.exchange().to_string()),
                    ttl: None,
                    mx_priority: Some(mx.preference() as i32),
                }),
                _ => None,
            })
            .await,
        );

        out.extend(
            lookup_records(&self.resolver, name, RecordType::TXT, "TXT", |data, _ttl| match data {
                RData::TXT(txt) => Some(ResolvedValue {
                    record_type: DnsRecordType::Txt,
                    value: txt
                        .txt_data()
                        .iter()
                        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                        .collect::<Vec<_>>()
                        .join(""),
                    ttl: None,
                    mx_priority: None,
                }),
                _ => None,
            })
            .await,
        );

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_trailing_dot_only_removes_the_last_one() {
        assert_eq!(strip_trailing_dot("mail.example.com."), "mail.example.com");
        assert_eq!(strip_trailing_dot("mail.example.com"), "mail.example.com");
    }
}
