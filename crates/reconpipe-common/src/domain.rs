//! Shared data model (spec.md §3). These are the row shapes every
//! stage reads or writes through `reconpipe-store`'s `Store` trait;
//! none of them own persistence — that's the store crate's job.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Program {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApexDomain {
    pub id: Uuid,
    pub domain: String,
    pub active: bool,
    pub asset_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchJob {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub status: BatchStatus,
    pub offset: i64,
    pub limit: i64,
    pub processed_count: i64,
    pub error_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set iff `status` is `Completed` or `Failed` (spec.md §3 invariant).
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScanJob {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub apex_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubdomainRecord {
    pub subdomain: String,
    pub parent_domain: String,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
    pub asset_id: Uuid,
    pub scan_job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
}

impl DnsRecordType {
    /// The record types queried per subdomain (spec.md §4.4).
    pub const ALL: [DnsRecordType; 5] = [
        DnsRecordType::A,
        DnsRecordType::Aaaa,
        DnsRecordType::Cname,
        DnsRecordType::Mx,
        DnsRecordType::Txt,
    ];
}

impl std::fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DnsRecordType::A => "A",
            DnsRecordType::Aaaa => "AAAA",
            DnsRecordType::Cname => "CNAME",
            DnsRecordType::Mx => "MX",
            DnsRecordType::Txt => "TXT",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DnsRecord {
    pub subdomain: String,
    pub parent_domain: String,
    pub record_type: DnsRecordType,
    pub value: String,
    pub ttl: Option<i64>,
    /// Only set for `Mx` records.
    pub mx_priority: Option<i32>,
    pub resolved_at: DateTime<Utc>,
    pub asset_id: Uuid,
    pub scan_job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HttpProbeRecord {
    pub url: String,
    pub subdomain: String,
    pub parent_domain: String,
    pub scheme: String,
    pub port: u16,
    pub status_code: Option<u16>,
    pub title: Option<String>,
    pub server: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub final_url: Option<String>,
    pub ip: Option<String>,
    pub technologies: Vec<String>,
    pub cdn: Option<String>,
    pub asn: Option<String>,
    pub chain_status_codes: Vec<i32>,
    pub location: Option<String>,
    pub favicon_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub asset_id: Uuid,
    pub scan_job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HistoricalUrlRecord {
    pub url: String,
    pub parent_domain: String,
    pub source: String,
    pub asset_id: Uuid,
    pub scan_job_id: Option<Uuid>,
    pub discovered_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Query parameter values: a single value, or several when a key
/// repeats in the canonical URL (spec.md §4.8.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum QueryParamValue {
    Single(String),
    Multi(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UrlRecord {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub canonical_url: String,
    pub url_hash: String,
    pub domain: String,
    pub path: Option<String>,
    pub query_params: BTreeMap<String, QueryParamValue>,
    pub sources: Vec<String>,
    pub first_discovered_by: String,
    pub first_discovered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub is_alive: Option<bool>,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub response_time_ms: Option<i64>,
    pub title: Option<String>,
    pub final_url: Option<String>,
    pub redirect_chain: Vec<i32>,
    pub server: Option<String>,
    pub technologies: Vec<String>,
    pub file_extension: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UrlRecord {
    /// Add `source` to `sources` if not already present. No-op
    /// otherwise (spec.md §3 invariant: "adding a source that already
    /// exists is a no-op").
    pub fn add_source(&mut self, source: &str) -> bool {
        if self.sources.iter().any(|s| s == source) {
            return false;
        }
        self.sources.push(source.to_string());
        true
    }
}
