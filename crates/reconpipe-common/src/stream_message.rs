//! The wire schema for every message on the stream bus (spec.md §6).
//!
//! Modeled as a single discriminated sum type on `type`, per spec.md
//! §9 ("The stream message is polymorphic only in a single
//! discriminator field (`type`); model as a sum type") — the same
//! convention the teacher uses for its event enums in
//! `rootsignal_common::types` (`#[serde(rename_all = "snake_case")]`
//! tagged enums with a `Display`/`FromStr` pair).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Subdomain(SubdomainMessage),
    Url(UrlMessage),
    Completion(CompletionMarker),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubdomainMessage {
    pub subdomain: String,
    #[serde(default = "default_source")]
    pub source: String,
    pub discovered_at: DateTime<Utc>,
    pub parent_domain: String,
    pub scan_job_id: Option<Uuid>,
    pub asset_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UrlMessage {
    pub url: String,
    pub parent_domain: String,
    #[serde(default = "default_source")]
    pub source: String,
    pub asset_id: Option<Uuid>,
    pub scan_job_id: Option<Uuid>,
    pub discovered_at: DateTime<Utc>,
}

/// Terminal marker every producer appends exactly once per run that
/// emitted ≥1 record (spec.md §3 invariant). Consumers must treat it
/// as an exit condition, never as a record to process.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CompletionMarker {
    pub module: String,
    pub scan_job_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub total_results: u64,
}

fn default_source() -> String {
    "unknown".to_string()
}

impl StreamMessage {
    /// `true` iff this message is the completion marker, i.e. the
    /// exit condition for a streaming consumer loop (spec.md §4.2:
    /// "they must be acked like any other [message]" but never
    /// processed as a record).
    pub fn is_completion(&self) -> bool {
        matches!(self, StreamMessage::Completion(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_message_defaults_source_to_unknown_when_absent() {
        let json = serde_json::json!({
            "type": "url",
            "url": "https://example.com/a",
            "parent_domain": "example.com",
            "discovered_at": Utc::now().to_rfc3339(),
        });
        let msg: StreamMessage = serde_json::from_value(json).unwrap();
        match msg {
            StreamMessage::Url(m) => assert_eq!(m.source, "unknown"),
            _ => panic!("expected Url variant"),
        }
    }

    #[test]
    fn completion_marker_round_trips() {
        let marker = StreamMessage::Completion(CompletionMarker {
            module: "subdomain".to_string(),
            scan_job_id: Some(Uuid::new_v4()),
            timestamp: Utc::now(),
            total_results: 42,
        });
        assert!(marker.is_completion());
        let json = serde_json::to_string(&marker).unwrap();
        let back: StreamMessage = serde_json::from_str(&json).unwrap();
        assert!(back.is_completion());
    }

    #[test]
    fn subdomain_message_is_not_completion() {
        let msg = StreamMessage::Subdomain(SubdomainMessage {
            subdomain: "www.example.com".to_string(),
            source: "amass".to_string(),
            discovered_at: Utc::now(),
            parent_domain: "example.com".to_string(),
            scan_job_id: None,
            asset_id: None,
            metadata: None,
        });
        assert!(!msg.is_completion());
    }
}
