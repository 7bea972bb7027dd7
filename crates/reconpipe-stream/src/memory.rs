//! In-memory `StreamBus`, for fast unit/integration tests without a
//! live Redis. Mirrors the real semantics closely enough to exercise
//! every stage core: per-group cursors, at-least-once redelivery of
//! unacked messages, and an approximate `MAXLEN` trim on append.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reconpipe_common::StreamMessage;

use crate::{Delivery, StreamBus, StreamError};

struct Entry {
    id: String,
    message: StreamMessage,
}

struct Topic {
    entries: Vec<Entry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    /// Index into `entries` of the next record to deliver.
    cursor: usize,
    /// Messages delivered but not yet acked, available for redelivery.
    pending: Vec<Entry>,
}

impl Clone for Entry {
    fn clone(&self) -> Self {
        Entry {
            id: self.id.clone(),
            message: self.message.clone(),
        }
    }
}

#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Topic>>,
    next_id: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamBus for MemoryBus {
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), StreamError> {
        let mut topics = self.topics.lock().unwrap();
        let t = topics.entry(topic.to_string()).or_insert_with(|| Topic {
            entries: Vec::new(),
            groups: HashMap::new(),
        });
        t.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<Delivery>, StreamError> {
        let mut topics = self.topics.lock().unwrap();
        let Some(t) = topics.get_mut(topic) else {
            return Ok(Vec::new());
        };
        let Some(state) = t.groups.get_mut(group) else {
            return Err(StreamError::Backend(format!(
                "no such consumer group: {group}"
            )));
        };

        let end = (state.cursor + count).min(t.entries.len());
        let batch: Vec<Entry> = t.entries[state.cursor..end].to_vec();
        state.cursor = end;

        let out = batch
            .iter()
            .map(|e| Delivery {
                id: e.id.clone(),
                message: e.message.clone(),
            })
            .collect();
        state.pending.extend(batch);
        Ok(out)
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut topics = self.topics.lock().unwrap();
        if let Some(t) = topics.get_mut(topic) {
            if let Some(state) = t.groups.get_mut(group) {
                state.pending.retain(|e| e.id != id);
            }
        }
        Ok(())
    }

    async fn append(
        &self,
        topic: &str,
        message: &StreamMessage,
        maxlen: Option<usize>,
        _approx: bool,
    ) -> Result<String, StreamError> {
        let id = format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut topics = self.topics.lock().unwrap();
        let t = topics.entry(topic.to_string()).or_insert_with(|| Topic {
            entries: Vec::new(),
            groups: HashMap::new(),
        });
        t.entries.push(Entry {
            id: id.clone(),
            message: message.clone(),
        });
        if let Some(cap) = maxlen {
            if t.entries.len() > cap {
                let drop_count = t.entries.len() - cap;
                t.entries.drain(0..drop_count);
                for state in t.groups.values_mut() {
                    state.cursor = state.cursor.saturating_sub(drop_count);
                }
            }
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reconpipe_common::stream_message::CompletionMarker;

    fn marker(total: u64) -> StreamMessage {
        StreamMessage::Completion(CompletionMarker {
            module: "test".to_string(),
            scan_job_id: None,
            timestamp: Utc::now(),
            total_results: total,
        })
    }

    #[tokio::test]
    async fn read_is_idempotent_cursor_advance_and_ack_clears_pending() {
        let bus = MemoryBus::new();
        bus.ensure_group("t", "g").await.unwrap();
        bus.append("t", &marker(1), None, false).await.unwrap();
        bus.append("t", &marker(2), None, false).await.unwrap();

        let first = bus.read("t", "g", "c1", 1, 0).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = bus.read("t", "g", "c1", 10, 0).await.unwrap();
        assert_eq!(second.len(), 1);

        bus.ack("t", "g", &first[0].id).await.unwrap();
        bus.ack("t", "g", &second[0].id).await.unwrap();

        let empty = bus.read("t", "g", "c1", 10, 0).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn reading_unknown_group_is_an_error() {
        let bus = MemoryBus::new();
        bus.ensure_group("t", "g").await.unwrap();
        let err = bus.read("t", "nope", "c1", 1, 0).await;
        assert!(err.is_err());
    }
}
