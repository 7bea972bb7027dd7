//! Completion-marker propagation and the shared streaming-consumer loop
//! (spec.md §2 "completion-marker propagation", §4.2's deadline rule).

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use reconpipe_common::stream_message::CompletionMarker;
use reconpipe_common::StreamMessage;
use reconpipe_stream::{Delivery, StreamBus};
use uuid::Uuid;

use crate::WorkerError;

/// Append a single completion marker to `topic` (spec.md §3: "every
/// streaming producer that emits ≥1 record MUST terminate its stream
/// with exactly one completion marker").
pub async fn append_completion(
    bus: &dyn StreamBus,
    topic: &str,
    module: &str,
    scan_job_id: Option<Uuid>,
    total_results: u64,
) -> Result<(), WorkerError> {
    let marker = StreamMessage::Completion(CompletionMarker {
        module: module.to_string(),
        scan_job_id,
        timestamp: Utc::now(),
        total_results,
    });
    bus.append(topic, &marker, None, false).await?;
    Ok(())
}

/// Drive a blocking-read consumer loop against `topic`/`group` until a
/// completion marker is observed or the wall-clock `deadline` elapses
/// (spec.md §4.2: "every streaming loop enforces a wall-clock cap").
/// Completion markers are acked but never passed to `handle` (spec.md
/// §3: "Consumers MUST treat the marker as exit condition, not as a
/// record to process").
pub async fn run_streaming_loop<F, Fut>(
    bus: &dyn StreamBus,
    topic: &str,
    group: &str,
    consumer: &str,
    batch_size: usize,
    block_ms: u64,
    deadline: Duration,
    mut handle: F,
) -> Result<u64, WorkerError>
where
    F: FnMut(Delivery) -> Fut,
    Fut: Future<Output = Result<(), WorkerError>>,
{
    bus.ensure_group(topic, group).await?;
    let started = Instant::now();
    let mut processed = 0u64;

    loop {
        if started.elapsed() >= deadline {
            tracing::warn!(topic, group, "streaming loop hit wall-clock deadline");
            return Ok(processed);
        }

        let deliveries = bus.read(topic, group, consumer, batch_size, block_ms).await?;
        if deliveries.is_empty() {
            // A backend whose `read` returns immediately on empty (e.g.
            // `MemoryBus`) would otherwise spin; a real broker already
            // blocked up to `block_ms` inside the call.
            tokio::time::sleep(Duration::from_millis(block_ms.min(250))).await;
            continue;
        }
        for delivery in deliveries {
            if delivery.message.is_completion() {
                bus.ack(topic, group, &delivery.id).await?;
                processed += 1;
                return Ok(processed);
            }
            handle(delivery.clone()).await?;
            bus.ack(topic, group, &delivery.id).await?;
            processed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconpipe_common::stream_message::SubdomainMessage;
    use reconpipe_stream::memory::MemoryBus;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn loop_exits_cleanly_on_completion_marker_without_handling_it() {
        let bus = MemoryBus::new();
        bus.ensure_group("t", "g").await.unwrap();
        bus.append(
            "t",
            &StreamMessage::Subdomain(SubdomainMessage {
                subdomain: "a.example.com".to_string(),
                source: "test".to_string(),
                discovered_at: Utc::now(),
                parent_domain: "example.com".to_string(),
                scan_job_id: None,
                asset_id: None,
                metadata: None,
            }),
            None,
            false,
        )
        .await
        .unwrap();
        bus.append(
            "t",
            &StreamMessage::Completion(CompletionMarker {
                module: "test".to_string(),
                scan_job_id: None,
                timestamp: Utc::now(),
                total_results: 1,
            }),
            None,
            false,
        )
        .await
        .unwrap();

        let handled = AtomicU64::new(0);
        let processed = run_streaming_loop(
            &bus,
            "t",
            "g",
            "c1",
            10,
            0,
            Duration::from_secs(5),
            |_delivery| {
                handled.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await
        .unwrap();

        assert_eq!(processed, 2);
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}
