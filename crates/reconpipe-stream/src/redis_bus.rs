//! Redis Streams implementation of `StreamBus`.
//!
//! Each message is stored as a single `payload` field holding the
//! JSON-encoded `StreamMessage` — the simplest mapping of a typed
//! record onto a Redis stream entry, and one the broker's own
//! field/value model doesn't fight.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use reconpipe_common::StreamMessage;
use tracing::debug;

use crate::{Delivery, StreamBus, StreamError};

const FIELD: &str = "payload";

pub struct RedisStreamBus {
    conn: ConnectionManager,
}

impl RedisStreamBus {
    pub async fn connect(host: &str, port: u16) -> Result<Self, StreamError> {
        let url = format!("redis://{host}:{port}");
        let client = redis::Client::open(url).map_err(backend_err)?;
        let conn = client.get_connection_manager().await.map_err(backend_err)?;
        Ok(Self { conn })
    }
}

fn backend_err(e: RedisError) -> StreamError {
    StreamError::Backend(e.to_string())
}

/// `true` iff the error is Redis's "BUSYGROUP" — the group already
/// exists, which spec.md §4.2 treats as a benign outcome, not a
/// failure.
fn is_busygroup(e: &RedisError) -> bool {
    e.to_string().contains("BUSYGROUP")
}

#[async_trait]
impl StreamBus for RedisStreamBus {
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let result: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_busygroup(&e) => {
                debug!(topic, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<Delivery>, StreamError> {
        let mut conn = self.conn.clone();
        let opts = redis::streams::StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[topic], &[">"], &opts)
            .await
            .map_err(backend_err)?;

        let mut out = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let Some(redis::Value::BulkString(raw)) = entry.map.get(FIELD) else {
                    continue;
                };
                let message: StreamMessage = serde_json::from_slice(raw)?;
                out.push(Delivery {
                    id: entry.id,
                    message,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(topic, group, &[id]).await.map_err(backend_err)?;
        Ok(())
    }

    async fn append(
        &self,
        topic: &str,
        message: &StreamMessage,
        maxlen: Option<usize>,
        approx: bool,
    ) -> Result<String, StreamError> {
        let payload = serde_json::to_vec(message)?;
        let mut conn = self.conn.clone();

        let id: String = match maxlen {
            Some(cap) => {
                let mut cmd = redis::cmd("XADD");
                cmd.arg(topic).arg("MAXLEN");
                if approx {
                    cmd.arg("~");
                }
                cmd.arg(cap).arg("*").arg(FIELD).arg(payload);
                cmd.query_async(&mut conn).await.map_err(backend_err)?
            }
            None => conn
                .xadd(topic, "*", &[(FIELD, payload)])
                .await
                .map_err(backend_err)?,
        };

        Ok(id)
    }
}
