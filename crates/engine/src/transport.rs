//! Redis-backed delivery queue transport.
//!
//! Enqueue is an opaque LPUSH of the JSON payload; the worker consumes with
//! BRPOP. Leasing and visibility semantics belong to the queue runtime, not
//! to this type.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use murmur_common::error::AppError;
use murmur_common::types::DeliveryJobPayload;

use crate::traits::JobTransport;

#[derive(Clone)]
pub struct RedisJobTransport {
    redis: ConnectionManager,
    queue: String,
}

impl RedisJobTransport {
    pub fn new(redis: ConnectionManager, queue: impl Into<String>) -> Self {
        Self {
            redis,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl JobTransport for RedisJobTransport {
    async fn enqueue(&self, payload: &DeliveryJobPayload) -> Result<(), AppError> {
        let raw = serde_json::to_string(payload)?;
        let mut redis = self.redis.clone();
        let () = redis::cmd("LPUSH")
            .arg(&self.queue)
            .arg(&raw)
            .query_async(&mut redis)
            .await?;

        tracing::debug!(
            activity_id = payload.activity_id,
            chunked = payload.recipients.is_some(),
            "Delivery job enqueued"
        );
        Ok(())
    }
}
