//! Queue consumption loop.
//!
//! Leases one payload at a time with BRPOP and runs it through the delivery
//! job. The loop survives malformed payloads and failed jobs: both are
//! logged and the next item is consumed. Failed jobs are not retried here;
//! re-submission is an operator decision.

use std::time::Duration;

use redis::aio::ConnectionManager;

use murmur_common::types::DeliveryJobPayload;
use murmur_engine::job::{DeliveryJob, JobOutcome};

/// Pause after a Redis error before reconnecting to the queue.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct QueueConsumer {
    redis: ConnectionManager,
    queue: String,
    poll_timeout_secs: u64,
    job: DeliveryJob,
}

impl QueueConsumer {
    pub fn new(
        redis: ConnectionManager,
        queue: String,
        poll_timeout_secs: u64,
        job: DeliveryJob,
    ) -> Self {
        Self {
            redis,
            queue,
            poll_timeout_secs,
            job,
        }
    }

    /// Start the consumption loop. Runs indefinitely until the task is
    /// cancelled.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        tracing::info!(queue = %self.queue, "Delivery worker consuming");

        loop {
            // BRPOP with a timeout so shutdown signals are observed between
            // leases.
            let reply: Result<Option<(String, String)>, redis::RedisError> =
                redis::cmd("BRPOP")
                    .arg(&self.queue)
                    .arg(self.poll_timeout_secs)
                    .query_async(&mut self.redis)
                    .await;

            let raw = match reply {
                Ok(Some((_, raw))) => raw,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Queue read failed, backing off");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            let payload = match DeliveryJobPayload::from_json(&raw) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "Rejected malformed delivery payload");
                    continue;
                }
            };

            let activity_id = payload.activity_id;
            match self.job.execute(payload).await {
                JobOutcome::Completed { dispatched } => {
                    tracing::info!(activity_id, dispatched, "Delivery job completed");
                }
                JobOutcome::Delegated { jobs_enqueued } => {
                    tracing::info!(activity_id, jobs_enqueued, "Delivery job split into sub-jobs");
                }
                JobOutcome::CleanedUp => {
                    tracing::info!(activity_id, "Dangling activity cleaned up");
                }
                JobOutcome::Failed { error } => {
                    tracing::error!(
                        activity_id,
                        error = %error,
                        "Delivery job failed; payload must be re-submitted manually"
                    );
                }
            }
        }
    }
}
