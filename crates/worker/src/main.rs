mod consumer;

use std::sync::Arc;

use murmur_common::config::AppConfig;
use murmur_common::{db, redis_pool};
use murmur_engine::job::DeliveryJob;
use murmur_engine::render::TokenBodyRenderer;
use murmur_engine::store::{
    PgAccessControl, PgActivityStore, PgDispatchSink, PgPreferenceStore,
};
use murmur_engine::transport::RedisJobTransport;
use murmur_plugins::frequency::FrequencyRegistry;

use crate::consumer::QueueConsumer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_worker=info,murmur_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Murmur delivery worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config).await?;

    // Run migrations
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    // Connect to Redis (delivery queue)
    let redis = redis_pool::create_redis_pool(&config).await?;

    // Wire the delivery job with its concrete collaborators
    let renderer = Arc::new(TokenBodyRenderer::load(&pool).await?);
    let sink = Arc::new(PgDispatchSink::new(pool.clone()));
    let transport = Arc::new(RedisJobTransport::new(
        redis.clone(),
        config.delivery_queue.clone(),
    ));
    let job = DeliveryJob::new(
        Arc::new(PgActivityStore::new(pool.clone())),
        Arc::new(PgPreferenceStore::new(pool.clone())),
        Arc::new(PgAccessControl::new(pool.clone())),
        transport,
        renderer,
        FrequencyRegistry::builtin(sink),
        config.languages.clone(),
    );

    let mut consumer = QueueConsumer::new(
        redis,
        config.delivery_queue.clone(),
        config.worker_poll_timeout_secs,
        job,
    );

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = consumer.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Queue consumer exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Murmur delivery worker stopped.");
    Ok(())
}
