use redis::Client;
use redis::aio::ConnectionManager;

use crate::config::AppConfig;

/// Connect the Redis manager the delivery queue runs on. The manager
/// reconnects on its own, so one instance is shared per process.
pub async fn create_redis_pool(config: &AppConfig) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(config.redis_url.as_str())?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
