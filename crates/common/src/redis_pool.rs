use std::time::Duration;

use anyhow::Context;
use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager for async operations.
///
/// Returns the client alongside the manager so callers can open dedicated
/// connections for blocking commands. Fails when Redis can't be reached
/// within `timeout`.
pub async fn create_redis_pool(
    redis_url: &str,
    timeout: Duration,
) -> anyhow::Result<(Client, ConnectionManager)> {
    let client = Client::open(redis_url)?;
    let manager = tokio::time::timeout(timeout, ConnectionManager::new(client.clone()))
        .await
        .with_context(|| format!("Timed out connecting to Redis after {:?}", timeout))??;

    tracing::info!("Connected to Redis");
    Ok((client, manager))
}
