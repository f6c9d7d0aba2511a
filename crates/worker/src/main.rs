use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::redis_pool::create_redis_pool;
use herald_notifier::broker::RedisStreamsBroker;
use herald_notifier::service::DispatchService;
use herald_worker::channels::build_channels;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_worker=info,herald_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to Redis; the broker topics live there
    let (client, manager) = create_redis_pool(&config.redis_url, config.redis_timeout()).await?;
    let broker = Arc::new(RedisStreamsBroker::new(
        client,
        manager,
        &config.broker_consumer_group,
        config.broker_timeout(),
    ));

    let service = DispatchService::new(build_channels(&config, broker)?);
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal, stopping gracefully...");
            shutdown.cancel();
        }
    });

    // Returns once every channel has stopped listening
    service.run(shutdown).await;

    tracing::info!("Herald worker stopped.");
    Ok(())
}
