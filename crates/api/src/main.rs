//! Herald API server binary entrypoint.
//!
//! Runs the `ws` delivery channel (broker topic -> per-user durable log) and
//! the live-session server reading those logs back to connected browsers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::notification_log::{NotificationLog, RedisNotificationLog};
use herald_common::redis_pool::create_redis_pool;
use herald_live::receiver::CursorStreamReceiver;
use herald_live::registry::ConnectionRegistry;
use herald_notifier::broker::RedisStreamsBroker;
use herald_notifier::channel::{Channel, RetryPolicy};
use herald_notifier::dead_letter::dead_letter_sink_from_config;
use herald_notifier::observers::BrokerNotificationsObserver;
use herald_notifier::processors::StreamLogProcessor;
use herald_notifier::service::DispatchService;

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "herald_api=debug,herald_live=debug,herald_notifier=info,tower_http=debug",
            )
        }))
        .init();

    tracing::info!("Starting Herald API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create Redis connection
    let (client, manager) = create_redis_pool(&config.redis_url, config.redis_timeout()).await?;
    let log: Arc<dyn NotificationLog> =
        Arc::new(RedisNotificationLog::new(client.clone(), manager.clone()));
    let broker = Arc::new(RedisStreamsBroker::new(
        client,
        manager,
        &config.broker_consumer_group,
        config.broker_timeout(),
    ));

    let shutdown = CancellationToken::new();

    // ws channel: broker -> per-user log
    let ws_channel = Channel::new(
        "ws",
        RetryPolicy::from_config(&config),
        Arc::new(BrokerNotificationsObserver::new(
            config.topic_ws_notifications.clone(),
            broker.clone(),
            config.broker_timeout(),
        )),
        Arc::new(StreamLogProcessor::new(log.clone())),
        dead_letter_sink_from_config(&config, broker),
    );
    let dispatch = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { DispatchService::new(vec![ws_channel]).run(shutdown).await }
    });

    // Live sessions: per-user log -> WebSocket
    let registry = ConnectionRegistry::new(Arc::new(CursorStreamReceiver::new(
        log,
        config.redis_timeout(),
    )));
    registry.run();

    let addr = config.bind_address();
    let state = AppState::new(registry, config, shutdown.clone());

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    tracing::info!("API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
                tracing::info!("Received shutdown signal, stopping gracefully...");
                shutdown.cancel();
            }
        })
        .await?;

    // The server may also stop on its own; make sure the channel follows.
    shutdown.cancel();
    dispatch.await?;

    tracing::info!("Herald API server stopped.");
    Ok(())
}
