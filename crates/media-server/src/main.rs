mod config;

use std::sync::Arc;

use deadpool_redis::{Config, Runtime};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use media_api::state::{AppState, AppStateInner};
use media_cache::{Cache, QueryService, RedisCache};
use media_relay::{Broker, Consumer, ConsumerConfig, Projector, ProjectorKind, Publisher, RedisStreamBroker};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "media_server=debug,media_relay=debug,media_api=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // One pool backs both the read cache and the broker streams.
    let pool = Config::from_url(config.redis_url.as_str()).create_pool(Some(Runtime::Tokio1))?;
    let cache: Arc<dyn Cache> = Arc::new(RedisCache::new(pool.clone()));
    let broker: Arc<dyn Broker> = Arc::new(RedisStreamBroker::new(pool, config.stream_max_len));

    if let Err(e) = cache.ping().await {
        warn!("Redis not reachable at startup ({}), continuing", e);
    }

    // Projectors
    let shutdown = CancellationToken::new();
    let mut consumers = JoinSet::new();
    for kind in ProjectorKind::ALL {
        let consumer = Consumer::new(
            Projector::new(kind, cache.clone()),
            broker.clone(),
            ConsumerConfig {
                worker_name: config.worker_name.clone(),
                max_retries: config.max_retries,
                retry_base: config.retry_base,
                claim_idle: config.claim_idle,
                ..ConsumerConfig::default()
            },
        );
        let token = shutdown.clone();
        consumers.spawn(async move {
            if let Err(e) = consumer.run(token).await {
                error!(projector = %kind, error = %e, "Projector exited");
            }
        });
    }

    // HTTP
    let state: AppState = Arc::new(AppStateInner {
        publisher: Publisher::new(broker),
        queries: QueryService::new(cache),
        jwt_secret: config.jwt_secret.clone(),
        publish_timeout: config.publish_timeout,
    });
    let app = media_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Media server listening on {}", config.addr);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // The server may stop for reasons other than a signal.
    shutdown.cancel();
    while let Some(joined) = consumers.join_next().await {
        if let Err(e) = joined {
            error!("Projector task panicked: {}", e);
        }
    }
    info!("Media server stopped");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM and cancels `shutdown` for the projectors.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
