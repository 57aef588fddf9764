use std::sync::Arc;

use tokio::sync::watch;

use relay_common::config::RelayConfig;
use relay_common::redis_pool::create_redis_pool;

use queue_relay::broker::{Broker, RedisBroker};
use queue_relay::fault::FaultHandler;
use queue_relay::handler::MessageHandler;
use queue_relay::health::{self, HealthState};
use queue_relay::relay::Relay;
use queue_relay::stats::RelayStats;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "queue_relay=info,relay_common=info".into()),
        )
        .json()
        .init();

    // Load configuration
    let config = RelayConfig::from_env()?;

    tracing::info!(
        queue = %config.source_queue,
        envelope_mode = %config.envelope_mode,
        consumer_group = %config.consumer_group,
        consumer_name = %config.consumer_name,
        "Queue relay starting..."
    );

    // Long-lived resources, released when the relay returns
    let stats = Arc::new(RelayStats::new());
    let conn = create_redis_pool(&config.redis_url).await?;
    let broker = RedisBroker::new(conn, &config);
    let client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()?;

    let faults = FaultHandler::new(broker.endpoint(), &config.source_queue, stats.clone());
    let handler = MessageHandler::new(
        client,
        config.post_url.clone(),
        config.envelope_mode,
        faults.clone(),
        stats.clone(),
    );
    let relay = Relay::new(broker, handler, faults, config.fault_pause);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Received shutdown signal, draining...");
        let _ = shutdown_tx.send(true);
    });

    let health = config.health_addr.map(|addr| {
        let state = HealthState {
            queue: config.source_queue.clone(),
            stats: stats.clone(),
        };
        tokio::spawn(health::serve(addr, state, shutdown_rx.clone()))
    });

    let result = relay.run(shutdown_rx).await;

    // Dropping the sender also stops the health endpoint when the relay exits
    // on its own.
    signals.abort();
    if let Some(health) = health {
        match health.await {
            Ok(Err(e)) => tracing::error!(error = %e, "Health endpoint exited with error"),
            Err(e) if !e.is_cancelled() => {
                tracing::error!(error = %e, "Health endpoint task failed")
            }
            _ => {}
        }
    }

    if let Err(e) = &result {
        tracing::error!(error = %e, "Queue relay exited with error");
    }
    tracing::info!("Queue relay stopped.");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
