use poolwatch::config::Config;
use poolwatch::filters;
use poolwatch::registry::{Subscription, SubscriptionRegistry, TokioTimer};
use poolwatch::transport::{ConnectionState, Transport, TransportManager};
use poolwatch::ws::{RelayClient, StreamClient};
use poolwatch::CanonicalRecord;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config_path = std::env::var("POOLWATCH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("poolwatch.toml"));
    let from_file = config_path.exists();
    let config = if from_file {
        Config::load(&config_path)?
    } else {
        Config::from_env()?
    };

    // Initialize logging. Records go to stdout, logs to stderr.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("poolwatch v{} starting", env!("CARGO_PKG_VERSION"));
    if from_file {
        info!(path = %config_path.display(), "config loaded");
    } else {
        info!(path = %config_path.display(), "no config file found, using env-only config");
    }
    config.validate()?;

    // --- Transports ---
    let streams = &config.streams;
    let primary: Arc<dyn Transport> = Arc::new(StreamClient::new(
        streams.primary_ws_url.clone(),
        streams.connect_timeout(),
        streams.subscribe_timeout(),
        streams.ping_interval(),
    ));
    let fallback: Option<Arc<dyn Transport>> = match &streams.relay_ws_url {
        Some(url) => Some(Arc::new(RelayClient::new(
            url.clone(),
            streams.connect_timeout(),
            streams.ping_interval(),
        ))),
        None => {
            warn!("no relay_ws_url configured, running without fallback");
            None
        }
    };
    let manager = TransportManager::new(primary, fallback, streams.manager_settings());

    // --- Registry ---
    let registry = SubscriptionRegistry::new(
        manager.clone(),
        Arc::new(TokioTimer::current()),
        config.registry.grace_period(),
    );

    let watcher = tokio::spawn(watch_connection(
        registry.clone(),
        Duration::from_secs(config.tail.reconnect_delay_secs),
    ));

    let categories = config.tail.categories();
    let subscriptions: Vec<Subscription> = categories
        .iter()
        .map(|&category| match &config.tail.pool_id {
            Some(pool_id) => filters::for_pool(&registry, category, pool_id.clone(), print_record),
            None => registry.subscribe(category, print_record),
        })
        .collect();

    info!(
        categories = subscriptions.len(),
        pool = config.tail.pool_id.as_deref().unwrap_or("*"),
        "tailing events (ctrl-c to stop)"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    watcher.abort();
    drop(subscriptions);
    registry.reset();
    manager.shutdown().await;

    Ok(())
}

fn print_record(record: &CanonicalRecord) {
    info!(category = %record.category(), "{record}");
    match serde_json::to_string(record) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to serialise record"),
    }
}

/// Log every state transition; after a failure, wait and reconnect until a
/// transport comes back.
async fn watch_connection(registry: SubscriptionRegistry, delay: Duration) {
    let mut states = registry.transport().state_changes();
    loop {
        match states.recv().await {
            Ok(ConnectionState::Failed) => {
                let reason = registry.transport().last_error().unwrap_or_default();
                warn!(reason = %reason, delay = ?delay, "connection failed");
                loop {
                    tokio::time::sleep(delay).await;
                    // A fallback may already have recovered.
                    if registry.connection_state().is_connected() {
                        break;
                    }
                    match registry.reconnect().await {
                        Ok(()) => break,
                        Err(e) => error!(error = %e, "reconnect failed, retrying"),
                    }
                }
                // Transitions from the attempts above are already handled.
                states = states.resubscribe();
                info!(state = %registry.connection_state(), "connection restored");
            }
            Ok(state) => info!(state = %state, "connection state"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed connection state updates"),
            Err(RecvError::Closed) => break,
        }
    }
}
