//! HTTP server setup and lifecycle.
//!
//! Wires the stores, broker, registry, dispatcher and fan-out driver together
//! and serves the router with:
//! - WebSocket sessions and JSON endpoints
//! - Graceful shutdown that cancels every session and the fan-out driver
//! - Health and readiness endpoints

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, MemoryBroker};
use crate::config::{Config, Follow};
use crate::service::validate::{validate_topic, validate_user_id};
use crate::service::{
    create_router, ConnectionRegistry, Dispatcher, FanOut, FanOutDriver, SessionContext,
    SessionSettings, TopicEventSender,
};
use crate::storage::{run_blocking, Stores};

/// Server state shared across handlers and sessions.
pub struct ServerState {
    pub registry: Arc<ConnectionRegistry>,
    pub broker: Arc<dyn Broker>,
    pub stores: Stores,
    pub dispatcher: Arc<Dispatcher>,
    pub fanout: Arc<FanOut>,
    pub events: TopicEventSender,
    pub session: SessionSettings,
    /// Root token; cancelled when the service stops.
    pub shutdown: CancellationToken,
}

impl ServerState {
    /// Build the service graph over `stores`.
    ///
    /// The returned driver is not running yet; the caller spawns it.
    pub fn new(config: &Config, stores: Stores) -> (Arc<Self>, FanOutDriver) {
        let registry = Arc::new(ConnectionRegistry::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(config.broker_channel_size));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), stores.clone()));
        let fanout = Arc::new(FanOut::new(
            dispatcher.clone(),
            stores.subscriptions.clone(),
            config.fanout_prefix.clone(),
        ));
        let (driver, events) = FanOutDriver::new(
            fanout.clone(),
            config.fanout_interval(),
            config.event_queue_size,
        );

        let state = Arc::new(Self {
            registry,
            broker,
            stores,
            dispatcher,
            fanout,
            events,
            session: SessionSettings {
                ordered_replay: !config.unordered_replay,
                supersede: config.supersede,
                write_timeout: config.write_timeout(),
            },
            shutdown: CancellationToken::new(),
        });
        (state, driver)
    }

    /// What a new connection session needs from the service.
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: self.registry.clone(),
            broker: self.broker.clone(),
            stores: self.stores.clone(),
            settings: self.session,
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Install the follows given on the command line.
///
/// Returns how many follows were newly added.
pub async fn preload_follows(state: &ServerState, follows: &[Follow]) -> anyhow::Result<usize> {
    let mut added = 0;
    for follow in follows {
        let user = validate_user_id(&follow.user_id)?;
        for topic in &follow.topics {
            validate_topic(topic)?;
            let index = state.stores.subscriptions.clone();
            let (topic, user) = (topic.clone(), user.clone());
            if run_blocking(move || index.subscribe(&topic, &user)).await? {
                added += 1;
            }
        }
    }
    if added > 0 {
        tracing::info!(added, "Preloaded topic follows");
    }
    Ok(added)
}

/// Run the Tidings server.
///
/// # Arguments
///
/// * `config` - Server configuration
/// * `shutdown_rx` - Receiver for shutdown signal
///
/// # Returns
///
/// Returns when the server has shut down and every session has closed.
pub async fn run_server(config: Config, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;

    let stores = Stores::open(&config).context("failed to open storage")?;
    let (state, driver) = ServerState::new(&config, stores);
    preload_follows(&state, &config.follows).await?;

    let driver_task = tokio::spawn(driver.run(state.shutdown.child_token()));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(address = %listener.local_addr()?, "Starting Tidings server");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, create_router(state.clone()))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            tracing::info!("Shutdown signal received, stopping server");
            shutdown.cancel();
        })
        .await?;

    // Sessions observe the cancelled root token; close whatever is left.
    state.shutdown.cancel();
    let closed = state.registry.close_all().await;
    tracing::info!(closed, "Closed live connections");

    if let Err(e) = driver_task.await {
        tracing::warn!(error = %e, "Fan-out driver task failed");
    }

    tracing::info!("Server stopped");
    Ok(())
}
