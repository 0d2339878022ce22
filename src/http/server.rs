//! Relay server setup.
//!
//! # Responsibilities
//! - Build the registry, system service, security pipeline and dispatcher
//! - Create the Axum router (`/ws`, `/status`)
//! - Apply configuration reloads
//! - Run the peer health monitor
//! - Ordered shutdown: stop accepting, close connections, stop services

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::correlation::{Correlator, Scheduler, TokioScheduler};
use crate::dispatch::Dispatcher;
use crate::health::HealthMonitor;
use crate::lifecycle::Shutdown;
use crate::net::ConnectionTracker;
use crate::observability::metrics;
use crate::security::SecurityLayer;
use crate::service::{
    RegistryError, RegistrySettings, ServiceRegistry, ServiceSummary, SystemService, WorkerPool,
};

use super::websocket::ws_handler;

/// Live peers keyed by client id.
pub type PeerTable = DashMap<String, Arc<Correlator>>;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<RelayConfig>>,
    pub registry: Arc<ServiceRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub peers: Arc<PeerTable>,
    pub tracker: ConnectionTracker,
    pub scheduler: Arc<dyn Scheduler>,
    pub shutdown: Arc<Shutdown>,
}

/// Snapshot served at `/status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub connections: u64,
    pub peers: Vec<String>,
    pub workers: usize,
    pub busy_workers: usize,
    pub services: Vec<ServiceSummary>,
}

pub struct RelayServer {
    state: AppState,
    security: SecurityLayer,
}

impl RelayServer {
    /// Build every subsystem and install the system service.
    pub fn new(config: RelayConfig) -> Result<Self, RegistryError> {
        let registry = Arc::new(ServiceRegistry::new(
            RegistrySettings::from(&config.services),
            WorkerPool::new(config.services.effective_workers()),
        ));
        SystemService::install(&registry)?;

        let security = SecurityLayer::from_config(&config);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(security.pipeline()),
            Arc::clone(&registry),
        ));

        let state = AppState {
            config: Arc::new(ArcSwap::from_pointee(config)),
            registry,
            dispatcher,
            peers: Arc::new(DashMap::new()),
            tracker: ConnectionTracker::new(),
            scheduler: Arc::new(TokioScheduler::new()),
            shutdown: Arc::new(Shutdown::new()),
        };
        Ok(Self { state, security })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/status", get(status_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `signal` resolves, then shut down in order.
    pub async fn run<S>(
        self,
        listener: TcpListener,
        config_updates: Option<mpsc::UnboundedReceiver<RelayConfig>>,
        signal: S,
    ) -> Result<(), std::io::Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Relay server starting");

        let config = self.state.config.load_full();
        if config.health_check.enabled {
            let monitor = HealthMonitor::new(
                Arc::clone(&self.state.peers),
                Arc::clone(&self.state.registry),
                config.health_check.clone(),
            );
            tokio::spawn(monitor.run(self.state.shutdown.subscribe()));
        }

        if let Some(updates) = config_updates {
            tokio::spawn(apply_reloads(
                updates,
                self.state.clone(),
                self.security.clone(),
            ));
        }

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = Arc::clone(&self.state.shutdown);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                tracing::info!("Shutdown signal received");
                shutdown.trigger();
            })
            .await?;

        self.finish().await;
        Ok(())
    }

    async fn finish(&self) {
        let grace = self.state.config.load().timeouts.shutdown_grace();
        if !self.state.tracker.wait_for_drain(grace).await {
            tracing::warn!(
                remaining = self.state.tracker.active_count(),
                "Connections still open after grace period"
            );
        }

        let peers: Vec<Arc<Correlator>> = self
            .state
            .peers
            .iter()
            .map(|p| Arc::clone(p.value()))
            .collect();
        for peer in peers {
            peer.close();
        }
        let stopped = self.state.registry.shutdown_all();
        self.state.registry.pool().close();
        metrics::set_services_registered(self.state.registry.len());

        tracing::info!(services_stopped = stopped, "Relay server stopped");
    }
}

async fn apply_reloads(
    mut updates: mpsc::UnboundedReceiver<RelayConfig>,
    state: AppState,
    security: SecurityLayer,
) {
    let mut shutdown = state.shutdown.subscribe();
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(config) = update else { break };
                security.apply(&config);
                state.config.store(Arc::new(config));
                tracing::info!("Configuration reloaded");
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusReport> {
    let mut peers: Vec<String> = state.peers.iter().map(|p| p.key().clone()).collect();
    peers.sort();
    let pool = state.registry.pool();
    Json(StatusReport {
        connections: state.tracker.active_count(),
        peers,
        workers: pool.size(),
        busy_workers: pool.busy(),
        services: state.registry.list(),
    })
}
