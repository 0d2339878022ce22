//! Active peer liveness checks.
//!
//! # Responsibilities
//! - Periodically ping every peer that hosts at least one service
//! - Count consecutive failures per peer
//! - Evict a peer past the threshold: kill its services, close its connection

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::correlation::Correlator;
use crate::http::PeerTable;
use crate::observability::metrics;
use crate::protocol::{Message, MessageType, RELAY_ID};
use crate::service::ServiceRegistry;

pub struct HealthMonitor {
    peers: Arc<PeerTable>,
    registry: Arc<ServiceRegistry>,
    config: HealthCheckConfig,
    failures: HashMap<String, u32>,
}

impl HealthMonitor {
    pub fn new(peers: Arc<PeerTable>, registry: Arc<ServiceRegistry>, config: HealthCheckConfig) -> Self {
        Self {
            peers,
            registry,
            config,
            failures: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Peer health checks disabled");
            return;
        }

        tracing::info!(
            interval = self.config.interval_secs,
            threshold = self.config.unhealthy_threshold,
            "Health monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe all service hosts once. Returns the number of evicted peers.
    pub async fn check_all(&mut self) -> usize {
        let hosts: Vec<Arc<Correlator>> = self
            .peers
            .iter()
            .filter(|p| self.registry.owned_by(p.key()) > 0)
            .map(|p| Arc::clone(p.value()))
            .collect();
        self.failures
            .retain(|peer, _| hosts.iter().any(|h| h.peer() == peer.as_str()));

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let results = join_all(hosts.into_iter().map(|host| async move {
            let healthy = probe(&host, timeout).await;
            (host, healthy)
        }))
        .await;

        let mut evicted = 0;
        for (host, healthy) in results {
            metrics::record_peer_health(host.peer(), healthy);
            if healthy {
                self.failures.remove(host.peer());
                continue;
            }

            let count = self.failures.entry(host.peer().to_string()).or_insert(0);
            *count += 1;
            if *count < self.config.unhealthy_threshold {
                continue;
            }

            self.failures.remove(host.peer());
            let killed = self.registry.kill_owner(host.peer());
            host.close();
            evicted += 1;
            tracing::warn!(
                client_id = %host.peer(),
                connection_id = %host.connection_id(),
                services_killed = killed,
                "Peer unresponsive, evicted"
            );
        }
        if evicted > 0 {
            metrics::set_services_registered(self.registry.len());
        }
        evicted
    }

    /// Consecutive failed probes recorded for `client_id`.
    pub fn failures(&self, client_id: &str) -> u32 {
        self.failures.get(client_id).copied().unwrap_or(0)
    }
}

async fn probe(host: &Correlator, timeout: Duration) -> bool {
    let ping = Message::new(
        Correlator::next_message_id(),
        RELAY_ID,
        host.peer(),
        MessageType::Ping,
        Vec::new(),
    );
    match host.request_with_timeout(ping, timeout).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(client_id = %host.peer(), error = %e, "Health check failed");
            false
        }
    }
}
