//! Service registry: routes, ownership and quotas.
//!
//! # Responsibilities
//! - Register, update and unregister services and their routes
//! - Enforce the per-client service quota at registration time
//! - Resolve a URI to its service
//! - Kill every service of an owner that went away
//!
//! # Design Decisions
//! - The trie sits behind one reader/writer lock: lookups share, mutations exclude
//! - Route changes roll back on failure, so a rejected registration or update
//!   leaves the table exactly as it was
//! - The owner entry is held for the whole registration so quota checks are atomic

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ServicesConfig;
use crate::observability::metrics;
use crate::routing::{MatchContext, RoutingError, TrieRouter};

use super::executor::Executor;
use super::hosted::{Service, ServiceSummary};
use super::pool::WorkerPool;
use super::queue::QueueSettings;
use super::types::{full_route, service_key, ServiceDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("client {owner} already owns the maximum of {max} services")]
    QuotaExceeded { owner: String, max: usize },

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("service {0} not found")]
    NotFound(String),

    /// The caller may not act for the owner it named.
    #[error("{caller} may not manage services of {owner}")]
    NotOwner { owner: String, caller: String },

    #[error("service {0} is already registered")]
    AlreadyRegistered(String),

    #[error("invalid service descriptor: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    pub max_per_client: usize,
    pub queue: QueueSettings,
    pub compaction_threshold: usize,
}

impl From<&ServicesConfig> for RegistrySettings {
    fn from(config: &ServicesConfig) -> Self {
        Self {
            max_per_client: config.max_per_client,
            queue: QueueSettings::from(config),
            compaction_threshold: config.compaction_threshold,
        }
    }
}

/// Short URIs added and removed by an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UriDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

pub struct ServiceRegistry {
    router: RwLock<TrieRouter<Arc<Service>>>,
    services: DashMap<String, Arc<Service>>,
    owners: DashMap<String, HashSet<String>>,
    pool: WorkerPool,
    settings: RegistrySettings,
}

impl ServiceRegistry {
    pub fn new(settings: RegistrySettings, pool: WorkerPool) -> Self {
        Self {
            router: RwLock::new(TrieRouter::with_compaction_threshold(settings.compaction_threshold)),
            services: DashMap::new(),
            owners: DashMap::new(),
            pool,
            settings,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Register a service and make its routes reachable.
    pub fn register_service(
        &self,
        descriptor: ServiceDescriptor,
        executor: Arc<dyn Executor>,
    ) -> Result<Arc<Service>, RegistryError> {
        validate_descriptor(&descriptor)?;
        let key = descriptor.key();

        let mut owned = self.owners.entry(descriptor.owner_id.clone()).or_default();
        if owned.contains(&descriptor.id) {
            return Err(RegistryError::AlreadyRegistered(key));
        }
        if owned.len() >= self.settings.max_per_client {
            let owner = descriptor.owner_id.clone();
            let empty = owned.is_empty();
            drop(owned);
            if empty {
                self.owners.remove_if(&owner, |_, ids| ids.is_empty());
            }
            warn!(owner = %owner, max = self.settings.max_per_client, "Service quota exceeded");
            return Err(RegistryError::QuotaExceeded {
                owner,
                max: self.settings.max_per_client,
            });
        }

        let short_uris = descriptor.short_uris.clone();
        let service = Arc::new(Service::start(
            descriptor,
            executor,
            self.pool.clone(),
            self.settings.queue,
        ));

        let routed = add_routes(&mut self.write_router(), &service, &short_uris);
        if let Err(e) = routed {
            service.stop();
            let empty = owned.is_empty();
            let owner = service.owner_id().to_string();
            drop(owned);
            if empty {
                self.owners.remove_if(&owner, |_, ids| ids.is_empty());
            }
            return Err(e.into());
        }

        service.mark_running();
        owned.insert(service.id().to_string());
        drop(owned);
        self.services.insert(key.clone(), Arc::clone(&service));
        metrics::set_services_registered(self.services.len());

        info!(
            service = %key,
            kind = ?service.kind(),
            routes = ?service.routes(),
            "Service registered"
        );
        Ok(service)
    }

    /// Remove a service on its owner's request.
    pub fn unregister_service(&self, owner_id: &str, id: &str) -> Result<(), RegistryError> {
        let key = service_key(owner_id, id);
        let service = self
            .services
            .get(&key)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;

        self.detach(&key, &service);
        service.stop();
        info!(service = %key, "Service unregistered");
        Ok(())
    }

    /// Replace the short URI set, touching only the routes that changed.
    pub fn update_service(
        &self,
        owner_id: &str,
        id: &str,
        short_uris: Vec<String>,
    ) -> Result<UriDiff, RegistryError> {
        let key = service_key(owner_id, id);
        validate_uris(&short_uris)?;

        // Diff, apply and record under one write lock so concurrent updates
        // and removals see each other's route sets.
        let mut router = self.write_router();
        let service = self
            .services
            .get(&key)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| RegistryError::NotFound(key.clone()))?;

        let current: BTreeSet<String> = service.short_uris().into_iter().collect();
        let next: BTreeSet<String> = short_uris.iter().cloned().collect();
        let diff = UriDiff {
            added: next.difference(&current).cloned().collect(),
            removed: current.difference(&next).cloned().collect(),
        };

        for short in &diff.removed {
            if let Err(e) = router.remove(&full_route(owner_id, id, short)) {
                warn!(service = %key, uri = %short, error = %e, "Route already gone");
            }
        }
        if let Err(e) = add_routes(&mut router, &service, &diff.added) {
            // Put the removed routes back; they were valid a moment ago.
            for short in &diff.removed {
                let _ = router.add(&full_route(owner_id, id, short), Arc::clone(&service), true);
            }
            return Err(e.into());
        }
        service.set_short_uris(short_uris);
        drop(router);

        info!(service = %key, added = ?diff.added, removed = ?diff.removed, "Service updated");
        Ok(diff)
    }

    /// Resolve `uri` (with optional query) to its service and captures.
    pub fn find_service_by_uri(&self, uri: &str) -> Result<MatchContext<Arc<Service>>, RegistryError> {
        Ok(self
            .router
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .match_path(uri)?)
    }

    pub fn supports_uri(&self, uri: &str) -> bool {
        self.router
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .supports_uri(uri)
    }

    pub fn get(&self, owner_id: &str, id: &str) -> Option<Arc<Service>> {
        self.services
            .get(&service_key(owner_id, id))
            .map(|s| Arc::clone(s.value()))
    }

    /// Number of services `owner_id` currently owns.
    pub fn owned_by(&self, owner_id: &str) -> usize {
        self.owners.get(owner_id).map(|ids| ids.len()).unwrap_or(0)
    }

    /// Kill every service of an owner that disappeared. Returns how many died.
    pub fn kill_owner(&self, owner_id: &str) -> usize {
        let Some((_, ids)) = self.owners.remove(owner_id) else {
            return 0;
        };

        let mut killed = 0;
        for id in ids {
            let key = service_key(owner_id, &id);
            if let Some((_, service)) = self.services.remove(&key) {
                self.remove_routes(&service);
                service.kill();
                killed += 1;
            }
        }
        metrics::set_services_registered(self.services.len());
        if killed > 0 {
            warn!(owner = %owner_id, services = killed, "Owner lost, services killed");
        }
        killed
    }

    /// Stop every service. Used on server shutdown.
    pub fn shutdown_all(&self) -> usize {
        let all: Vec<(String, Arc<Service>)> = self
            .services
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (key, service) in &all {
            self.detach(key, service);
            service.stop();
        }
        info!(services = all.len(), "All services stopped");
        all.len()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Snapshot of every service, ordered by owner and id.
    pub fn list(&self) -> Vec<ServiceSummary> {
        let mut summaries: Vec<ServiceSummary> =
            self.services.iter().map(|e| e.value().summary()).collect();
        summaries.sort_by(|a, b| (&a.owner_id, &a.id).cmp(&(&b.owner_id, &b.id)));
        summaries
    }

    fn detach(&self, key: &str, service: &Arc<Service>) {
        self.services.remove(key);
        if let Some(mut ids) = self.owners.get_mut(service.owner_id()) {
            ids.remove(service.id());
        }
        self.owners.remove_if(service.owner_id(), |_, ids| ids.is_empty());
        self.remove_routes(service);
        metrics::set_services_registered(self.services.len());
    }

    fn remove_routes(&self, service: &Service) {
        let mut router = self.write_router();
        for route in service.routes() {
            if let Err(e) = router.remove(&route) {
                warn!(service = %service.id(), route = %route, error = %e, "Route already gone");
            }
        }
    }

    fn write_router(&self) -> RwLockWriteGuard<'_, TrieRouter<Arc<Service>>> {
        self.router.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Add every route or none of them.
fn add_routes(
    router: &mut TrieRouter<Arc<Service>>,
    service: &Arc<Service>,
    short_uris: &[String],
) -> Result<(), RoutingError> {
    let mut added: Vec<String> = Vec::with_capacity(short_uris.len());
    for short in short_uris {
        let route = full_route(service.owner_id(), service.id(), short);
        if let Err(e) = router.add(&route, Arc::clone(service), false) {
            for done in &added {
                let _ = router.remove(done);
            }
            return Err(e);
        }
        added.push(route);
    }
    Ok(())
}

fn validate_descriptor(descriptor: &ServiceDescriptor) -> Result<(), RegistryError> {
    validate_name("service id", &descriptor.id)?;
    validate_name("owner id", &descriptor.owner_id)?;
    if descriptor.short_uris.is_empty() {
        return Err(RegistryError::Invalid("a service needs at least one uri".into()));
    }
    validate_uris(&descriptor.short_uris)
}

fn validate_name(what: &str, name: &str) -> Result<(), RegistryError> {
    if name.is_empty()
        || name.contains(['/', '?'])
        || name.starts_with([':', '*'])
    {
        return Err(RegistryError::Invalid(format!("{what} {name:?} is not a plain path segment")));
    }
    Ok(())
}

fn validate_uris(short_uris: &[String]) -> Result<(), RegistryError> {
    let mut seen = HashSet::new();
    for uri in short_uris {
        if !(uri.is_empty() || uri.starts_with('/')) || uri.contains('?') {
            return Err(RegistryError::Invalid(format!("uri {uri:?} must be empty or start with '/'")));
        }
        if !seen.insert(uri.as_str()) {
            return Err(RegistryError::Invalid(format!("uri {uri:?} listed twice")));
        }
    }
    Ok(())
}
