//! Registry of running service proxies
//!
//! At most one proxy exists per service id. `add` and `remove` are serialized
//! by a single lock; `add` holds it across the proxy start so a failed start
//! never leaves a partial entry.
//!
//! Removal is stop-then-delete: the entry stays registered until its proxy
//! has stopped accepting, so an `add` with the same id during that window gets
//! `AlreadyExists`. The lock is not held while the proxy stops.

use crate::discovery::Resolver;
use crate::error::{ProxyError, RegistryError};
use crate::proxy::{ProxySettings, ServiceProxy, ServiceStatus};
use crate::service::ServiceSpec;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

type ServiceMap = Arc<Mutex<HashMap<String, Arc<ServiceProxy>>>>;

/// Maps service ids to their running proxies
pub struct ServiceRegistry {
    resolver: Resolver,
    settings: ProxySettings,
    services: ServiceMap,
}

impl ServiceRegistry {
    /// Create a new registry.
    ///
    /// Returns `Arc<Self>` since the registry is shared between the management
    /// API and process shutdown.
    pub fn new(resolver: Resolver, settings: ProxySettings) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            settings,
            services: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Start a proxy for `spec` and register it. Returns the bound address.
    pub async fn add(&self, spec: ServiceSpec) -> Result<SocketAddr, RegistryError> {
        spec.validate().map_err(RegistryError::InvalidSpec)?;

        let mut services = self.services.lock().await;
        if services.contains_key(&spec.id) {
            info!(service = %spec.id, "Service already exists");
            return Err(RegistryError::AlreadyExists(spec.id));
        }

        let id = spec.id.clone();
        let proxy = Arc::new(ServiceProxy::new(
            spec,
            self.resolver.clone(),
            self.settings.clone(),
        ));

        let addr = proxy.start().await.map_err(|source| {
            error!(service = %id, error = %source, "Error adding service");
            RegistryError::Start {
                id: id.clone(),
                source,
            }
        })?;

        services.insert(id.clone(), proxy);
        info!(service = %id, addr = %addr, "Service added");
        Ok(addr)
    }

    /// Stop the proxy for `id`, then unregister it.
    ///
    /// The stop runs on its own task, so it completes and the entry is erased
    /// even if the returned future is dropped before it resolves.
    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let proxy = {
            let services = self.services.lock().await;
            services.get(id).cloned()
        };
        let Some(proxy) = proxy else {
            info!(service = id, "Service not found");
            return Err(RegistryError::NotFound(id.to_string()));
        };

        let task = tokio::spawn(stop_and_erase(
            Arc::clone(&self.services),
            id.to_string(),
            proxy,
        ));
        task.await.map_err(|source| {
            error!(service = id, error = %source, "Stop task failed");
            RegistryError::StopTask {
                id: id.to_string(),
                source,
            }
        })?
    }

    /// Re-resolve the backends of one service
    pub async fn refresh(&self, id: &str) -> Result<usize, RegistryError> {
        let proxy = self
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        proxy.refresh().await.map_err(|source| RegistryError::Refresh {
            id: id.to_string(),
            source,
        })
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ServiceProxy>> {
        self.services.lock().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.services.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.services.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Status of every registered service, sorted by id
    pub async fn list(&self) -> Vec<ServiceStatus> {
        let proxies: Vec<Arc<ServiceProxy>> = self.services.lock().await.values().cloned().collect();
        let mut statuses: Vec<ServiceStatus> = proxies.iter().map(|p| p.status()).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Stop and unregister every service
    pub async fn stop_all(&self) {
        let proxies: Vec<Arc<ServiceProxy>> = {
            let mut services = self.services.lock().await;
            services.drain().map(|(_, proxy)| proxy).collect()
        };
        for proxy in proxies {
            if let Err(e) = proxy.stop().await {
                error!(service = %proxy.id(), error = %e, "Error stopping service");
            }
        }
    }
}

async fn stop_and_erase(
    services: ServiceMap,
    id: String,
    proxy: Arc<ServiceProxy>,
) -> Result<(), RegistryError> {
    match proxy.stop().await {
        Ok(()) => {}
        // Another caller is already removing it
        Err(ProxyError::InvalidState { .. }) => {
            info!(service = %id, "Service is already being removed");
            return Err(RegistryError::NotFound(id));
        }
        Err(source) => {
            error!(service = %id, error = %source, "Error stopping service");
            return Err(RegistryError::Stop { id, source });
        }
    }

    let mut services = services.lock().await;
    if services
        .get(&id)
        .is_some_and(|current| Arc::ptr_eq(current, &proxy))
    {
        services.remove(&id);
    }
    info!(service = %id, "Service removed");
    Ok(())
}
