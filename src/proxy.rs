//! Per-service TCP proxy
//!
//! A [`ServiceProxy`] owns one external listener. Its accept loop picks a
//! backend from the [`Rotator`] for every accepted connection and hands the
//! connection to [`forward::relay`] on its own task.
//!
//! Lifecycle: `Created -> Starting -> Running -> Stopping -> Stopped`. Every
//! transition moves one step, with one exception: a start that fails (no
//! listener was ever bound) goes from `Starting` directly to `Stopped`.
//! Stopped proxies are never restarted.

use crate::discovery::Resolver;
use crate::error::{DiscoveryError, ProxyError};
use crate::forward;
use crate::rotator::Rotator;
use crate::service::{Protocol, ServiceSpec};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a service proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyState::Created => write!(f, "created"),
            ProxyState::Starting => write!(f, "starting"),
            ProxyState::Running => write!(f, "running"),
            ProxyState::Stopping => write!(f, "stopping"),
            ProxyState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Process-wide settings shared by every service proxy
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Address every service listener binds to
    pub bind_ip: IpAddr,
    /// Pause after a failed accept before accepting again
    pub accept_backoff: Duration,
    /// Maximum time to wait for a backend connection
    pub connect_timeout: Duration,
    /// Interval between periodic backend refreshes (None disables)
    pub refresh_interval: Option<Duration>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            accept_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            refresh_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Connection counters for one service
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Connections accepted since start
    pub accepted: AtomicU64,
    /// Relays currently in progress
    pub active: AtomicUsize,
    /// Connections dropped because the backend could not be reached
    pub dial_failures: AtomicU64,
    /// Connections dropped because no backend was available
    pub no_backend: AtomicU64,
}

/// Decrements the active relay count when the relay task ends
struct ActiveRelay(Arc<ConnectionStats>);

impl ActiveRelay {
    fn enter(stats: &Arc<ConnectionStats>) -> Self {
        stats.active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(stats))
    }
}

impl Drop for ActiveRelay {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serializable snapshot of a service proxy
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub id: String,
    pub port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
    pub selector: String,
    pub state: ProxyState,
    pub address: Option<SocketAddr>,
    pub backends: Vec<String>,
    pub active_connections: usize,
    pub total_connections: u64,
}

/// Handles owned while the proxy is running. Dropping them ends the accept
/// loop, since a closed shutdown channel counts as a shutdown signal.
struct RunningProxy {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    refresh_task: Option<JoinHandle<()>>,
}

/// Proxy for a single service
pub struct ServiceProxy {
    spec: Arc<ServiceSpec>,
    resolver: Resolver,
    rotator: Arc<Rotator>,
    settings: ProxySettings,
    state: Mutex<ProxyState>,
    running: Mutex<Option<RunningProxy>>,
    stats: Arc<ConnectionStats>,
}

impl ServiceProxy {
    pub fn new(spec: ServiceSpec, resolver: Resolver, settings: ProxySettings) -> Self {
        Self {
            spec: Arc::new(spec),
            resolver,
            rotator: Arc::new(Rotator::default()),
            settings,
            state: Mutex::new(ProxyState::Created),
            running: Mutex::new(None),
            stats: Arc::new(ConnectionStats::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    pub fn rotator(&self) -> &Rotator {
        &self.rotator
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn active_connections(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            id: self.spec.id.clone(),
            port: self.spec.port,
            container_port: self.spec.container_port,
            protocol: self.spec.protocol,
            selector: self.spec.selector.to_query(),
            state: self.state(),
            address: self.local_addr(),
            backends: self.rotator.backends().addrs().to_vec(),
            active_connections: self.active_connections(),
            total_connections: self.stats.accepted.load(Ordering::SeqCst),
        }
    }

    fn transition(
        &self,
        from: ProxyState,
        to: ProxyState,
        op: &'static str,
    ) -> Result<(), ProxyError> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(ProxyError::InvalidState { op, state: *state });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, state: ProxyState) {
        *self.state.lock() = state;
    }

    /// Resolve backends, bind the listener and start accepting.
    ///
    /// Returns the bound address. Any failure leaves the proxy `Stopped`.
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        self.transition(ProxyState::Created, ProxyState::Starting, "start")?;

        match self.launch().await {
            Ok(running) => {
                let addr = running.local_addr;
                *self.running.lock() = Some(running);
                self.set_state(ProxyState::Running);
                info!(
                    service = %self.spec.id,
                    addr = %addr,
                    container_port = self.spec.container_port,
                    backends = self.rotator.len(),
                    "Service proxy running"
                );
                Ok(addr)
            }
            Err(e) => {
                self.set_state(ProxyState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<RunningProxy, ProxyError> {
        if !self.spec.protocol.is_stream() {
            return Err(ProxyError::UnsupportedProtocol(self.spec.protocol));
        }

        let backends = self
            .resolver
            .resolve(&self.spec.selector, self.spec.container_port)
            .await?;
        if backends.is_empty() {
            warn!(service = %self.spec.id, selector = %self.spec.selector, "No running backends found");
        }
        self.rotator.replace(backends);

        let bind_addr = SocketAddr::new(self.settings.bind_ip, self.spec.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind {
                addr: bind_addr,
                source,
            })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_loop = AcceptLoop {
            listener,
            spec: Arc::clone(&self.spec),
            rotator: Arc::clone(&self.rotator),
            stats: Arc::clone(&self.stats),
            accept_backoff: self.settings.accept_backoff,
            connect_timeout: self.settings.connect_timeout,
            shutdown_rx: shutdown_rx.clone(),
        };
        let accept_task = tokio::spawn(accept_loop.run());

        let refresh_task = self
            .settings
            .refresh_interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| {
                tokio::spawn(refresh_loop(
                    Arc::clone(&self.spec),
                    self.resolver.clone(),
                    Arc::clone(&self.rotator),
                    interval,
                    shutdown_rx,
                ))
            });

        Ok(RunningProxy {
            local_addr,
            shutdown_tx,
            accept_task,
            refresh_task,
        })
    }

    /// Stop accepting connections.
    ///
    /// Returns once the accept loop has exited and the listener is closed.
    /// Relays already in progress keep running until either side closes.
    pub async fn stop(&self) -> Result<(), ProxyError> {
        self.transition(ProxyState::Running, ProxyState::Stopping, "stop")?;
        info!(service = %self.spec.id, "Stopping service proxy");

        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown_tx.send(true);
            if let Err(e) = running.accept_task.await {
                error!(service = %self.spec.id, error = %e, "Accept loop task failed");
            }
            if let Some(task) = running.refresh_task {
                if let Err(e) = task.await {
                    error!(service = %self.spec.id, error = %e, "Refresh task failed");
                }
            }
        }

        self.set_state(ProxyState::Stopped);
        info!(
            service = %self.spec.id,
            in_flight = self.active_connections(),
            "Service proxy stopped"
        );
        Ok(())
    }

    /// Re-resolve backends and swap them into the rotation
    pub async fn refresh(&self) -> Result<usize, DiscoveryError> {
        refresh_backends(&self.spec, &self.resolver, &self.rotator).await
    }
}

async fn refresh_backends(
    spec: &ServiceSpec,
    resolver: &Resolver,
    rotator: &Rotator,
) -> Result<usize, DiscoveryError> {
    let backends = resolver.resolve(&spec.selector, spec.container_port).await?;
    let count = backends.len();
    rotator.replace(backends);
    debug!(service = %spec.id, backends = count, "Refreshed backends");
    Ok(count)
}

async fn refresh_loop(
    spec: Arc<ServiceSpec>,
    resolver: Resolver,
    rotator: Arc<Rotator>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = async {
                tokio::time::sleep(interval).await;
                refresh_backends(&spec, &resolver, &rotator).await
            } => {
                if let Err(e) = result {
                    warn!(service = %spec.id, error = %e, "Backend refresh failed, keeping previous backends");
                }
            }
        }
    }
}

struct AcceptLoop {
    listener: TcpListener,
    spec: Arc<ServiceSpec>,
    rotator: Arc<Rotator>,
    stats: Arc<ConnectionStats>,
    accept_backoff: Duration,
    connect_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        info!(
            service = %self.spec.id,
            port = self.spec.port,
            container_port = self.spec.container_port,
            "Accepting connections"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.dispatch(stream, peer),
                        Err(e) => {
                            error!(
                                service = %self.spec.id,
                                error = %e,
                                backoff_ms = self.accept_backoff.as_millis() as u64,
                                "Failed to accept connection"
                            );
                            tokio::select! {
                                _ = shutdown_rx.changed() => break,
                                _ = tokio::time::sleep(self.accept_backoff) => {}
                            }
                        }
                    }
                }
            }
        }

        // The listener closes here, before stop() observes the task finishing
        drop(self.listener);
        info!(service = %self.spec.id, "Stopped accepting connections");
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        self.stats.accepted.fetch_add(1, Ordering::SeqCst);

        // Chosen in accept order so sequential clients see strict rotation
        let Some(backend) = self.rotator.next() else {
            self.stats.no_backend.fetch_add(1, Ordering::SeqCst);
            warn!(service = %self.spec.id, peer = %peer, "Cannot serve connection: no backends available");
            return;
        };

        let service = Arc::clone(&self.spec);
        let stats = Arc::clone(&self.stats);
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let _active = ActiveRelay::enter(&stats);
            debug!(service = %service.id, peer = %peer, backend = %backend, "Proxying connection");

            match forward::relay(stream, &backend, connect_timeout).await {
                Ok(relayed) => {
                    debug!(
                        service = %service.id,
                        peer = %peer,
                        backend = %backend,
                        client_to_backend = relayed.client_to_backend,
                        backend_to_client = relayed.backend_to_client,
                        errors = relayed.errors,
                        "Connection closed"
                    );
                }
                Err(e) => {
                    stats.dial_failures.fetch_add(1, Ordering::SeqCst);
                    warn!(service = %service.id, peer = %peer, error = %e, "Dropping connection");
                }
            }
        });
    }
}
