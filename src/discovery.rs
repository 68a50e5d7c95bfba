//! Backend discovery
//!
//! The discovery source is an external directory queried by label selector.
//! [`ApiServerDiscovery`] talks to it over HTTP; [`StaticDiscovery`] keeps the
//! endpoints in memory. [`Resolver`] turns the running endpoints into a
//! [`BackendSet`].

use crate::error::DiscoveryError;
use crate::rotator::BackendSet;
use crate::service::LabelSelector;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Path of the pod listing endpoint on the discovery source
const PODS_PATH: &str = "/api/v1beta1/pods";

/// Status reported for endpoints that can take traffic
const RUNNING_STATUS: &str = "Running";

/// One item reported by the discovery source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host (usually an IP) the endpoint is reachable on
    pub address: String,
    /// Whether the source reports the endpoint as running
    pub running: bool,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, running: bool) -> Self {
        Self {
            address: address.into(),
            running,
        }
    }
}

/// A query-by-label-selector read interface
pub trait Discovery: Send + Sync {
    fn query<'a>(
        &'a self,
        selector: &'a LabelSelector,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>, DiscoveryError>>;
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pod {
    #[serde(default)]
    id: String,
    #[serde(default)]
    current_state: CurrentState,
}

#[derive(Debug, Default, Deserialize)]
struct CurrentState {
    #[serde(default)]
    status: String,
    #[serde(default, rename = "podIP")]
    pod_ip: String,
}

/// Discovery source reached over HTTP
pub struct ApiServerDiscovery {
    base_url: String,
    client: reqwest::Client,
}

impl ApiServerDiscovery {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    pub fn pods_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), PODS_PATH)
    }

    async fn fetch(&self, selector: &LabelSelector) -> Result<Vec<Endpoint>, DiscoveryError> {
        let url = self.pods_url();
        let response = self
            .client
            .get(&url)
            .query(&[("labels", selector.to_query())])
            .send()
            .await
            .map_err(|source| DiscoveryError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "Discovery source returned error status");
            return Err(DiscoveryError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| DiscoveryError::Transport {
                url: url.clone(),
                source,
            })?;
        let pods: PodList = serde_json::from_slice(&body)?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| {
                let running = pod.current_state.status == RUNNING_STATUS;
                debug!(pod = %pod.id, status = %pod.current_state.status, "Discovered pod");
                Endpoint::new(pod.current_state.pod_ip, running)
            })
            .collect())
    }
}

impl Discovery for ApiServerDiscovery {
    fn query<'a>(
        &'a self,
        selector: &'a LabelSelector,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>, DiscoveryError>> {
        Box::pin(self.fetch(selector))
    }
}

/// In-memory discovery source with mutable contents
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    endpoints: RwLock<Vec<(BTreeMap<String, String>, Endpoint)>>,
    fail_status: RwLock<Option<u16>>,
    queries: AtomicUsize,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint carrying `labels` (builder pattern)
    pub fn with_endpoint(self, labels: &[(&str, &str)], address: &str, running: bool) -> Self {
        self.insert(labels, address, running);
        self
    }

    pub fn insert(&self, labels: &[(&str, &str)], address: &str, running: bool) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.endpoints
            .write()
            .push((labels, Endpoint::new(address, running)));
    }

    /// Mark every endpoint at `address` as running or not
    pub fn set_running(&self, address: &str, running: bool) {
        for (_, endpoint) in self.endpoints.write().iter_mut() {
            if endpoint.address == address {
                endpoint.running = running;
            }
        }
    }

    pub fn clear(&self) {
        self.endpoints.write().clear();
    }

    /// Make every query fail with the given status (None restores normal answers)
    pub fn fail_with_status(&self, status: Option<u16>) {
        *self.fail_status.write() = status;
    }

    /// Number of queries answered or failed so far
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Discovery for StaticDiscovery {
    fn query<'a>(
        &'a self,
        selector: &'a LabelSelector,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>, DiscoveryError>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let result = match *self.fail_status.read() {
            Some(status) => Err(DiscoveryError::Status {
                url: "static".to_string(),
                status,
            }),
            None => Ok(self
                .endpoints
                .read()
                .iter()
                .filter(|(labels, _)| selector.matches(labels))
                .map(|(_, endpoint)| endpoint.clone())
                .collect()),
        };
        Box::pin(async move { result })
    }
}

/// Resolves a label selector into a backend set.
///
/// Cheap to clone; every clone shares the same discovery source.
#[derive(Clone)]
pub struct Resolver {
    source: Arc<dyn Discovery>,
}

impl Resolver {
    pub fn new(source: Arc<dyn Discovery>) -> Self {
        Self { source }
    }

    /// Query the discovery source once and keep running endpoints, in the
    /// order received, joined with `target_port`.
    pub async fn resolve(
        &self,
        selector: &LabelSelector,
        target_port: u16,
    ) -> Result<BackendSet, DiscoveryError> {
        if selector.is_empty() {
            return Err(DiscoveryError::EmptySelector);
        }

        let endpoints = self.source.query(selector).await?;
        let reported = endpoints.len();
        let addrs: Vec<String> = endpoints
            .into_iter()
            .filter(|e| e.running && !e.address.is_empty())
            .map(|e| join_host_port(&e.address, target_port))
            .collect();

        debug!(
            selector = %selector,
            reported,
            running = addrs.len(),
            "Resolved backends"
        );
        Ok(BackendSet::new(addrs))
    }
}

/// Join a host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
