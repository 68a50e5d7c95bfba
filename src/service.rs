//! Service declarations
//!
//! A [`ServiceSpec`] names a logical service: the external port the proxy
//! listens on, the port its backends listen on, and the label selector used
//! to discover those backends.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Transport protocol of a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream transport (the only one proxied)
    #[default]
    Tcp,
    /// Datagram transport
    Udp,
}

impl Protocol {
    pub fn is_stream(&self) -> bool {
        matches!(self, Protocol::Tcp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Label constraints; every pair must match for an endpoint to be selected.
///
/// Keys are kept ordered so the encoded query is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constraint (builder pattern)
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns true if every constraint is satisfied by `labels`
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Encode as a conjunction of `key=value` pairs: `app=web,tier=front`
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSelector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

/// Immutable declaration of a proxied service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Unique service identifier
    pub id: String,

    /// External port the proxy listens on (0 picks an ephemeral port)
    pub port: u16,

    /// Port the backends listen on
    #[serde(alias = "container_port")]
    pub container_port: u16,

    /// Transport protocol (default: tcp)
    #[serde(default)]
    pub protocol: Protocol,

    /// Labels used to discover backends
    #[serde(default)]
    pub selector: LabelSelector,
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>, port: u16, container_port: u16) -> Self {
        Self {
            id: id.into(),
            port,
            container_port,
            protocol: Protocol::Tcp,
            selector: LabelSelector::new(),
        }
    }

    /// Set the label selector (builder pattern)
    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Set the protocol (builder pattern)
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Validate the declaration.
    ///
    /// An empty selector is not rejected here; the resolver refuses it when the
    /// service starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("'id' must not be empty".to_string());
        }
        if self.id.contains('/') {
            return Err(format!("Service '{}': 'id' must not contain '/'", self.id));
        }
        if self.container_port == 0 {
            return Err(format!(
                "Service '{}': 'containerPort' must be greater than 0",
                self.id
            ));
        }
        Ok(())
    }
}
