use crate::proxy::ProxySettings;
use crate::service::ServiceSpec;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Discovery source configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Connection handling settings shared by every service
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Services registered at startup
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for service listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the management API (always bound to 127.0.0.1)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the management API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Base URL of the discovery source (default: http://127.0.0.1:8080)
    #[serde(default = "default_discovery_url")]
    pub url: String,

    /// Timeout for a single discovery request in seconds
    #[serde(default = "default_discovery_timeout")]
    pub request_timeout_secs: u64,

    /// Interval between backend refreshes in seconds (0 disables)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl DiscoveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        if self.refresh_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.refresh_interval_secs))
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: default_discovery_url(),
            request_timeout_secs: default_discovery_timeout(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Pause after a failed accept in milliseconds
    #[serde(default = "default_accept_backoff")]
    pub accept_backoff_ms: u64,

    /// Backend connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            accept_backoff_ms: default_accept_backoff(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_discovery_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_discovery_timeout() -> u64 {
    10
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_accept_backoff() -> u64 {
    5000 // 5 seconds between accept retries
}

fn default_connect_timeout() -> u64 {
    10_000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed bind address for service listeners
    pub fn bind_ip(&self) -> anyhow::Result<IpAddr> {
        self.server
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.server.bind, e))
    }

    /// Settings handed to every service proxy
    pub fn proxy_settings(&self) -> anyhow::Result<ProxySettings> {
        Ok(ProxySettings {
            bind_ip: self.bind_ip()?,
            accept_backoff: Duration::from_millis(self.proxy.accept_backoff_ms),
            connect_timeout: Duration::from_millis(self.proxy.connect_timeout_ms),
            refresh_interval: self.discovery.refresh_interval(),
        })
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.bind_ip() {
            errors.push(e.to_string());
        }

        if !self.discovery.url.starts_with("http://") && !self.discovery.url.starts_with("https://") {
            errors.push(format!(
                "Discovery 'url' must start with http:// or https://, got '{}'",
                self.discovery.url
            ));
        }

        if self.discovery.request_timeout_secs == 0 {
            errors.push("Discovery 'request_timeout_secs' must be greater than 0".to_string());
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if let Err(e) = service.validate() {
                errors.push(e);
            }
            if !seen.insert(service.id.as_str()) {
                errors.push(format!("Service '{}' is declared more than once", service.id));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
