use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use svcproxy::admin::{AdminServer, PKG_NAME, VERSION};
use svcproxy::config::Config;
use svcproxy::discovery::{ApiServerDiscovery, Resolver};
use svcproxy::registry::ServiceRegistry;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("svcproxy=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let discovery = ApiServerDiscovery::new(&config.discovery.url, config.discovery.request_timeout())
        .map_err(|e| anyhow::anyhow!("Failed to build discovery client: {}", e))?;
    let registry = ServiceRegistry::new(Resolver::new(Arc::new(discovery)), config.proxy_settings()?);

    // A service that fails to start is logged and skipped; it can be added
    // again through the management API.
    for spec in config.services.iter().cloned() {
        let id = spec.id.clone();
        match registry.add(spec).await {
            Ok(addr) => info!(service = %id, addr = %addr, "Configured service started"),
            Err(e) => error!(service = %id, error = %e, "Failed to start configured service"),
        }
    }

    // Management API (always bound to loopback)
    let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&registry), shutdown_rx.clone(), admin_token);
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!(services = registry.len().await, "Stopping all services...");
    registry.stop_all().await;

    // Wait for the admin server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting service proxy");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        "Server configuration"
    );
    info!(
        url = %config.discovery.url,
        request_timeout_secs = config.discovery.request_timeout_secs,
        refresh_interval_secs = config.discovery.refresh_interval_secs,
        "Discovery settings"
    );
    info!(
        accept_backoff_ms = config.proxy.accept_backoff_ms,
        connect_timeout_ms = config.proxy.connect_timeout_ms,
        "Connection handling"
    );
    info!(
        service_count = config.services.len(),
        services = ?config.services.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        "Configured services"
    );
}
