use crate::error::{json_error_response, ErrorCode};
use crate::registry::ServiceRegistry;
use crate::service::ServiceSpec;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const SERVICES_PATH: &str = "/services";
const REFRESH_SUFFIX: &str = "/refresh";

/// Maximum accepted size of a service spec body
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Management API: add, remove, list and refresh services
pub struct AdminServer {
    bind_addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<ServiceRegistry>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, registry, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    registry: Arc<ServiceRegistry>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, registry, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<Incoming>,
    registry: Arc<ServiceRegistry>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    // Health and version need no auth
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(json_error_response(ErrorCode::Unauthorized, "unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        // List services: GET /services
        (&Method::GET, SERVICES_PATH) => {
            let services = registry.list().await;
            let body = serde_json::json!({
                "count": services.len(),
                "services": services,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // Add a service: POST /services with a JSON service spec
        (&Method::POST, SERVICES_PATH) => add_service(req, &registry).await,

        // Refresh backends: POST /services/{id}/refresh
        (&Method::POST, p) if p.starts_with("/services/") && p.ends_with(REFRESH_SUFFIX) => {
            let id = service_id(p.strip_suffix(REFRESH_SUFFIX).unwrap_or(p));
            match registry.refresh(id).await {
                Ok(backends) => {
                    info!(service = id, backends, "Backends refreshed via admin API");
                    let body = serde_json::json!({ "id": id, "backends": backends });
                    json_response(StatusCode::OK, body.to_string())
                }
                Err(e) => json_error_response(e.code(), e.to_string()),
            }
        }

        // Remove a service: DELETE /services/{id}
        (&Method::DELETE, p) if p.starts_with("/services/") => {
            let id = service_id(p);
            if id.is_empty() {
                json_error_response(ErrorCode::InvalidSpec, "missing service id")
            } else {
                match registry.remove(id).await {
                    Ok(()) => {
                        let body = serde_json::json!({ "id": id, "removed": true });
                        json_response(StatusCode::OK, body.to_string())
                    }
                    Err(e) => json_error_response(e.code(), e.to_string()),
                }
            }
        }

        // 404 for everything else
        _ => json_error_response(ErrorCode::NotFound, "not found"),
    };

    Ok(response)
}

fn service_id(path: &str) -> &str {
    path.strip_prefix("/services/").unwrap_or("")
}

async fn add_service(req: Request<Incoming>, registry: &ServiceRegistry) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_error_response(ErrorCode::InvalidSpec, format!("failed to read body: {}", e))
        }
    };

    let spec: ServiceSpec = match serde_json::from_slice(&body) {
        Ok(spec) => spec,
        Err(e) => return json_error_response(ErrorCode::InvalidSpec, e.to_string()),
    };

    let id = spec.id.clone();
    match registry.add(spec).await {
        Ok(addr) => {
            let body = serde_json::json!({ "id": id, "address": addr.to_string() });
            json_response(StatusCode::CREATED, body.to_string())
        }
        Err(e) => json_error_response(e.code(), e.to_string()),
    }
}
