//! Integration tests for svcproxy

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use svcproxy::admin::AdminServer;
use svcproxy::discovery::{ApiServerDiscovery, Resolver, StaticDiscovery};
use svcproxy::proxy::{ProxySettings, ProxyState};
use svcproxy::registry::ServiceRegistry;
use svcproxy::service::{LabelSelector, ServiceSpec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Settings for tests: loopback listeners, short backoff, no periodic refresh
fn test_settings() -> ProxySettings {
    ProxySettings {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        accept_backoff: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        refresh_interval: None,
    }
}

fn web_spec(id: &str, container_port: u16) -> ServiceSpec {
    ServiceSpec::new(id, 0, container_port).with_selector(LabelSelector::new().with("app", "web"))
}

/// Bind listeners on 127.0.0.1 and 127.0.0.2 that share one port
async fn bind_pair() -> (TcpListener, TcpListener, u16) {
    for _ in 0..20 {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = first.local_addr().unwrap().port();
        if let Ok(second) = TcpListener::bind(("127.0.0.2", port)).await {
            return (first, second, port);
        }
    }
    panic!("could not bind 127.0.0.1 and 127.0.0.2 on a shared port");
}

/// Answer every connection with `tag`, then close it
fn serve_tag(listener: TcpListener, tag: &'static str) {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = stream.write_all(tag.as_bytes()).await;
            });
        }
    });
}

/// Echo every connection until the client closes
fn serve_echo(listener: TcpListener) {
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
}

async fn read_all(addr: SocketAddr) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut out = String::new();
    let _ = stream.read_to_string(&mut out).await;
    out
}

// ============================================================================
// Round-robin forwarding
// ============================================================================

#[tokio::test]
async fn test_sequential_connections_alternate_backends() {
    let (first, second, port) = bind_pair().await;
    serve_tag(first, "a");
    serve_tag(second, "b");

    let source = StaticDiscovery::new()
        .with_endpoint(&[("app", "web")], "127.0.0.1", true)
        .with_endpoint(&[("app", "web")], "127.0.0.2", true)
        .with_endpoint(&[("app", "web")], "127.0.0.9", false)
        .with_endpoint(&[("app", "db")], "127.0.0.3", true);
    let registry = ServiceRegistry::new(Resolver::new(Arc::new(source)), test_settings());

    let addr = registry.add(web_spec("svc1", port)).await.unwrap();

    let mut replies = Vec::new();
    for _ in 0..5 {
        replies.push(read_all(addr).await);
    }
    assert_eq!(replies, vec!["a", "b", "a", "b", "a"]);

    let status = registry.get("svc1").await.unwrap().status();
    assert_eq!(status.backends, vec![format!("127.0.0.1:{}", port), format!("127.0.0.2:{}", port)]);
    assert_eq!(status.total_connections, 5);

    registry.stop_all().await;
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_concurrent_clients_spread_evenly() {
    let (first, second, port) = bind_pair().await;
    serve_tag(first, "a");
    serve_tag(second, "b");

    let source = StaticDiscovery::new()
        .with_endpoint(&[("app", "web")], "127.0.0.1", true)
        .with_endpoint(&[("app", "web")], "127.0.0.2", true);
    let registry = ServiceRegistry::new(Resolver::new(Arc::new(source)), test_settings());
    let addr = registry.add(web_spec("svc1", port)).await.unwrap();

    let clients: Vec<_> = (0..20).map(|_| tokio::spawn(read_all(addr))).collect();
    let mut a = 0;
    let mut b = 0;
    for client in clients {
        match client.await.unwrap().as_str() {
            "a" => a += 1,
            "b" => b += 1,
            other => panic!("unexpected reply {:?}", other),
        }
    }
    assert_eq!((a, b), (10, 10));

    registry.stop_all().await;
}

#[tokio::test]
async fn test_half_close_through_proxy() {
    // Backend reads until the client half-closes, then replies with the count
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = backend.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = backend.accept().await.unwrap();
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.unwrap();
        stream.write_all(format!("got {}", data.len()).as_bytes()).await.unwrap();
    });

    let source = StaticDiscovery::new().with_endpoint(&[("app", "web")], "127.0.0.1", true);
    let registry = ServiceRegistry::new(Resolver::new(Arc::new(source)), test_settings());
    let addr = registry.add(web_spec("svc1", port)).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&vec![1u8; 50_000]).await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = String::new();
    client.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "got 50000");

    registry.stop_all().await;
}

// ============================================================================
// Removal
// ============================================================================

#[tokio::test]
async fn test_remove_keeps_in_flight_connections() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = backend.local_addr().unwrap().port();
    serve_echo(backend);

    let source = StaticDiscovery::new().with_endpoint(&[("app", "web")], "127.0.0.1", true);
    let registry = ServiceRegistry::new(Resolver::new(Arc::new(source)), test_settings());
    let addr = registry.add(web_spec("svc1", port)).await.unwrap();
    let proxy = registry.get("svc1").await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 4];
    client.write_all(b"ping").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    registry.remove("svc1").await.unwrap();
    assert!(!registry.contains("svc1").await);
    assert_eq!(proxy.state(), ProxyState::Stopped);

    // New connections are refused
    assert!(TcpStream::connect(addr).await.is_err());

    // The established relay keeps working
    client.write_all(b"pong").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
    assert_eq!(proxy.active_connections(), 1);

    drop(client);
    for _ in 0..50 {
        if proxy.active_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(proxy.active_connections(), 0);
}

#[tokio::test]
async fn test_backend_going_away_after_refresh() {
    let (first, second, port) = bind_pair().await;
    serve_tag(first, "a");
    serve_tag(second, "b");

    let source = Arc::new(
        StaticDiscovery::new()
            .with_endpoint(&[("app", "web")], "127.0.0.1", true)
            .with_endpoint(&[("app", "web")], "127.0.0.2", true),
    );
    let registry = ServiceRegistry::new(Resolver::new(source.clone()), test_settings());
    let addr = registry.add(web_spec("svc1", port)).await.unwrap();
    assert_eq!(read_all(addr).await, "a");

    source.set_running("127.0.0.1", false);
    assert_eq!(registry.refresh("svc1").await.unwrap(), 1);
    for _ in 0..3 {
        assert_eq!(read_all(addr).await, "b");
    }

    registry.stop_all().await;
}

// ============================================================================
// HTTP discovery source
// ============================================================================

/// Minimal discovery source: answers every request with `body` and reports
/// each request line on `requests`.
async fn spawn_discovery_server(body: String) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let text = String::from_utf8_lossy(&request);
                let _ = tx.send(text.lines().next().unwrap_or_default().to_string());

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    (url, rx)
}

#[tokio::test]
async fn test_http_discovery_drives_proxy() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = backend.local_addr().unwrap().port();
    serve_tag(backend, "pod-1");

    let pods = serde_json::json!({
        "items": [
            {"id": "pod-1", "currentState": {"status": "Running", "podIP": "127.0.0.1"}},
            {"id": "pod-2", "currentState": {"status": "Pending", "podIP": "127.0.0.5"}},
            {"id": "pod-3", "currentState": {"status": "Running", "podIP": ""}}
        ]
    });
    let (url, mut requests) = spawn_discovery_server(pods.to_string()).await;

    let discovery = ApiServerDiscovery::new(url, Duration::from_secs(5)).unwrap();
    let registry = ServiceRegistry::new(Resolver::new(Arc::new(discovery)), test_settings());

    let spec = ServiceSpec::new("svc1", 0, port)
        .with_selector(LabelSelector::new().with("tier", "front").with("app", "web"));
    let addr = registry.add(spec).await.unwrap();

    let request_line = requests.recv().await.unwrap();
    assert!(request_line.starts_with("GET /api/v1beta1/pods?labels=app%3Dweb%2Ctier%3Dfront "));

    let status = registry.get("svc1").await.unwrap().status();
    assert_eq!(status.backends, vec![format!("127.0.0.1:{}", port)]);

    assert_eq!(read_all(addr).await, "pod-1");
    assert_eq!(read_all(addr).await, "pod-1");

    registry.stop_all().await;
}

#[tokio::test]
async fn test_unreachable_discovery_fails_add() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", dead.local_addr().unwrap());
    drop(dead);

    let discovery = ApiServerDiscovery::new(url, Duration::from_secs(2)).unwrap();
    let registry = ServiceRegistry::new(Resolver::new(Arc::new(discovery)), test_settings());

    let err = registry.add(web_spec("svc1", 8080)).await.unwrap_err();
    assert!(err.to_string().contains("failed to start service svc1"));
    assert!(registry.is_empty().await);
}

// ============================================================================
// Management API
// ============================================================================

const TOKEN: &str = "test-token";

struct AdminHarness {
    addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start_admin(source: StaticDiscovery) -> AdminHarness {
    let registry = ServiceRegistry::new(Resolver::new(Arc::new(source)), test_settings());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = AdminServer::new(addr, Arc::clone(&registry), shutdown_rx, TOKEN.to_string());
    let handle = tokio::spawn(server.serve(listener));

    AdminHarness {
        addr,
        registry,
        shutdown_tx,
        handle,
    }
}

/// Send one HTTP/1.1 request and return (status, body)
async fn admin_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!("{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", method, path, addr);
    if let Some(token) = token {
        request.push_str(&format!("Authorization: Bearer {}\r\n", token));
    }
    let body = body.unwrap_or("");
    request.push_str(&format!(
        "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    ));
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn test_admin_health_and_version_need_no_auth() {
    let admin = start_admin(StaticDiscovery::new()).await;

    let (status, body) = admin_request(admin.addr, "GET", "/health", None, None).await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    let (status, body) = admin_request(admin.addr, "GET", "/version", None, None).await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["name"], "svcproxy");

    let _ = admin.shutdown_tx.send(true);
    admin.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_admin_requires_token() {
    let admin = start_admin(StaticDiscovery::new()).await;

    let (status, body) = admin_request(admin.addr, "GET", "/services", None, None).await;
    assert_eq!(status, 401);
    assert!(body.contains("UNAUTHORIZED"));

    let (status, _) = admin_request(admin.addr, "GET", "/services", Some("wrong"), None).await;
    assert_eq!(status, 401);

    let (status, _) = admin_request(admin.addr, "GET", "/services", Some(TOKEN), None).await;
    assert_eq!(status, 200);

    let _ = admin.shutdown_tx.send(true);
    admin.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_admin_service_lifecycle() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = backend.local_addr().unwrap().port();
    serve_tag(backend, "hi");

    let admin = start_admin(StaticDiscovery::new().with_endpoint(&[("app", "web")], "127.0.0.1", true)).await;
    let spec = format!(r#"{{"id":"svc1","port":0,"containerPort":{},"selector":{{"app":"web"}}}}"#, port);

    // Add
    let (status, body) = admin_request(admin.addr, "POST", "/services", Some(TOKEN), Some(&spec)).await;
    assert_eq!(status, 201, "body: {}", body);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["id"], "svc1");
    let proxy_addr: SocketAddr = json["address"].as_str().unwrap().parse().unwrap();
    assert_eq!(read_all(proxy_addr).await, "hi");

    // Duplicate
    let (status, body) = admin_request(admin.addr, "POST", "/services", Some(TOKEN), Some(&spec)).await;
    assert_eq!(status, 409);
    assert!(body.contains("ALREADY_EXISTS"));

    // List
    let (status, body) = admin_request(admin.addr, "GET", "/services", Some(TOKEN), None).await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["count"], 1);
    assert_eq!(json["services"][0]["id"], "svc1");
    assert_eq!(json["services"][0]["state"], "running");
    assert_eq!(json["services"][0]["backends"][0], format!("127.0.0.1:{}", port));

    // Refresh
    let (status, body) = admin_request(admin.addr, "POST", "/services/svc1/refresh", Some(TOKEN), None).await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["backends"], 1);

    let (status, _) = admin_request(admin.addr, "POST", "/services/missing/refresh", Some(TOKEN), None).await;
    assert_eq!(status, 404);

    // Remove
    let (status, _) = admin_request(admin.addr, "DELETE", "/services/svc1", Some(TOKEN), None).await;
    assert_eq!(status, 200);
    assert!(admin.registry.is_empty().await);
    assert!(TcpStream::connect(proxy_addr).await.is_err());

    let (status, body) = admin_request(admin.addr, "DELETE", "/services/svc1", Some(TOKEN), None).await;
    assert_eq!(status, 404);
    assert!(body.contains("NOT_FOUND"));

    let _ = admin.shutdown_tx.send(true);
    admin.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_admin_rejects_bad_specs() {
    let admin = start_admin(StaticDiscovery::new()).await;

    let (status, body) = admin_request(admin.addr, "POST", "/services", Some(TOKEN), Some("{not json")).await;
    assert_eq!(status, 400);
    assert!(body.contains("INVALID_SPEC"));

    let zero_port = r#"{"id":"svc1","port":0,"containerPort":0,"selector":{"app":"web"}}"#;
    let (status, _) = admin_request(admin.addr, "POST", "/services", Some(TOKEN), Some(zero_port)).await;
    assert_eq!(status, 400);

    let udp = r#"{"id":"svc2","port":0,"containerPort":53,"protocol":"udp","selector":{"app":"dns"}}"#;
    let (status, body) = admin_request(admin.addr, "POST", "/services", Some(TOKEN), Some(udp)).await;
    assert_eq!(status, 400);
    assert!(body.contains("UNSUPPORTED_PROTOCOL"));

    let no_selector = r#"{"id":"svc3","port":0,"containerPort":80}"#;
    let (status, body) = admin_request(admin.addr, "POST", "/services", Some(TOKEN), Some(no_selector)).await;
    assert_eq!(status, 400);
    assert!(body.contains("INVALID_SPEC"));

    assert!(admin.registry.is_empty().await);

    let (status, _) = admin_request(admin.addr, "GET", "/nope", Some(TOKEN), None).await;
    assert_eq!(status, 404);

    let _ = admin.shutdown_tx.send(true);
    admin.handle.await.unwrap().unwrap();
}
