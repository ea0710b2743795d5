//! Integration tests for relaygate

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use relaygate::admin::{handle_admin_request, AdminState};
use relaygate::backend::Backend;
use relaygate::config::Config;
use relaygate::healthcheck::{HealthCheckConfig, HealthChecker};
use relaygate::loadbalancer::{build_balancer, BackendObserver, LoadBalancer, Strategy};
use relaygate::pool::ServerPool;
use relaygate::proxy::{ProxyHandler, ProxyServer};
use relaygate::session::{SessionConfig, SessionManager, SESSION_COOKIE};
use relaygate::upstream::{UpstreamClient, UpstreamConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Headers seen by a mock backend, one entry per request
type Seen = Arc<Mutex<Vec<hyper::HeaderMap>>>;

/// Start a backend that answers every request with its own name
async fn start_mock_backend(name: &'static str) -> (String, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let recorded = Arc::clone(&recorded);
                    async move {
                        recorded.lock().push(req.headers().clone());
                        let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                        let mut response = Response::new(Full::new(Bytes::from(format!(
                            "{}:{}",
                            name,
                            body.len()
                        ))));
                        response
                            .headers_mut()
                            .insert("x-backend", hyper::header::HeaderValue::from_static(name));
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (format!("http://{}", addr), seen)
}

/// A URL nothing listens on
async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn client(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

fn build_handler(urls: &[String], strategy: Strategy) -> (Arc<dyn LoadBalancer>, ProxyHandler) {
    build_handler_with_timeout(urls, strategy, Duration::from_secs(5))
}

fn build_handler_with_timeout(
    urls: &[String],
    strategy: Strategy,
    request_timeout: Duration,
) -> (Arc<dyn LoadBalancer>, ProxyHandler) {
    let pool = Arc::new(ServerPool::with_backends(
        urls.iter().map(|url| Backend::new(url).unwrap()),
    ));
    let balancer = build_balancer(strategy, pool);
    let upstream = Arc::new(UpstreamClient::new(UpstreamConfig {
        request_timeout,
        ..UpstreamConfig::default()
    }));
    let handler = ProxyHandler::new(Arc::clone(&balancer), upstream);
    (balancer, handler)
}

fn get(path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(path)
        .header("host", "app.example.com")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn body_string<B>(response: Response<B>) -> String
where
    B: hyper::body::Body,
    B::Error: std::fmt::Debug,
{
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let (a, _) = start_mock_backend("a").await;
    let (b, _) = start_mock_backend("b").await;
    let (c, _) = start_mock_backend("c").await;
    let (_balancer, handler) = build_handler(&[a, b, c], Strategy::RoundRobin);

    let mut served = Vec::new();
    for i in 0..6 {
        let response = handler.serve(get("/"), client(1000 + i), false).await;
        assert_eq!(response.status(), StatusCode::OK);
        served.push(body_string(response).await);
    }

    assert_eq!(served, vec!["a:0", "b:0", "c:0", "a:0", "b:0", "c:0"]);
}

#[tokio::test]
async fn test_forwarded_headers_reach_backend() {
    let (a, seen) = start_mock_backend("a").await;
    let (_balancer, handler) = build_handler(&[a.clone()], Strategy::RoundRobin);

    let request = Request::builder()
        .method("POST")
        .uri("/submit?x=1")
        .header("host", "app.example.com")
        .header("connection", "keep-alive")
        .header("x-request-id", "req-42")
        .body(Full::new(Bytes::from_static(b"hello")))
        .unwrap();

    let response = handler.serve(request, client(5000), false).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-served-by").unwrap(), a.as_str());
    assert_eq!(body_string(response).await, "a:5");

    let headers = seen.lock()[0].clone();
    assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.1");
    assert_eq!(headers.get("x-forwarded-host").unwrap(), "app.example.com");
    assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
    assert_eq!(headers.get("x-request-id").unwrap(), "req-42");
    assert!(headers.get("x-proxy-server").is_some());
    assert!(headers.get("keep-alive").is_none());
}

#[tokio::test]
async fn test_failover_to_live_backend() {
    let dead = refused_url().await;
    let (live, _) = start_mock_backend("live").await;
    let (balancer, handler) = build_handler(&[dead.clone(), live], Strategy::RoundRobin);

    for i in 0..4 {
        let response = handler.serve(get("/"), client(2000 + i), false).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "live:0");
    }

    let dead_backend = balancer.pool().get_by_url(&dead).unwrap();
    assert!(!dead_backend.is_alive());
    assert_eq!(balancer.pool().count_alive(), 1);
    for backend in balancer.pool().get_all() {
        assert_eq!(backend.current_connections(), 0);
    }
}

/// A backend that announces a 10-byte body, sends 2 bytes and then stalls
async fn start_stalling_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhi")
                    .await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    format!("http://{}", addr)
}

#[tokio::test]
async fn test_stalled_response_body_is_bounded() {
    let stalling = start_stalling_backend().await;
    let (balancer, handler) =
        build_handler_with_timeout(&[stalling.clone()], Strategy::RoundRobin, Duration::from_secs(1));

    let response = handler.serve(get("/download"), client(6000), false).await;
    assert_eq!(response.status(), StatusCode::OK);

    let collected = tokio::time::timeout(Duration::from_secs(4), response.into_body().collect())
        .await
        .expect("response body should end at the request timeout");
    assert!(collected.is_err());

    let backend = balancer.pool().get_by_url(&stalling).unwrap();
    assert_eq!(backend.current_connections(), 0);
}

#[tokio::test]
async fn test_connection_counter_tracks_response_lifetime() {
    let (a, _) = start_mock_backend("a").await;
    let (balancer, handler) = build_handler(&[a.clone()], Strategy::RoundRobin);
    let backend = balancer.pool().get_by_url(&a).unwrap();
    assert_eq!(backend.current_connections(), 0);

    let response = handler.serve(get("/"), client(6100), false).await;
    assert_eq!(response.status(), StatusCode::OK);
    // Headers are back but the body is still held: one request in flight
    assert_eq!(backend.current_connections(), 1);

    assert_eq!(body_string(response).await, "a:0");
    assert_eq!(backend.current_connections(), 0);

    let response = handler.serve(get("/"), client(6101), false).await;
    assert_eq!(backend.current_connections(), 1);
    drop(response);
    assert_eq!(backend.current_connections(), 0);
}

#[tokio::test]
async fn test_no_backend_available() {
    let (_balancer, handler) = build_handler(&[], Strategy::WeightedRoundRobin);

    let response = handler.serve(get("/"), client(1), false).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get("x-proxy-error").unwrap(), "NO_BACKEND_AVAILABLE");

    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["backends_status"]["total"], 0);
    assert_eq!(json["backends_status"]["alive"], 0);
}

#[tokio::test]
async fn test_sticky_cookie_pins_backend() {
    let (a, _) = start_mock_backend("a").await;
    let (b, _) = start_mock_backend("b").await;
    let (balancer, handler) = build_handler(&[a, b], Strategy::RoundRobin);
    let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
    balancer.add_observer(Arc::clone(&sessions) as Arc<dyn BackendObserver>);
    let handler = handler.with_sessions(Arc::clone(&sessions));

    let first = handler.serve(get("/"), client(3000), false).await;
    let cookie = first
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(cookie.starts_with(&format!("{}=", SESSION_COOKIE)));
    let pinned = body_string(first).await;

    let pair = cookie.split(';').next().unwrap().to_string();
    for i in 0..4u16 {
        // Different peer IP each time so only the cookie can pin the backend
        let request = Request::builder()
            .uri("/")
            .header("cookie", pair.as_str())
            .body(Full::new(Bytes::new()))
            .unwrap();
        let peer = SocketAddr::from(([10, 0, 1, i as u8 + 1], 3100));
        let response = handler.serve(request, peer, false).await;
        assert!(response.headers().get("set-cookie").is_none());
        assert_eq!(body_string(response).await, pinned);
    }

    assert!(sessions.get_stats().total_sessions >= 1);
}

#[tokio::test]
async fn test_sticky_header_carries_session_token() {
    let (a, seen) = start_mock_backend("a").await;
    let (balancer, handler) = build_handler(&[a], Strategy::RoundRobin);
    let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
    balancer.add_observer(Arc::clone(&sessions) as Arc<dyn BackendObserver>);
    let handler = handler.with_sessions(sessions);

    // Same client IP twice, no cookie: the second request sticks by IP
    let peer = SocketAddr::from(([203, 0, 113, 7], 40000));
    let first = handler.serve(get("/"), peer, false).await;
    let cookie = first
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let token = cookie
        .split(';')
        .next()
        .and_then(|pair| pair.strip_prefix(&format!("{}=", SESSION_COOKIE)))
        .unwrap()
        .to_string();
    body_string(first).await;

    let second = handler.serve(get("/"), peer, false).await;
    assert!(second.headers().get("set-cookie").is_none());
    body_string(second).await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    for headers in seen.iter() {
        assert_eq!(headers.get("x-sticky-session-id").unwrap(), token.as_str());
    }
}

#[tokio::test]
async fn test_health_checker_marks_backend_states() {
    let (live, _) = start_mock_backend("live").await;
    let dead = refused_url().await;
    let pool = Arc::new(ServerPool::with_backends(vec![
        Backend::new(&live).unwrap(),
        Backend::new(&dead).unwrap(),
    ]));
    let balancer = build_balancer(Strategy::RoundRobin, Arc::clone(&pool));
    let checker = HealthChecker::new(
        Arc::clone(&balancer),
        Arc::new(UpstreamClient::default()),
        HealthCheckConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_millis(500),
            path: "/health".to_string(),
        },
    );

    checker.check_all_backends().await;

    assert!(pool.get_by_url(&live).unwrap().is_alive());
    assert!(!pool.get_by_url(&dead).unwrap().is_alive());
    let stats = checker.get_health_check_stats();
    assert_eq!(stats.total_backends, 2);
    assert_eq!(stats.alive_backends, 1);
}

fn admin_state(balancer: Arc<dyn LoadBalancer>, token: Option<&str>) -> Arc<AdminState> {
    let mut config = Config::default();
    config.server.admin_token = token.map(String::from);
    let health_checker = Arc::new(HealthChecker::new(
        Arc::clone(&balancer),
        Arc::new(UpstreamClient::default()),
        HealthCheckConfig::default(),
    ));
    Arc::new(AdminState {
        balancer,
        health_checker,
        sessions: None,
        config: Arc::new(config),
    })
}

fn admin_request(method: &str, path: &str, body: &str, token: Option<&str>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
}

#[tokio::test]
async fn test_admin_backend_lifecycle_routes_traffic() {
    let (a, _) = start_mock_backend("a").await;
    let (b, _) = start_mock_backend("b").await;
    let (balancer, handler) = build_handler(&[a.clone()], Strategy::RoundRobin);
    let state = admin_state(Arc::clone(&balancer), Some("secret"));

    // Mutations need the token
    let body = format!(r#"{{"url": "{}"}}"#, b);
    let response = handle_admin_request(admin_request("POST", "/backends", &body, None), Arc::clone(&state)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response =
        handle_admin_request(admin_request("POST", "/backends", &body, Some("secret")), Arc::clone(&state)).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response =
        handle_admin_request(admin_request("POST", "/backends", &body, Some("secret")), Arc::clone(&state)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let mut served = Vec::new();
    for i in 0..4 {
        served.push(body_string(handler.serve(get("/"), client(4000 + i), false).await).await);
    }
    assert!(served.contains(&"a:0".to_string()));
    assert!(served.contains(&"b:0".to_string()));

    let body = format!(r#"{{"url": "{}"}}"#, a);
    let response =
        handle_admin_request(admin_request("DELETE", "/backends", &body, Some("secret")), Arc::clone(&state)).await;
    assert_eq!(response.status(), StatusCode::OK);

    for i in 0..3 {
        assert_eq!(body_string(handler.serve(get("/"), client(4100 + i), false).await).await, "b:0");
    }

    let response = handle_admin_request(admin_request("GET", "/status", "", None), Arc::clone(&state)).await;
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["total_backends"], 1);
    assert_eq!(json["strategy"], "round-robin");
    assert_eq!(json["backends"][0]["url"], b.as_str());

    let response = handle_admin_request(admin_request("GET", "/config", "", None), Arc::clone(&state)).await;
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["backends"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_admin_rejects_unknown_routes_and_methods() {
    let balancer = build_balancer(Strategy::RoundRobin, Arc::new(ServerPool::new()));
    let state = admin_state(balancer, None);

    let response = handle_admin_request(admin_request("GET", "/nope", "", None), Arc::clone(&state)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = handle_admin_request(admin_request("PUT", "/status", "", None), Arc::clone(&state)).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = handle_admin_request(admin_request("GET", "/sessions", "", None), Arc::clone(&state)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers().get("x-proxy-error").unwrap(), "SESSIONS_DISABLED");

    let response =
        handle_admin_request(admin_request("DELETE", "/backends", r#"{"url": "http://x:1"}"#, None), state).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_proxy_server_end_to_end() {
    let (a, _) = start_mock_backend("a").await;
    let (_balancer, handler) = build_handler(&[a], Strategy::RoundRobin);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(addr, Arc::new(handler), shutdown_rx);
    let server_handle = tokio::spawn(server.serve(listener));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: app.example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"), "unexpected response: {}", text);
    assert!(text.to_ascii_lowercase().contains("x-backend: a"));
    assert!(text.ends_with("a:0"));

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_config_file_drives_pool() {
    let (a, _) = start_mock_backend("a").await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relaygate.toml");
    std::fs::write(
        &path,
        format!(
            r#"
backends = ["{a}", "not a url", "{a}/"]

[balancer]
strategy = "weighted"

[backend_weights]
"{a}" = 4
"#
        ),
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.balancer.strategy(), Strategy::WeightedRoundRobin);

    let entries = config.backend_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].weight(), 4);

    let balancer = build_balancer(config.balancer.strategy(), Arc::new(ServerPool::with_backends(entries)));
    let status = balancer.get_status();
    assert_eq!(status.total_weight, Some(4));
}
