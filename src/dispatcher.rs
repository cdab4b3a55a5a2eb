//! Host-header dispatcher
//!
//! Every request and every upgrade re-reads the route set through the injected
//! [`RouteSource`]; nothing is cached between requests, so a backend that
//! registers or exits is picked up by the very next request.

use crate::error::{
    html_error_response, text_error_response, DispatchError, DispatchErrorCode,
};
use crate::pages::not_found_page;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::route::{find_route, Route, RouteSource};
use anyhow::Context;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Header name for forwarded port
const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Default time allowed for a backend to send response headers
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest backend upgrade response head we are willing to buffer
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// State shared by every connection of one dispatcher
struct Shared {
    routes: Arc<dyn RouteSource>,
    pool: ConnectionPool,
    request_timeout: Duration,
}

/// Facts about the accepted client connection
#[derive(Debug, Clone, Copy)]
struct ConnInfo {
    client_addr: SocketAddr,
    local_port: u16,
    is_tls: bool,
}

/// The shared entrypoint that routes inbound traffic by Host header
pub struct Dispatcher {
    bind_addr: SocketAddr,
    routes: Arc<dyn RouteSource>,
    shutdown_rx: watch::Receiver<bool>,
    pool_config: PoolConfig,
    request_timeout: Duration,
    tls_acceptor: Option<TlsAcceptor>,
}

impl Dispatcher {
    pub fn new(
        bind_addr: SocketAddr,
        routes: Arc<dyn RouteSource>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            routes,
            shutdown_rx,
            pool_config: PoolConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tls_acceptor: None,
        }
    }

    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    /// Limit how long a backend may take to send response headers
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.bind_addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Dispatcher listening (HTTP/1.1 and HTTP/2)");

        let shared = Arc::new(Shared {
            routes: self.routes,
            pool: ConnectionPool::new(self.pool_config),
            request_timeout: self.request_timeout,
        });
        let tls_acceptor = self.tls_acceptor;
        let mut shutdown_rx = self.shutdown_rx;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let shared = Arc::clone(&shared);
                            let tls_acceptor = tls_acceptor.clone();
                            let conn = ConnInfo {
                                client_addr,
                                local_port: local_addr.port(),
                                is_tls: tls_acceptor.is_some(),
                            };

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, conn, shared).await {
                                                debug!(addr = %client_addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %client_addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, conn, shared).await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Dispatcher shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, conn: ConnInfo, shared: Arc<Shared>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared, conn).await }
    });

    // A service error (an unroutable upgrade) closes the connection without
    // writing a response.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    shared: Arc<Shared>,
    conn: ConnInfo,
) -> Result<Response<ProxyBody>, DispatchError> {
    let upgrade = is_upgrade_request(&req);

    let Some(hostname) = extract_hostname(&req) else {
        if upgrade {
            debug!(client = %conn.client_addr, "Rejecting upgrade without Host header");
            return Err(DispatchError::UpgradeRejected {
                host: String::new(),
            });
        }
        return Ok(text_error_response(DispatchErrorCode::MissingHostHeader));
    };

    let routes = current_routes(&shared.routes).await;
    let Some(route) = find_route(&routes, &hostname).cloned() else {
        if upgrade {
            debug!(hostname, "Rejecting upgrade for unknown host");
            return Err(DispatchError::UpgradeRejected { host: hostname });
        }
        debug!(hostname, active = routes.len(), "No route for host");
        return Ok(html_error_response(
            DispatchErrorCode::UnknownHost,
            not_found_page(&hostname, &routes),
        ));
    };

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    add_forwarded_headers(headers, &conn);

    debug!(hostname, port = route.port, method = %req.method(), uri = %req.uri(), request_id, "Dispatching request");

    if upgrade {
        return Ok(handle_upgrade(req, &route, request_id, shared.request_timeout).await);
    }

    let result = tokio::time::timeout(
        shared.request_timeout,
        shared.pool.send_request(req, route.port),
    )
    .await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            let code = if e.is_connection_refused() {
                DispatchErrorCode::ConnectionRefused
            } else {
                DispatchErrorCode::BackendUnreachable
            };
            error!(hostname, port = route.port, error = %e, request_id, "Failed to forward request");
            Ok(text_error_response(code))
        }
        Err(_) => {
            warn!(
                hostname,
                port = route.port,
                timeout_secs = shared.request_timeout.as_secs(),
                request_id,
                "Backend timed out"
            );
            Ok(text_error_response(DispatchErrorCode::BackendUnreachable))
        }
    }
}

/// Fetch the current routes on the blocking pool; the source may touch disk
async fn current_routes(source: &Arc<dyn RouteSource>) -> Vec<Route> {
    let source = Arc::clone(source);
    match tokio::task::spawn_blocking(move || source.routes()).await {
        Ok(routes) => routes,
        Err(e) => {
            error!(error = %e, "Route lookup task failed");
            Vec::new()
        }
    }
}

/// Host header (or HTTP/2 authority) without its port. `None` if absent or empty.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let hostname = strip_port(raw.trim());
    if hostname.is_empty() {
        return None;
    }
    Some(hostname.to_string())
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literal, e.g. [::1]:8080
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

/// Append the client to X-Forwarded-For and fill in the other X-Forwarded-*
/// headers when an earlier hop has not already set them.
fn add_forwarded_headers(headers: &mut HeaderMap, conn: &ConnInfo) {
    let client_ip = conn.client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        let proto = if conn.is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    }

    if !headers.contains_key(X_FORWARDED_PORT) {
        headers.insert(X_FORWARDED_PORT, HeaderValue::from(conn.local_port));
    }
}

/// Check if a request asks for a protocol upgrade (e.g. WebSocket)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Build the raw HTTP/1.1 upgrade request sent to the backend.
///
/// Headers go through byte for byte, including the original Host.
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();

    for (name, value) in req.headers() {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");

    request
}

/// Parse a response head: status line plus headers, up to the blank line
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read from the backend until the end of the response head.
///
/// Returns the head and any bytes the backend sent after it.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before completing upgrade response",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "backend upgrade response head too large",
            ));
        }
    }
}

fn upgrade_failure(err: &std::io::Error) -> Response<ProxyBody> {
    if err.kind() == std::io::ErrorKind::ConnectionRefused {
        text_error_response(DispatchErrorCode::ConnectionRefused)
    } else {
        text_error_response(DispatchErrorCode::BackendUnreachable)
    }
}

/// Forward an upgrade request over a raw backend socket.
///
/// Failures before the client has seen a 101 become 502 responses, including a
/// backend that does not finish its response head within `timeout`.
async fn handle_upgrade(
    req: Request<Incoming>,
    route: &Route,
    request_id: String,
    timeout: Duration,
) -> Response<ProxyBody> {
    let hostname = route.hostname.clone();
    let port = route.port;
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(hostname, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req);

    let handshake = async {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.write_all(&raw_request).await?;
        let (head, buffered) = read_response_head(&mut stream).await?;
        Ok::<_, std::io::Error>((stream, head, buffered))
    };

    let (backend_stream, head, backend_buffered) = match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            error!(hostname, port, error = %e, "Upgrade handshake with backend failed");
            return upgrade_failure(&e);
        }
        Err(_) => {
            warn!(
                hostname,
                port,
                timeout_secs = timeout.as_secs(),
                request_id,
                "Backend timed out during upgrade"
            );
            return text_error_response(DispatchErrorCode::BackendUnreachable);
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(hostname, "Failed to parse backend upgrade response");
        return text_error_response(DispatchErrorCode::BackendUnreachable);
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        // Framing is hyper's job on the client side
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = match response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()) {
        Ok(response) => response,
        Err(e) => {
            error!(hostname, error = %e, "Invalid upgrade response from backend");
            return text_error_response(DispatchErrorCode::BackendUnreachable);
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(hostname, status = %status, "Backend rejected upgrade request");
        return response;
    }

    info!(hostname, request_id, upgrade_type, "Upgrade successful");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, backend_buffered, &hostname, &request_id).await;
            }
            Err(e) => {
                error!(hostname, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}

/// Relay bytes between the upgraded client and the backend until either side closes
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    backend_buffered: Vec<u8>,
    hostname: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !backend_buffered.is_empty() {
        if let Err(e) = client_io.write_all(&backend_buffered).await {
            debug!(hostname, request_id, error = %e, "Client closed before buffered bytes were relayed");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                hostname,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(hostname, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
