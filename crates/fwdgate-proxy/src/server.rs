//! Proxy server: TCP listener, admission, dispatch, and lifecycle.
//!
//! The server binds to `config.bind_addr:config.bind_port`, accepts TCP
//! connections, reads one request head per connection and runs admission:
//!
//! auth -> rate limit -> target parse -> domain allow-list
//!
//! Admitted requests are dispatched on their [`ProxyTarget`]:
//!
//! CONNECT method -> [`connect`] tunnel
//! Other methods  -> [`relay`] plaintext HTTP relay
//!
//! `GET /health` bypasses admission entirely.

use crate::audit::{self, ProxyMode};
use crate::auth::AuthGate;
use crate::client::ClientConn;
use crate::config::{deadline_after, ProxyConfig};
use crate::connect;
use crate::error::{ProxyError, Result};
use crate::filter::DomainMatcher;
use crate::health::HealthReport;
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::relay::{self, HttpTarget, RelayTimeouts};
use crate::request::{read_request, InboundRequest};
use crate::upstream::UpstreamConnector;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Poll interval while waiting for in-flight connections to finish.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Where an admitted request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyTarget {
    /// CONNECT tunnel to `host:port`
    Tunnel { host: String, port: u16 },
    /// Plaintext relay
    Http(HttpTarget),
}

impl ProxyTarget {
    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            ProxyTarget::Tunnel { host, .. } => host,
            ProxyTarget::Http(target) => &target.host,
        }
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            ProxyTarget::Tunnel { port, .. } => *port,
            ProxyTarget::Http(target) => target.port,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ProxyMode {
        match self {
            ProxyTarget::Tunnel { .. } => ProxyMode::Connect,
            ProxyTarget::Http(_) => ProxyMode::Http,
        }
    }
}

/// Handle returned when the proxy server starts.
///
/// Call [`ProxyHandle::shutdown`] (or drop the handle) to stop accepting,
/// then [`ProxyHandle::drain`] to wait for in-flight connections.
pub struct ProxyHandle {
    /// The address the proxy is listening on
    pub addr: SocketAddr,
    /// The actual port the proxy is listening on
    pub port: u16,
    state: Arc<ProxyState>,
    /// Send `true` to trigger graceful shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyHandle {
    /// Stop accepting new connections. In-flight connections keep running.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Connections currently being served.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.state.active_connections.load(Ordering::Relaxed)
    }

    /// Wait up to `grace` for in-flight connections to finish.
    ///
    /// Returns `true` if every connection finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = deadline_after(grace);
        loop {
            let active = self.active_connections();
            if active == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Drain grace period elapsed with {} connections open", active);
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

/// Shared state for the proxy server.
struct ProxyState {
    matcher: DomainMatcher,
    auth: AuthGate,
    limiter: RateLimiter,
    connector: UpstreamConnector,
    config: ProxyConfig,
    started_at: Instant,
    /// Active connection count for connection limiting.
    active_connections: AtomicUsize,
}

/// Decrements the connection count when a connection task ends.
struct ConnectionGuard(Arc<ProxyState>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Start the proxy server.
///
/// Validates `config`, binds to `config.bind_addr:config.bind_port`
/// (port 0 = OS-assigned) and begins accepting connections on the current
/// runtime.
pub async fn start(config: ProxyConfig) -> Result<ProxyHandle> {
    config.validate()?;

    let matcher = DomainMatcher::new(&config.allowed_domains);
    let auth = AuthGate::new(config.auth_password.as_deref());
    let limiter = RateLimiter::from_config(&config.rate_limit);
    let connector = UpstreamConnector::new(&config.connect_overrides, config.request_timeout())?
        .with_dns_order(config.dns_order);

    let bind_addr = SocketAddr::new(config.bind_addr, config.bind_port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;
    let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
        addr: bind_addr.to_string(),
        source: e,
    })?;

    info!(
        "Proxy server listening on {} ({} allowed domains, auth {})",
        local_addr,
        matcher.allowed_count(),
        if auth.is_enabled() { "enabled" } else { "disabled" }
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(ProxyState {
        matcher,
        auth,
        limiter,
        connector,
        config,
        started_at: Instant::now(),
        active_connections: AtomicUsize::new(0),
    });

    // The caller must keep this runtime driven for the proxy to serve.
    tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown_rx));

    Ok(ProxyHandle {
        addr: local_addr,
        port: local_addr.port(),
        state,
        shutdown_tx,
    })
}

/// Accept loop: listen for connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        // Connection limit enforcement
                        let max = state.config.max_connections;
                        let current = state.active_connections.load(Ordering::Relaxed);
                        if max > 0 && current >= max {
                            warn!(
                                "Connection limit reached ({}/{}), rejecting {}",
                                current, max, addr
                            );
                            tokio::spawn(reject_overloaded(stream, addr, max));
                            continue;
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);

                        debug!("Accepted connection from {}", addr);
                        let guard = ConnectionGuard(Arc::clone(&state));
                        tokio::spawn(async move {
                            handle_connection(stream, addr, &guard.0).await;
                            drop(guard);
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Proxy server shutting down");
                    return;
                }
            }
        }
    }
}

async fn reject_overloaded(stream: TcpStream, addr: SocketAddr, max: usize) {
    let mut conn = ClientConn::new(stream, addr);
    if let Err(e) = conn.send_error(&ProxyError::Overloaded(max)).await {
        debug!("Failed to send 503 to {}: {}", addr, e);
    }
}

/// Handle a single client connection.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: &ProxyState) {
    let mut conn = ClientConn::new(stream, peer);
    if let Err(e) = serve(&mut conn, state).await {
        report_failure(&mut conn, &e).await;
    }
}

/// Read one request, admit it and run it to completion.
async fn serve(conn: &mut ClientConn, state: &ProxyState) -> Result<()> {
    let read = tokio::time::timeout(
        state.config.header_timeout(),
        read_request(&mut conn.stream, conn.peer),
    )
    .await
    .map_err(|_| ProxyError::HeaderTimeout)?;
    let req = match read {
        Ok(Some(req)) => req,
        // Client disconnected
        Ok(None) => return Ok(()),
        Err(ProxyError::Io(e)) => {
            debug!("Read error from {}: {}", conn.peer, e);
            return Err(ProxyError::ClientGone);
        }
        Err(e) => return Err(e),
    };
    debug!("{} {} from {}", req.method, req.target, conn.peer);

    if req.is_health_check() {
        return serve_health(conn, state).await;
    }

    let target = admit(&req, state)?;
    match target {
        ProxyTarget::Tunnel { host, port } => {
            connect::handle_connect(
                conn,
                &host,
                port,
                &req.pre_read,
                &state.connector,
                state.config.request_timeout(),
            )
            .await
        }
        ProxyTarget::Http(target) => {
            let timeouts = RelayTimeouts {
                request: state.config.request_timeout(),
                idle: state.config.request_timeout(),
            };
            relay::handle_http(conn, &req, &target, &state.connector, timeouts).await
        }
    }
}

/// Run the admission checks in order, short-circuiting on the first failure.
fn admit(req: &InboundRequest, state: &ProxyState) -> Result<ProxyTarget> {
    let mode = if req.is_connect() {
        ProxyMode::Connect
    } else {
        ProxyMode::Http
    };
    let deny = |e: ProxyError| {
        audit::log_denied(mode, req.client_addr, &req.target, e.status(), &e.to_string());
        e
    };

    if !state.auth.check(&req.headers) {
        return Err(deny(ProxyError::AuthRequired));
    }

    if let RateDecision::Exceeded { retry_after } = state.limiter.consume(req.client_addr.ip()) {
        return Err(deny(ProxyError::RateLimited { retry_after }));
    }

    let target = if req.is_connect() {
        let (host, port) = connect::parse_authority(&req.target).map_err(deny)?;
        ProxyTarget::Tunnel { host, port }
    } else {
        ProxyTarget::Http(relay::parse_target(req).map_err(deny)?)
    };

    if !state.matcher.is_allowed(target.host()) {
        return Err(deny(ProxyError::HostDenied {
            host: target.host().to_string(),
        }));
    }

    audit::log_allowed(
        target.mode(),
        req.client_addr,
        target.host(),
        target.port(),
        &req.method,
    );
    Ok(target)
}

async fn serve_health(conn: &mut ClientConn, state: &ProxyState) -> Result<()> {
    let report = HealthReport::new(
        state.started_at,
        state.matcher.allowed_count(),
        state.auth.is_enabled(),
    );
    let body = report
        .to_json()
        .map_err(|e| ProxyError::Internal(format!("health report serialization: {}", e)))?;
    conn.send_response(200, "application/json", &[], &body).await
}

/// Turn a failure into a response if nothing has been sent yet; otherwise
/// the connection is simply dropped.
async fn report_failure(conn: &mut ClientConn, err: &ProxyError) {
    match err {
        ProxyError::ClientGone => {
            debug!("Client {} disconnected", conn.peer);
            return;
        }
        ProxyError::Internal(_) | ProxyError::Config(_) | ProxyError::Bind { .. } => {
            error!("Unexpected failure serving {}: {}", conn.peer, err);
        }
        e if conn.committed => {
            debug!("Closing connection to {} after error: {}", conn.peer, e);
        }
        e if e.is_upstream() => warn!("Upstream failure for {}: {}", conn.peer, e),
        e => debug!("Rejecting request from {}: {}", conn.peer, e),
    }

    if conn.committed {
        return;
    }
    if let Err(e) = conn.send_error(err).await {
        debug!("Failed to send error response to {}: {}", conn.peer, e);
    }
}
