//! Audit logging for proxy requests.
//!
//! Logs every admission decision and tunnel lifecycle event with structured
//! fields via `tracing`. Credentials and request bodies are never logged.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Proxy mode for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// CONNECT tunnel
    Connect,
    /// Plaintext HTTP relay
    Http,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Connect => write!(f, "connect"),
            ProxyMode::Http => write!(f, "http"),
        }
    }
}

/// Log an admitted request.
pub fn log_allowed(mode: ProxyMode, client: SocketAddr, host: &str, port: u16, method: &str) {
    info!(
        target: "fwdgate_proxy::audit",
        mode = %mode,
        client = %client.ip(),
        host = host,
        port = port,
        method = method,
        decision = "allow",
        "proxy request allowed"
    );
}

/// Log a rejected request.
pub fn log_denied(mode: ProxyMode, client: SocketAddr, target: &str, status: u16, reason: &str) {
    info!(
        target: "fwdgate_proxy::audit",
        mode = %mode,
        client = %client.ip(),
        target = target,
        status = status,
        decision = "deny",
        reason = reason,
        "proxy request denied"
    );
}

/// Log a tunnel becoming established.
pub fn log_tunnel_open(client: SocketAddr, host: &str, port: u16) {
    info!(
        target: "fwdgate_proxy::audit",
        mode = "connect",
        client = %client.ip(),
        host = host,
        port = port,
        "tunnel opened"
    );
}

/// Log a tunnel teardown with transfer totals.
pub fn log_tunnel_close(
    host: &str,
    port: u16,
    bytes_up: u64,
    bytes_down: u64,
    elapsed: Duration,
    outcome: &str,
) {
    info!(
        target: "fwdgate_proxy::audit",
        mode = "connect",
        host = host,
        port = port,
        bytes_up = bytes_up,
        bytes_down = bytes_down,
        duration_ms = elapsed.as_millis() as u64,
        outcome = outcome,
        "tunnel closed"
    );
}

/// Log a relayed response.
pub fn log_relay_response(method: &str, host: &str, path: &str, status: u16, elapsed: Duration) {
    info!(
        target: "fwdgate_proxy::audit",
        mode = "http",
        method = method,
        host = host,
        path = path,
        status = status,
        duration_ms = elapsed.as_millis() as u64,
        "relay response"
    );
}
