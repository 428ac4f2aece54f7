//! Error types for the fwdgate-proxy crate.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the forward proxy.
///
/// Every variant maps to the HTTP status the client sees when the error
/// surfaces before any response bytes were committed (see [`ProxyError::status`]).
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy authentication required")]
    AuthRequired,

    #[error("Rate limit exceeded, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Host denied by allow-list: {host}")]
    HostDenied { host: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("Request header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("Timed out waiting for request header")]
    HeaderTimeout,

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("Upstream {host} timed out")]
    UpstreamTimeout { host: String },

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("Upstream I/O error: {0}")]
    UpstreamIo(#[source] std::io::Error),

    #[error("Client disconnected")]
    ClientGone,

    #[error("Connection limit reached ({0})")]
    Overloaded(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status used when this error is reported to the client.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            ProxyError::AuthRequired => 407,
            ProxyError::RateLimited { .. } => 429,
            ProxyError::HostDenied { .. } => 403,
            ProxyError::BadRequest(_) | ProxyError::HttpParse(_) => 400,
            ProxyError::HeaderTooLarge { .. } => 431,
            ProxyError::HeaderTimeout => 408,
            ProxyError::UpstreamConnect { .. }
            | ProxyError::UpstreamTimeout { .. }
            | ProxyError::UpstreamProtocol(_)
            | ProxyError::UpstreamIo(_) => 502,
            ProxyError::Overloaded(_) => 503,
            ProxyError::ClientGone
            | ProxyError::Bind { .. }
            | ProxyError::Config(_)
            | ProxyError::Internal(_)
            | ProxyError::Io(_) => 500,
        }
    }

    /// Short plain-text body for the synthesized error response.
    ///
    /// Upstream and internal details stay in the logs; the client only learns
    /// what it needs to fix its request.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::AuthRequired => "Proxy Authentication Required".to_string(),
            ProxyError::RateLimited { .. } => "Too Many Requests".to_string(),
            ProxyError::HostDenied { host } => {
                format!("Forbidden: domain not allowed ({})", host)
            }
            ProxyError::BadRequest(msg) => format!("Bad Request: {}", msg),
            ProxyError::HttpParse(_) => "Bad Request: malformed request".to_string(),
            ProxyError::HeaderTooLarge { .. } => "Request Header Fields Too Large".to_string(),
            ProxyError::HeaderTimeout => "Request Timeout".to_string(),
            ProxyError::UpstreamConnect { .. }
            | ProxyError::UpstreamTimeout { .. }
            | ProxyError::UpstreamProtocol(_)
            | ProxyError::UpstreamIo(_) => "Bad Gateway".to_string(),
            ProxyError::Overloaded(_) => "Service Unavailable".to_string(),
            _ => "Internal Server Error".to_string(),
        }
    }

    /// Whether the error was caused by the admission checks (auth, rate, domain).
    #[must_use]
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            ProxyError::AuthRequired
                | ProxyError::RateLimited { .. }
                | ProxyError::HostDenied { .. }
        )
    }

    /// Whether the error came from talking to the upstream.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamConnect { .. }
                | ProxyError::UpstreamTimeout { .. }
                | ProxyError::UpstreamProtocol(_)
                | ProxyError::UpstreamIo(_)
        )
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
