//! Proxy configuration types.
//!
//! Defines the configuration for the proxy server: listen address, the
//! domain allow-list, the optional shared secret, rate-limit parameters and
//! timeouts. Configuration is read once at startup.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Allow-list used when none is configured.
pub const DEFAULT_ALLOWED_DOMAINS: &[&str] = &[
    "openai.com",
    "*.openai.com",
    "chatgpt.com",
    "*.chatgpt.com",
    "oaistatic.com",
    "*.oaistatic.com",
    "oaiusercontent.com",
    "*.oaiusercontent.com",
    "azureedge.net",
    "*.azureedge.net",
    "auth0.com",
    "*.auth0.com",
    "statsig.com",
    "*.statsig.com",
    "statsigapi.net",
    "*.statsigapi.net",
    "intercom.io",
    "*.intercom.io",
    "intercomcdn.com",
    "*.intercomcdn.com",
    "gravatar.com",
    "*.gravatar.com",
    "fonts.googleapis.com",
    "fonts.gstatic.com",
    "claude.ai",
    "*.claude.ai",
    "anthropic.com",
    "*.anthropic.com",
    "coze.com",
    "*.coze.com",
    "google.com",
    "*.google.com",
    "googleapis.com",
    "*.googleapis.com",
    "gstatic.com",
    "*.gstatic.com",
    "googleusercontent.com",
    "*.googleusercontent.com",
    "x.ai",
    "*.x.ai",
    "meta.ai",
    "*.meta.ai",
    "grok.com",
    "*.grok.com",
];

/// Configuration for the proxy server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Bind port (0 = OS-assigned ephemeral port)
    #[serde(default)]
    pub bind_port: u16,

    /// Allowed destination domains (exact names and `*.` wildcards).
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,

    /// Shared secret expected as the password of `Proxy-Authorization: Basic`.
    /// `None` disables proxy authentication.
    #[serde(default)]
    pub auth_password: Option<String>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Upstream request timeout; also the idle timeout of CONNECT tunnels
    /// and relayed response bodies.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long an idle client may take to send its request head.
    #[serde(default = "default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,

    /// Maximum concurrent connections (0 = unlimited).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Static `host:port` -> socket address overrides consulted before DNS.
    #[serde(default)]
    pub connect_overrides: HashMap<String, SocketAddr>,

    /// Order in which resolved upstream addresses are tried.
    #[serde(default)]
    pub dns_order: DnsOrder,
}

/// Order in which resolved upstream addresses are tried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsOrder {
    /// As returned by the system resolver
    #[default]
    Verbatim,
    /// IPv4 addresses before IPv6, resolver order kept within each family
    Ipv4First,
}

impl FromStr for DnsOrder {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "verbatim" => Ok(DnsOrder::Verbatim),
            "ipv4first" => Ok(DnsOrder::Ipv4First),
            other => Err(ProxyError::Config(format!(
                "unknown DNS result order '{}' (expected ipv4first or verbatim)",
                other
            ))),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: 0,
            allowed_domains: default_allowed_domains(),
            auth_password: None,
            rate_limit: RateLimitConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            keep_alive_timeout_ms: default_keep_alive_timeout_ms(),
            max_connections: default_max_connections(),
            connect_overrides: HashMap::new(),
            dns_order: DnsOrder::default(),
        }
    }
}

impl ProxyConfig {
    /// Load a JSON-serialized configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| ProxyError::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    /// Reject configurations the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.allowed_domains.iter().any(|d| !d.trim().is_empty()) {
            return Err(ProxyError::Config(
                "allowed domain list must not be empty".to_string(),
            ));
        }
        if self.rate_limit.window_ms == 0 || self.rate_limit.max_requests == 0 {
            return Err(ProxyError::Config(
                "rate limit window and max requests must be non-zero".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 || self.keep_alive_timeout_ms == 0 {
            return Err(ProxyError::Config(
                "timeouts must be non-zero".to_string(),
            ));
        }
        if matches!(self.auth_password.as_deref(), Some("")) {
            return Err(ProxyError::Config(
                "auth password must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Time allowed for reading a request head: the keep-alive timeout plus
    /// one second of slack.
    #[must_use]
    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms.saturating_add(1000))
    }

    #[must_use]
    pub fn auth_enabled(&self) -> bool {
        self.auth_password.is_some()
    }
}

/// Per-client rate limit parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in milliseconds (rounded down to whole seconds, min 1s).
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Requests allowed per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// How long a client stays blocked after exhausting its budget.
    #[serde(default = "default_block_secs")]
    pub block_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            block_secs: default_block_secs(),
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs((self.window_ms / 1000).max(1))
    }

    #[must_use]
    pub fn block(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }
}

/// Stand-in for "never" when a configured duration overflows the clock.
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `start + span`, saturating instead of panicking on overflow.
pub(crate) fn instant_after(start: Instant, span: Duration) -> Instant {
    start
        .checked_add(span)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Deadline `span` from now on the tokio clock, saturating like [`instant_after`].
pub(crate) fn deadline_after(span: Duration) -> tokio::time::Instant {
    tokio::time::Instant::from_std(instant_after(Instant::now(), span))
}

/// Split a comma-separated domain list, dropping blank entries.
#[must_use]
pub fn parse_domain_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

fn default_allowed_domains() -> Vec<String> {
    DEFAULT_ALLOWED_DOMAINS
        .iter()
        .map(|d| (*d).to_string())
        .collect()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_keep_alive_timeout_ms() -> u64 {
    5_000
}

fn default_max_connections() -> usize {
    1000
}

fn default_window_ms() -> u64 {
    900_000
}

fn default_max_requests() -> u32 {
    1000
}

fn default_block_secs() -> u64 {
    60
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_addr, IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        assert_eq!(config.bind_port, 0);
        assert!(config.allowed_domains.contains(&"*.chatgpt.com".to_string()));
        assert!(config.auth_password.is_none());
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.header_timeout(), Duration::from_secs(6));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = ProxyConfig {
            allowed_domains: vec!["api.openai.com".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: ProxyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.allowed_domains, vec!["api.openai.com"]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{"bind_port": 10800, "rate_limit": {"max_requests": 5}}"#)
                .unwrap();
        assert_eq!(config.bind_port, 10800);
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.block_secs, 60);
        assert_eq!(config.max_connections, 1000);
    }

    #[test]
    fn test_validate_rejects_empty_allow_list() {
        let config = ProxyConfig {
            allowed_domains: vec![" ".to_string()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let mut config = ProxyConfig::default();
        config.rate_limit.max_requests = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_password() {
        let config = ProxyConfig {
            auth_password: Some(String::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_window_rounds_to_seconds() {
        let rl = RateLimitConfig {
            window_ms: 1500,
            ..Default::default()
        };
        assert_eq!(rl.window(), Duration::from_secs(1));
        let rl = RateLimitConfig {
            window_ms: 10,
            ..Default::default()
        };
        assert_eq!(rl.window(), Duration::from_secs(1));
    }

    #[test]
    fn test_instant_after_saturates() {
        let now = Instant::now();
        assert_eq!(instant_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert_eq!(instant_after(now, Duration::MAX), now + FAR_FUTURE);
        assert!(deadline_after(Duration::from_secs(u64::MAX)) > tokio::time::Instant::now());
    }

    #[test]
    fn test_dns_order() {
        assert_eq!("ipv4first".parse::<DnsOrder>().unwrap(), DnsOrder::Ipv4First);
        assert_eq!(" Verbatim ".parse::<DnsOrder>().unwrap(), DnsOrder::Verbatim);
        assert!("ipv6first".parse::<DnsOrder>().is_err());

        let config: ProxyConfig = serde_json::from_str(r#"{"dns_order": "ipv4first"}"#).unwrap();
        assert_eq!(config.dns_order, DnsOrder::Ipv4First);
        assert_eq!(ProxyConfig::default().dns_order, DnsOrder::Verbatim);
    }

    #[test]
    fn test_parse_domain_list() {
        let list = parse_domain_list(" openai.com, *.openai.com,, ");
        assert_eq!(list, vec!["openai.com", "*.openai.com"]);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"allowed_domains": ["claude.ai"], "auth_password": "s3cret"}}"#
        )
        .unwrap();
        let config = ProxyConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.allowed_domains, vec!["claude.ai"]);
        assert!(config.auth_enabled());
    }

    #[test]
    fn test_from_json_file_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(ProxyConfig::from_json_file(file.path()).is_err());
    }
}
