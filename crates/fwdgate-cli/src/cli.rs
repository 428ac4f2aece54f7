//! CLI argument definitions for fwdgate
//!
//! Every flag falls back to an environment variable so the proxy can be
//! configured entirely from a container environment.

use clap::Parser;
use fwdgate_proxy::config::{parse_domain_list, DEFAULT_ALLOWED_DOMAINS};
use fwdgate_proxy::{DnsOrder, ProxyConfig, RateLimitConfig, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// fwdgate - allow-listed forward proxy
///
/// Relays plaintext HTTP and tunnels HTTPS (CONNECT) to an allow-list of
/// destination domains, with optional proxy authentication and per-client
/// rate limiting.
#[derive(Parser, Debug)]
#[command(name = "fwdgate")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    # Listen on the default port with the built-in allow-list
    fwdgate

    # Restrict to two vendors and require a proxy password
    ALLOWED_DOMAINS='openai.com,*.openai.com' PROXY_PASSWORD=s3cret fwdgate

    # Pin a destination to a fixed address (like curl --connect-to)
    fwdgate --connect-to api.openai.com:443=10.0.0.5:443
")]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, short = 'p', env = "PORT", default_value_t = 10800)]
    pub port: u16,

    /// Comma-separated allow-list (exact names and `*.` wildcards)
    #[arg(long, env = "ALLOWED_DOMAINS", value_name = "DOMAINS")]
    pub allowed_domains: Option<String>,

    /// Require `Proxy-Authorization: Basic` with this password
    #[arg(long, env = "PROXY_PASSWORD", hide_env_values = true)]
    pub proxy_password: Option<String>,

    /// Upstream request and tunnel idle timeout in milliseconds
    #[arg(long = "timeout", env = "PROXY_TIMEOUT", default_value_t = 30_000, value_name = "MS")]
    pub timeout_ms: u64,

    /// Request-head read timeout in milliseconds (one second is added)
    #[arg(long = "keep-alive-timeout", env = "KEEP_ALIVE_TIMEOUT", default_value_t = 5_000, value_name = "MS")]
    pub keep_alive_timeout_ms: u64,

    /// Maximum concurrent client connections (0 = unlimited)
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 1000)]
    pub max_connections: usize,

    /// Rate-limit window in milliseconds
    #[arg(long = "rate-limit-window", env = "RATE_LIMIT_WINDOW_MS", default_value_t = 900_000, value_name = "MS")]
    pub rate_limit_window_ms: u64,

    /// Requests allowed per client per window
    #[arg(long = "rate-limit-max", env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = 1000)]
    pub rate_limit_max_requests: u32,

    /// Seconds a client stays blocked after exceeding its budget
    #[arg(long = "rate-limit-block", env = "RATE_LIMIT_BLOCK_SECS", default_value_t = 60, value_name = "SECS")]
    pub rate_limit_block_secs: u64,

    /// How long to wait for in-flight connections on shutdown, in milliseconds
    #[arg(long = "shutdown-grace", env = "SHUTDOWN_GRACE_MS", default_value_t = 5_000, value_name = "MS")]
    pub shutdown_grace_ms: u64,

    /// Order to try resolved upstream addresses in: ipv4first or verbatim
    #[arg(long, env = "DNS_RESULT_ORDER", default_value = "verbatim", value_name = "ORDER", value_parser = parse_dns_order)]
    pub dns_order: DnsOrder,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Connect to ADDR instead of resolving HOST:PORT (repeatable)
    #[arg(long = "connect-to", value_name = "HOST:PORT=ADDR", value_parser = parse_connect_to)]
    pub connect_to: Vec<(String, SocketAddr)>,

    /// Load the proxy configuration from a JSON file instead of flags
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Build the proxy configuration. A `--config` file replaces the
    /// individual flags; `--connect-to` entries are applied on top of either.
    pub fn to_config(&self) -> Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::from_json_file(path)?,
            None => self.flags_config(),
        };
        config
            .connect_overrides
            .extend(self.connect_to.iter().cloned());
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn flags_config(&self) -> ProxyConfig {
        let allowed_domains = match self.allowed_domains.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => parse_domain_list(raw),
            _ => DEFAULT_ALLOWED_DOMAINS
                .iter()
                .map(|d| (*d).to_string())
                .collect(),
        };
        // An empty password disables auth, as if it were unset
        let auth_password = self
            .proxy_password
            .clone()
            .filter(|p| !p.is_empty());

        ProxyConfig {
            bind_addr: self.host,
            bind_port: self.port,
            allowed_domains,
            auth_password,
            rate_limit: RateLimitConfig {
                window_ms: self.rate_limit_window_ms,
                max_requests: self.rate_limit_max_requests,
                block_secs: self.rate_limit_block_secs,
            },
            request_timeout_ms: self.timeout_ms,
            keep_alive_timeout_ms: self.keep_alive_timeout_ms,
            max_connections: self.max_connections,
            connect_overrides: HashMap::new(),
            dns_order: self.dns_order,
        }
    }
}

fn parse_dns_order(raw: &str) -> std::result::Result<DnsOrder, String> {
    raw.parse().map_err(|e: fwdgate_proxy::ProxyError| e.to_string())
}

/// Parse `HOST:PORT=ADDR`, e.g. `api.openai.com:443=127.0.0.1:8443`.
fn parse_connect_to(raw: &str) -> std::result::Result<(String, SocketAddr), String> {
    let (authority, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected HOST:PORT=ADDR, got '{}'", raw))?;
    let authority = authority.trim().to_lowercase();
    let port_ok = authority
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !port_ok {
        return Err(format!("'{}' is not HOST:PORT", authority));
    }
    let addr: SocketAddr = addr
        .trim()
        .parse()
        .map_err(|e| format!("invalid socket address '{}': {}", addr, e))?;
    Ok((authority, addr))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["fwdgate"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_build_config() {
        let cli = parse(&[
            "--host",
            "127.0.0.1",
            "--port",
            "18080",
            "--allowed-domains",
            "openai.com, *.openai.com",
            "--proxy-password",
            "s3cret",
            "--rate-limit-max",
            "5",
            "--timeout",
            "1000",
        ]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.bind_port, 18080);
        assert_eq!(config.allowed_domains, vec!["openai.com", "*.openai.com"]);
        assert_eq!(config.auth_password.as_deref(), Some("s3cret"));
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.request_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_password_disables_auth() {
        let cli = parse(&["--proxy-password", "", "--allowed-domains", "openai.com"]);
        assert!(!cli.to_config().unwrap().auth_enabled());
    }

    #[test]
    fn test_blank_allow_list_uses_defaults() {
        let cli = parse(&["--allowed-domains", " "]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.allowed_domains.len(), DEFAULT_ALLOWED_DOMAINS.len());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let cli = parse(&["--allowed-domains", "openai.com", "--rate-limit-max", "0"]);
        assert!(cli.to_config().is_err());
    }

    #[test]
    fn test_connect_to_repeatable() {
        let cli = parse(&[
            "--allowed-domains",
            "openai.com",
            "--connect-to",
            "API.openai.com:443=127.0.0.1:8443",
            "--connect-to",
            "openai.com:80=[::1]:8080",
        ]);
        let config = cli.to_config().unwrap();
        assert_eq!(
            config.connect_overrides["api.openai.com:443"],
            "127.0.0.1:8443".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            config.connect_overrides["openai.com:80"],
            "[::1]:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_connect_to_errors() {
        assert!(parse_connect_to("openai.com:443").is_err());
        assert!(parse_connect_to("openai.com=127.0.0.1:1").is_err());
        assert!(parse_connect_to("openai.com:443=localhost").is_err());
        assert!(Cli::try_parse_from(["fwdgate", "--connect-to", "nope"]).is_err());
    }

    #[test]
    fn test_config_file_replaces_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"allowed_domains": ["claude.ai"], "bind_port": 9999}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap();
        let cli = parse(&[
            "--config",
            path,
            "--allowed-domains",
            "openai.com",
            "--connect-to",
            "claude.ai:443=127.0.0.1:9",
        ]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.allowed_domains, vec!["claude.ai"]);
        assert_eq!(config.bind_port, 9999);
        assert_eq!(config.connect_overrides.len(), 1);
    }

    #[test]
    fn test_dns_order_flag() {
        let cli = parse(&["--allowed-domains", "openai.com", "--dns-order", "ipv4first"]);
        assert_eq!(cli.to_config().unwrap().dns_order, DnsOrder::Ipv4First);
        assert!(Cli::try_parse_from(["fwdgate", "--dns-order", "random"]).is_err());
    }

    #[test]
    fn test_shutdown_grace() {
        let cli = parse(&["--shutdown-grace", "250"]);
        assert_eq!(cli.shutdown_grace(), Duration::from_millis(250));
    }
}
