//! Outbound connections to upstream hosts.
//!
//! Resolves the destination once, then tries each resolved address in turn
//! with a connect timeout. Static `host:port` overrides (like curl's
//! `--connect-to`) are consulted before DNS. HTTPS relay targets are wrapped
//! in TLS using the webpki root store.

use crate::config::DnsOrder;
use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// A byte stream to an upstream, plain TCP or TLS.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

pub type UpstreamStream = Box<dyn UpstreamIo>;

/// Opens upstream connections for both proxying paths.
pub struct UpstreamConnector {
    overrides: HashMap<String, SocketAddr>,
    connect_timeout: Duration,
    dns_order: DnsOrder,
    /// Shared TLS connector, built once (the root store is expensive).
    tls_connector: TlsConnector,
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("overrides", &self.overrides)
            .field("connect_timeout", &self.connect_timeout)
            .field("dns_order", &self.dns_order)
            .finish_non_exhaustive()
    }
}

impl UpstreamConnector {
    pub fn new(overrides: &HashMap<String, SocketAddr>, connect_timeout: Duration) -> Result<Self> {
        // Use the ring provider explicitly to avoid ambiguity when multiple
        // crypto providers are in the dependency tree.
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Config(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            overrides: overrides
                .iter()
                .map(|(k, v)| (k.trim().to_lowercase(), *v))
                .collect(),
            connect_timeout,
            dns_order: DnsOrder::default(),
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    #[must_use]
    pub fn with_dns_order(mut self, order: DnsOrder) -> Self {
        self.dns_order = order;
        self
    }

    /// Resolve `host:port`, honouring overrides. The lookup is bounded by
    /// the connect timeout.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let key = authority(host, port).to_lowercase();
        if let Some(addr) = self.overrides.get(&key) {
            debug!("Connect override {} -> {}", key, addr);
            return Ok(vec![*addr]);
        }

        let lookup = tokio::net::lookup_host(authority(host, port));
        let mut resolved: Vec<SocketAddr> = tokio::time::timeout(self.connect_timeout, lookup)
            .await
            .map_err(|_| ProxyError::UpstreamConnect {
                host: host.to_string(),
                reason: "DNS resolution timed out".to_string(),
            })?
            .map_err(|e| ProxyError::UpstreamConnect {
                host: host.to_string(),
                reason: format!("DNS resolution failed: {}", e),
            })?
            .collect();
        if resolved.is_empty() {
            return Err(ProxyError::UpstreamConnect {
                host: host.to_string(),
                reason: "DNS resolution returned no addresses".to_string(),
            });
        }
        order_addresses(&mut resolved, self.dns_order);
        Ok(resolved)
    }

    /// Open a TCP connection to `host:port`.
    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addrs = self.resolve(host, port).await?;
        let mut last_err = None;
        for addr in &addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    debug!("Connect to {} timed out", addr);
                    last_err = Some("connection timed out".to_string());
                }
            }
        }
        Err(ProxyError::UpstreamConnect {
            host: host.to_string(),
            reason: last_err.unwrap_or_else(|| "no addresses to connect to".to_string()),
        })
    }

    /// Open a connection, wrapped in TLS when `tls` is set.
    pub async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<UpstreamStream> {
        let tcp = self.connect_tcp(host, port).await?;
        if !tls {
            return Ok(Box::new(tcp));
        }

        let server_name = rustls::pki_types::ServerName::try_from(host.to_string()).map_err(|_| {
            ProxyError::UpstreamConnect {
                host: host.to_string(),
                reason: "invalid server name for TLS".to_string(),
            }
        })?;
        let tls_stream = self
            .tls_connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                host: host.to_string(),
                reason: format!("TLS handshake failed: {}", e),
            })?;
        Ok(Box::new(tls_stream))
    }
}

fn order_addresses(addrs: &mut [SocketAddr], order: DnsOrder) {
    if order == DnsOrder::Ipv4First {
        // Stable, so each family keeps the resolver's order
        addrs.sort_by_key(SocketAddr::is_ipv6);
    }
}

/// `host:port`, bracketing IPv6 literals.
#[must_use]
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn connector(overrides: &[(&str, SocketAddr)]) -> UpstreamConnector {
        let map = overrides
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect();
        UpstreamConnector::new(&map, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_authority() {
        assert_eq!(authority("openai.com", 443), "openai.com:443");
        assert_eq!(authority("::1", 8080), "[::1]:8080");
    }

    #[test]
    fn test_order_addresses() {
        let addrs: Vec<SocketAddr> = [
            "[2001:db8::1]:443",
            "192.0.2.1:443",
            "[2001:db8::2]:443",
            "192.0.2.2:443",
        ]
        .iter()
        .map(|a| a.parse().unwrap())
        .collect();

        let mut verbatim = addrs.clone();
        order_addresses(&mut verbatim, DnsOrder::Verbatim);
        assert_eq!(verbatim, addrs);

        let mut v4_first = addrs.clone();
        order_addresses(&mut v4_first, DnsOrder::Ipv4First);
        assert_eq!(v4_first, vec![addrs[1], addrs[3], addrs[0], addrs[2]]);
    }

    #[tokio::test]
    async fn test_lookup_bounded_by_connect_timeout() {
        // `.invalid` never resolves; either outcome must arrive within the bound
        let c = UpstreamConnector::new(&HashMap::new(), Duration::from_millis(300)).unwrap();
        let lookup = c.resolve("fwdgate.invalid", 443);
        let result = tokio::time::timeout(Duration::from_secs(2), lookup).await;
        assert!(matches!(result, Ok(Err(ProxyError::UpstreamConnect { .. }))));
    }

    #[tokio::test]
    async fn test_override_wins_over_dns() {
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let c = connector(&[("ChatGPT.com:443", target)]);
        assert_eq!(c.resolve("chatgpt.com", 443).await.unwrap(), vec![target]);
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let c = connector(&[]);
        let addrs = c.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_connect_tcp_via_override() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let c = connector(&[("openai.com:80", addr)]);
        let stream = c.connect_tcp("openai.com", 80).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let c = connector(&[("openai.com:80", addr)]);
        let err = c.connect_tcp("openai.com", 80).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnect { .. }));
        assert_eq!(err.status(), 502);
    }
}
