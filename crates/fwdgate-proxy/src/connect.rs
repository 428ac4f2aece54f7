//! HTTP CONNECT tunnel handler.
//!
//! Handles `CONNECT host:port HTTP/1.1` requests that passed admission by:
//! 1. Establishing a TCP connection to the upstream
//! 2. Returning `200 Connection Established`
//! 3. Forwarding any bytes the client sent ahead of the handshake
//! 4. Relaying bytes bidirectionally until either side closes
//!
//! The proxy never terminates TLS; it just passes encrypted bytes through.
//! A tunnel is never retried: once bytes have flowed, any error or idle
//! timeout ends the session on both sides.

use crate::audit;
use crate::client::{ClientConn, PROXY_AGENT};
use crate::config::instant_after;
use crate::error::{ProxyError, Result};
use crate::filter::normalize_host;
use crate::upstream::UpstreamConnector;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Port used when the authority has none (or a non-numeric one).
const DEFAULT_CONNECT_PORT: u16 = 443;

/// Copy buffer per tunnel direction.
const PIPE_BUFFER_SIZE: usize = 8 * 1024;

/// Parse a CONNECT authority into a normalized host and port.
///
/// Accepts `host:port`, `[v6]:port`, `[v6]` and bare `host`. A missing or
/// non-numeric port falls back to 443. Empty hosts, port 0, out-of-range
/// ports and unbracketed IPv6 literals are rejected.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let invalid = || ProxyError::BadRequest("invalid CONNECT authority".to_string());
    let authority = authority.trim();

    let (host, port_str) = if let Some(rest) = authority.strip_prefix('[') {
        let (addr, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail.strip_prefix(':') {
            Some(port) => (addr, Some(port)),
            None if tail.is_empty() => (addr, None),
            None => return Err(invalid()),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => return Err(invalid()),
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port_str {
        Some(p) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
            match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(invalid()),
                Ok(port) => port,
            }
        }
        _ => DEFAULT_CONNECT_PORT,
    };

    if host.contains('/') || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    let host = normalize_host(host).ok_or_else(invalid)?;
    Ok((host, port))
}

/// Run an admitted CONNECT request.
///
/// Connect failures are returned before anything is written, so the caller
/// can still answer `502`. Once `200 Connection Established` is sent the
/// connection is committed and later errors only end the session.
pub async fn handle_connect(
    conn: &mut ClientConn,
    host: &str,
    port: u16,
    pre_read: &[u8],
    connector: &UpstreamConnector,
    idle_timeout: Duration,
) -> Result<()> {
    debug!("CONNECT request to {}:{}", host, port);
    let mut upstream = connector.connect_tcp(host, port).await?;

    let established = format!(
        "HTTP/1.1 200 Connection Established\r\nProxy-Agent: {}\r\n\r\n",
        PROXY_AGENT
    );
    conn.write_committed(established.as_bytes()).await?;
    conn.stream.flush().await?;
    audit::log_tunnel_open(conn.peer, host, port);

    let session = TunnelSession::new(idle_timeout);
    let started = Instant::now();
    if !pre_read.is_empty() {
        upstream
            .write_all(pre_read)
            .await
            .map_err(ProxyError::UpstreamIo)?;
        session.bytes_up.fetch_add(pre_read.len() as u64, Ordering::Relaxed);
    }

    let result = session.splice(&mut conn.stream, &mut upstream).await;

    let outcome = match &result {
        Ok(()) => "closed".to_string(),
        Err(e) => e.to_string(),
    };
    audit::log_tunnel_close(
        host,
        port,
        session.bytes_up.load(Ordering::Relaxed),
        session.bytes_down.load(Ordering::Relaxed),
        started.elapsed(),
        &outcome,
    );
    result.map_err(|e| match e {
        SpliceError::Idle => ProxyError::UpstreamTimeout {
            host: host.to_string(),
        },
        SpliceError::Io(e) => ProxyError::UpstreamIo(e),
    })
}

#[derive(Debug, thiserror::Error)]
enum SpliceError {
    #[error("idle timeout")]
    Idle,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Shared state of one live tunnel: transfer counters and the idle deadline
/// both directions push forward.
struct TunnelSession {
    idle_timeout: Duration,
    started: Instant,
    /// Milliseconds since `started` at the last transfer in either direction
    last_activity_ms: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl TunnelSession {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    /// Resolves once neither direction has moved a byte for `idle_timeout`.
    async fn idle_expired(&self) {
        loop {
            let last = self.started
                + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
            let deadline = instant_after(last, self.idle_timeout);
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline.into()).await;
        }
    }

    /// Pipe both directions until either side closes or fails, or the
    /// session goes idle. Returning drops both pipes, so the end of one side
    /// tears down the other.
    async fn splice<U>(
        &self,
        client: &mut TcpStream,
        upstream: &mut U,
    ) -> std::result::Result<(), SpliceError>
    where
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut client_rd, mut client_wr) = client.split();
        let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

        let up = self.pipe(&mut client_rd, &mut upstream_wr, &self.bytes_up);
        let down = self.pipe(&mut upstream_rd, &mut client_wr, &self.bytes_down);

        tokio::select! {
            result = up => result.map_err(SpliceError::from),
            result = down => result.map_err(SpliceError::from),
            () = self.idle_expired() => Err(SpliceError::Idle),
        }
    }

    /// Copy one direction. EOF shuts down the peer's write side so buffered
    /// bytes are flushed before the session ends.
    async fn pipe<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        counter: &AtomicU64,
    ) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            writer.write_all(&buf[..n]).await?;
            counter.fetch_add(n as u64, Ordering::Relaxed);
            self.touch();
        }
    }
}
