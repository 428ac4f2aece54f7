//! Inbound request head parsing.
//!
//! The proxy reads the request line and headers straight off the client's
//! TCP stream. Whatever the reader buffered past the blank line belongs to
//! the request body (HTTP) or to the tunnelled stream (CONNECT) and is kept
//! in [`InboundRequest::pre_read`] so no client bytes are lost.

use crate::error::{ProxyError, Result};
use crate::headers::Headers;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Maximum total size of the request head (64 KiB). Prevents OOM from
/// malicious clients sending unbounded header data.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// A parsed request head plus connection metadata.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    /// Absolute URL, origin-form path, or CONNECT authority
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub client_addr: SocketAddr,
    pub received_at: Instant,
    /// Bytes the client sent past the end of the head
    pub pre_read: Vec<u8>,
}

impl InboundRequest {
    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// The health check bypasses every admission check.
    #[must_use]
    pub fn is_health_check(&self) -> bool {
        !self.is_connect() && self.target == "/health"
    }
}

/// Read one request head from `stream`.
///
/// Returns `Ok(None)` when the client closes the connection before sending
/// anything. Leading empty lines are skipped.
pub async fn read_request<S>(
    stream: &mut S,
    client_addr: SocketAddr,
) -> Result<Option<InboundRequest>>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut head = Vec::new();

    loop {
        let start = head.len();
        let budget = (MAX_HEADER_SIZE + 1).saturating_sub(start) as u64;
        let n = (&mut reader).take(budget).read_until(b'\n', &mut head).await?;

        if head.len() > MAX_HEADER_SIZE {
            return Err(ProxyError::HeaderTooLarge {
                limit: MAX_HEADER_SIZE,
            });
        }
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::HttpParse(
                "connection closed inside request head".to_string(),
            ));
        }

        let line = &head[start..];
        if !line.ends_with(b"\n") {
            return Err(ProxyError::HttpParse(
                "connection closed inside request head".to_string(),
            ));
        }
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                head.clear();
                continue;
            }
            break;
        }
    }

    let pre_read = reader.buffer().to_vec();

    let line_end = head
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(head.len());
    let request_line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| ProxyError::HttpParse("request line is not valid UTF-8".to_string()))?
        .trim_end_matches('\r');
    let (method, target, version) = parse_request_line(request_line)?;
    let headers = Headers::parse(&head[line_end..])?;

    Ok(Some(InboundRequest {
        method,
        target,
        version,
        headers,
        client_addr,
        received_at: Instant::now(),
        pre_read,
    }))
}

/// Parse an HTTP request line into (method, target, version).
pub fn parse_request_line(line: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            line
        )));
    }
    if !parts[2].starts_with("HTTP/1.") {
        return Err(ProxyError::HttpParse(format!(
            "unsupported protocol in request line: {}",
            line
        )));
    }
    if !parts[0].bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(ProxyError::HttpParse(format!("invalid method: {}", parts[0])));
    }
    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        parts[2].to_string(),
    ))
}
