//! Client connection handle and synthesized responses.
//!
//! The proxy writes raw HTTP/1.1 onto the client's TCP stream for both
//! request shapes. [`ClientConn`] remembers whether any response bytes have
//! gone out: before that point every error can still become a well-formed
//! response, after it the only option is to drop the connection.

use crate::auth::PROXY_AUTHENTICATE;
use crate::error::{ProxyError, Result};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Value of the `Proxy-Agent` header on proxy-generated responses.
pub const PROXY_AGENT: &str = "fwdgate";

/// An accepted client connection.
#[derive(Debug)]
pub struct ClientConn {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Response bytes have been written; no further status can be sent.
    pub committed: bool,
}

impl ClientConn {
    #[must_use]
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            committed: false,
        }
    }

    /// Write a complete proxy-generated response.
    pub async fn send_response(
        &mut self,
        status: u16,
        content_type: &str,
        extra_headers: &[(&str, String)],
        body: &[u8],
    ) -> Result<()> {
        if self.committed {
            return Err(ProxyError::Internal(format!(
                "response already started, cannot send {}",
                status
            )));
        }
        let response = build_response(status, content_type, extra_headers, body);
        self.committed = true;
        self.stream.write_all(&response).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Report `err` to the client as a plain-text error response.
    pub async fn send_error(&mut self, err: &ProxyError) -> Result<()> {
        let mut extra = Vec::new();
        match err {
            ProxyError::AuthRequired => {
                extra.push(("Proxy-Authenticate", PROXY_AUTHENTICATE.to_string()));
            }
            ProxyError::RateLimited { retry_after } => {
                let secs = retry_after
                    .as_secs()
                    .saturating_add(u64::from(retry_after.subsec_nanos() > 0));
                extra.push(("Retry-After", secs.to_string()));
            }
            _ => {}
        }
        let body = format!("{}\n", err.client_message());
        self.send_response(
            err.status(),
            "text/plain; charset=utf-8",
            &extra,
            body.as_bytes(),
        )
        .await
    }

    /// Write raw bytes that begin (or continue) the response.
    pub async fn write_committed(&mut self, bytes: &[u8]) -> Result<()> {
        self.committed = true;
        self.stream.write_all(bytes).await?;
        Ok(())
    }
}

/// Serialize a response with `Connection: close` framing.
#[must_use]
pub fn build_response(
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, String)],
    body: &[u8],
) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nProxy-Agent: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n",
        status,
        reason_phrase(status),
        PROXY_AGENT,
        content_type,
        body.len()
    );
    for (name, value) in extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

/// Canonical reason phrase for the statuses the proxy generates.
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn conn_pair() -> (ClientConn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (ClientConn::new(server, peer), client)
    }

    async fn read_all(mut stream: TcpStream) -> String {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_build_response() {
        let raw = build_response(403, "text/plain", &[], b"nope");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Proxy-Agent: fwdgate\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nnope"));
    }

    #[test]
    fn test_reason_phrase_unknown() {
        assert_eq!(reason_phrase(418), "Error");
    }

    #[tokio::test]
    async fn test_send_error_auth_challenge() {
        let (mut conn, client) = conn_pair().await;
        conn.send_error(&ProxyError::AuthRequired).await.unwrap();
        assert!(conn.committed);
        drop(conn);

        let text = read_all(client).await;
        assert!(text.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(text.contains("Proxy-Authenticate: Basic realm=\"fwdgate\"\r\n"));
    }

    #[tokio::test]
    async fn test_send_error_retry_after_rounds_up() {
        let (mut conn, client) = conn_pair().await;
        let err = ProxyError::RateLimited {
            retry_after: Duration::from_millis(1500),
        };
        conn.send_error(&err).await.unwrap();
        drop(conn);

        let text = read_all(client).await;
        assert!(text.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(text.contains("Retry-After: 2\r\n"));
    }

    #[tokio::test]
    async fn test_no_second_response_after_commit() {
        let (mut conn, _client) = conn_pair().await;
        conn.write_committed(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        let result = conn.send_error(&ProxyError::UpstreamProtocol("x".to_string())).await;
        assert!(result.is_err());
    }
}
