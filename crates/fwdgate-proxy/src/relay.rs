//! Plaintext HTTP relay for absolute-form requests.
//!
//! Handles `GET http://host/path HTTP/1.1` style requests that passed
//! admission by:
//! 1. Resolving the target URL (absolute form, or `Host` + origin form)
//! 2. Sending a sanitized request upstream with `Connection: close`
//! 3. Streaming the request body (`Content-Length` or chunked)
//! 4. Streaming the response back to the client without buffering
//!
//! The response head is forwarded verbatim. This handles SSE
//! (text/event-stream), chunked transfer, and regular responses alike.

use crate::audit;
use crate::client::ClientConn;
use crate::config::deadline_after;
use crate::error::{ProxyError, Result};
use crate::headers::{sanitize, Headers};
use crate::request::{InboundRequest, MAX_HEADER_SIZE};
use crate::upstream::{authority, UpstreamConnector};
use std::time::{Duration, Instant};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tracing::debug;

/// Copy buffer for request and response bodies.
const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Longest chunk-size line accepted in a chunked request body.
const MAX_CHUNK_LINE: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A resolved relay destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub scheme: Scheme,
    /// Lowercase host, IPv6 literals without brackets
    pub host: String,
    pub port: u16,
    pub path_and_query: String,
}

impl HttpTarget {
    /// Value of the `Host` header sent upstream: the port is only included
    /// when it differs from the scheme default.
    #[must_use]
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            authority(&self.host, self.port)
        }
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

/// Timeouts applied to one relayed exchange.
#[derive(Debug, Clone, Copy)]
pub struct RelayTimeouts {
    /// Bounds connecting plus sending the head, and separately the wait
    /// for the response head once the request body is sent
    pub request: Duration,
    /// Longest stall in either body transfer
    pub idle: Duration,
}

/// How the client framed its request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

/// Resolve the upstream target of a non-CONNECT request.
pub fn parse_target(req: &InboundRequest) -> Result<HttpTarget> {
    let lower = req.target.to_ascii_lowercase();
    let url_str = if lower.starts_with("http://") || lower.starts_with("https://") {
        req.target.clone()
    } else {
        let host = req
            .headers
            .get("host")
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::BadRequest("missing target host".to_string()))?;
        if !req.target.starts_with('/') {
            return Err(ProxyError::BadRequest("invalid URL".to_string()));
        }
        format!("http://{}{}", host, req.target)
    };

    let parsed =
        url::Url::parse(&url_str).map_err(|_| ProxyError::BadRequest("invalid URL".to_string()))?;
    let scheme = match parsed.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        _ => return Err(ProxyError::BadRequest("invalid URL".to_string())),
    };
    let host = parsed
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::BadRequest("missing target host".to_string()))?;
    let port = parsed.port().unwrap_or_else(|| scheme.default_port());

    let mut path_and_query = parsed.path().to_string();
    if path_and_query.is_empty() {
        path_and_query.push('/');
    }
    if let Some(query) = parsed.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    Ok(HttpTarget {
        scheme,
        host,
        port,
        path_and_query,
    })
}

/// Determine the request body framing from the client's headers.
pub fn body_framing(headers: &Headers) -> Result<BodyFraming> {
    if let Some(te) = headers.get("transfer-encoding") {
        let last = te.rsplit(',').next().unwrap_or("").trim();
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(ProxyError::BadRequest(
            "unsupported transfer-encoding".to_string(),
        ));
    }

    let mut length = None;
    for value in headers.get_all("content-length") {
        for part in value.split(',') {
            let parsed: u64 = part
                .trim()
                .parse()
                .map_err(|_| ProxyError::BadRequest("invalid content-length".to_string()))?;
            if length.is_some_and(|l| l != parsed) {
                return Err(ProxyError::BadRequest(
                    "conflicting content-length".to_string(),
                ));
            }
            length = Some(parsed);
        }
    }
    Ok(match length {
        Some(0) | None => BodyFraming::None,
        Some(len) => BodyFraming::Length(len),
    })
}

/// Serialize the outbound request head.
#[must_use]
pub fn build_request_head(
    req: &InboundRequest,
    target: &HttpTarget,
    framing: BodyFraming,
) -> Vec<u8> {
    let mut headers = sanitize(&req.headers, &target.host_header());
    match framing {
        BodyFraming::Chunked => {
            headers.remove("content-length");
            headers.append("Transfer-Encoding", "chunked");
        }
        BodyFraming::Length(len) => headers.set("Content-Length", &len.to_string()),
        BodyFraming::None => {}
    }
    headers.append("Connection", "close");

    let mut head =
        format!("{} {} HTTP/1.1\r\n", req.method, target.path_and_query).into_bytes();
    headers.write_to(&mut head);
    head.extend_from_slice(b"\r\n");
    head
}

/// Relay an admitted plaintext request and stream the response back.
///
/// Errors returned while `conn.committed` is false can still be reported to
/// the client; after that the caller must drop the connection.
pub async fn handle_http(
    conn: &mut ClientConn,
    req: &InboundRequest,
    target: &HttpTarget,
    connector: &UpstreamConnector,
    timeouts: RelayTimeouts,
) -> Result<()> {
    let framing = body_framing(&req.headers)?;
    let head = build_request_head(req, target, framing);
    debug!(
        "Relaying {} {}://{}{}",
        req.method,
        if target.is_tls() { "https" } else { "http" },
        target.host_header(),
        target.path_and_query
    );

    let started = Instant::now();
    let timed_out = || ProxyError::UpstreamTimeout {
        host: target.host.clone(),
    };

    // Connect and send the head
    let send_head = async {
        let mut upstream = connector
            .connect(&target.host, target.port, target.is_tls())
            .await?;
        upstream
            .write_all(&head)
            .await
            .map_err(ProxyError::UpstreamIo)?;
        Ok::<_, ProxyError>(upstream)
    };
    let mut upstream = tokio::time::timeout_at(deadline_after(timeouts.request), send_head)
        .await
        .map_err(|_| timed_out())??;

    // Body, each read and write bounded by the idle timeout
    let idle = IdleLimit {
        limit: timeouts.idle,
        host: &target.host,
    };
    upload_body(&mut conn.stream, &req.pre_read, &mut upstream, framing, idle).await?;
    idle.run(async { upstream.flush().await.map_err(ProxyError::UpstreamIo) })
        .await?;
    let mut upstream = BufReader::new(upstream);
    let deadline = deadline_after(timeouts.request);

    // Response head, forwarding any interim 1xx responses
    let status = loop {
        let response = tokio::select! {
            result = tokio::time::timeout_at(deadline, read_response_head(&mut upstream)) => {
                result.map_err(|_| timed_out())??
            }
            () = client_closed(&mut conn.stream) => return Err(ProxyError::ClientGone),
        };
        conn.write_committed(&response.raw)
            .await
            .map_err(|_| ProxyError::ClientGone)?;
        if !(100..200).contains(&response.status) || response.status == 101 {
            break response.status;
        }
    };

    // Body, until the upstream closes
    let (mut client_rd, mut client_wr) = conn.stream.split();
    let pipe = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = match tokio::time::timeout(timeouts.idle, upstream.read(&mut buf)).await {
                Err(_) => return Err(timed_out()),
                Ok(Err(e)) => return Err(ProxyError::UpstreamIo(e)),
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => n,
            };
            client_wr
                .write_all(&buf[..n])
                .await
                .map_err(|_| ProxyError::ClientGone)?;
        }
    };
    tokio::select! {
        result = pipe => result?,
        () = client_closed(&mut client_rd) => return Err(ProxyError::ClientGone),
    }
    client_wr.flush().await.map_err(|_| ProxyError::ClientGone)?;

    audit::log_relay_response(
        &req.method,
        &target.host,
        &target.path_and_query,
        status,
        started.elapsed(),
    );
    Ok(())
}

/// Per-operation stall limit for body transfers.
#[derive(Debug, Clone, Copy)]
struct IdleLimit<'a> {
    limit: Duration,
    host: &'a str,
}

impl IdleLimit<'_> {
    async fn run<F, T>(self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.limit, op)
            .await
            .map_err(|_| ProxyError::UpstreamTimeout {
                host: self.host.to_string(),
            })?
    }
}

/// Forward the request body framed as the client sent it. Bytes read ahead
/// of the head are consumed first.
async fn upload_body<W>(
    client: &mut TcpStream,
    pre_read: &[u8],
    upstream: &mut W,
    framing: BodyFraming,
    idle: IdleLimit<'_>,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut source = pre_read.chain(client);
    match framing {
        BodyFraming::None => Ok(0),
        BodyFraming::Length(len) => pump_exact(&mut source, upstream, len, idle).await,
        BodyFraming::Chunked => copy_chunked(&mut BufReader::new(source), upstream, idle).await,
    }
}

/// Copy exactly `len` bytes; the client closing early is an error.
async fn pump_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    idle: IdleLimit<'_>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = idle
            .run(async {
                reader
                    .read(&mut buf[..want])
                    .await
                    .map_err(|_| ProxyError::ClientGone)
            })
            .await?;
        if n == 0 {
            return Err(ProxyError::ClientGone);
        }
        idle.run(async { writer.write_all(&buf[..n]).await.map_err(ProxyError::UpstreamIo) })
            .await?;
        remaining -= n as u64;
    }
    Ok(len)
}

/// Copy a chunked body verbatim, parsing chunk sizes to find where it ends.
/// Returns the number of payload bytes.
async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W, idle: IdleLimit<'_>) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let line = idle.run(read_chunk_line(reader)).await?;
        idle.run(async { writer.write_all(&line).await.map_err(ProxyError::UpstreamIo) })
            .await?;
        let size = parse_chunk_size(&line)?;

        if size == 0 {
            // Trailer section, terminated by an empty line
            loop {
                let trailer = idle.run(read_chunk_line(reader)).await?;
                idle.run(async {
                    writer
                        .write_all(&trailer)
                        .await
                        .map_err(ProxyError::UpstreamIo)
                })
                .await?;
                if trailer == b"\r\n" || trailer == b"\n" {
                    return Ok(total);
                }
            }
        }

        // Chunk data plus its CRLF
        let framed = size
            .checked_add(2)
            .ok_or_else(|| ProxyError::BadRequest("invalid chunk size".to_string()))?;
        pump_exact(reader, writer, framed, idle).await?;
        total = total.saturating_add(size);
    }
}

async fn read_chunk_line<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    (&mut *reader)
        .take(MAX_CHUNK_LINE as u64)
        .read_until(b'\n', &mut line)
        .await
        .map_err(|_| ProxyError::ClientGone)?;
    if line.is_empty() {
        return Err(ProxyError::ClientGone);
    }
    if !line.ends_with(b"\n") {
        return Err(ProxyError::BadRequest("malformed chunked body".to_string()));
    }
    Ok(line)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let invalid = || ProxyError::BadRequest("invalid chunk size".to_string());
    let text = std::str::from_utf8(line).map_err(|_| invalid())?;
    let size = text.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Err(invalid());
    }
    u64::from_str_radix(size, 16).map_err(|_| invalid())
}

/// A raw upstream response head.
#[derive(Debug)]
struct ResponseHead {
    status: u16,
    /// Status line and headers including the terminating blank line
    raw: Vec<u8>,
}

async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    loop {
        let start = raw.len();
        let budget = (MAX_HEADER_SIZE + 1).saturating_sub(start) as u64;
        let n = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut raw)
            .await
            .map_err(ProxyError::UpstreamIo)?;
        if raw.len() > MAX_HEADER_SIZE {
            return Err(ProxyError::UpstreamProtocol(format!(
                "response head exceeds {} bytes",
                MAX_HEADER_SIZE
            )));
        }
        let line = &raw[start..];
        if n == 0 || !line.ends_with(b"\n") {
            return Err(ProxyError::UpstreamProtocol(
                "upstream closed before sending a response".to_string(),
            ));
        }
        if start > 0 && (line == b"\r\n" || line == b"\n") {
            break;
        }
    }
    let status = parse_status_line(&raw)?;
    Ok(ResponseHead { status, raw })
}

/// Extract the status code from `HTTP/1.x NNN reason`.
fn parse_status_line(data: &[u8]) -> Result<u16> {
    let line_end = data
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(data.len());
    let invalid = || ProxyError::UpstreamProtocol("invalid status line".to_string());
    let line = std::str::from_utf8(&data[..line_end]).map_err(|_| invalid())?;

    let mut parts = line.split_whitespace();
    let version = parts.next().ok_or_else(invalid)?;
    if !version.starts_with("HTTP/") {
        return Err(invalid());
    }
    let code = parts.next().ok_or_else(invalid)?;
    if code.len() != 3 {
        return Err(invalid());
    }
    code.parse().map_err(|_| invalid())
}

/// Resolves when the client closes its side or the connection fails.
/// Anything the client sends after its request is discarded.
async fn client_closed<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}
