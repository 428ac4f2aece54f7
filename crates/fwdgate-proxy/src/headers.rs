//! Header collection and outbound header sanitization.
//!
//! Headers keep their original order and casing so the upstream sees the
//! client's request as sent, minus what the sanitizer removes. Every name
//! comparison is ASCII case-insensitive.

use crate::error::{ProxyError, Result};

/// Hop-by-hop headers, meaningful only for a single transport hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Headers that reveal the client's address or the presence of a proxy.
const CLIENT_IDENTITY: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "forwarded",
    "via",
    "x-client-ip",
    "client-ip",
    "cf-connecting-ip",
    "fastly-client-ip",
    "true-client-ip",
    "x-cluster-client-ip",
    "x-forwarded",
    "forwarded-for",
    "x-forwarded-proto",
    // HTTP/2 priority hints confuse some HTTP/1.1 upstreams
    "priority",
];

/// Ordered, case-insensitive header collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    value: String,
    /// The value arrived as obs-text and was decoded as ISO-8859-1; it is
    /// re-encoded the same way on output
    latin1: bool,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw header block (the lines after the request/status line).
    ///
    /// Names must be ASCII tokens. Values that are not UTF-8 are taken as
    /// ISO-8859-1 obs-text. Blank lines are skipped. A line without a colon,
    /// an empty name, or an obsolete folded continuation line is a parse
    /// error.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut headers = Self::new();
        for line in raw.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            if line[0] == b' ' || line[0] == b'\t' {
                return Err(ProxyError::HttpParse(
                    "folded header lines are not supported".to_string(),
                ));
            }
            let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
                ProxyError::HttpParse(format!(
                    "malformed header line: {}",
                    String::from_utf8_lossy(line)
                ))
            })?;
            let name = std::str::from_utf8(trim_ascii(&line[..colon]))
                .ok()
                .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_graphic()))
                .ok_or_else(|| {
                    ProxyError::HttpParse(format!(
                        "invalid header name: {:?}",
                        String::from_utf8_lossy(&line[..colon])
                    ))
                })?;

            let value = trim_ascii(&line[colon + 1..]);
            let (value, latin1) = match std::str::from_utf8(value) {
                Ok(text) => (text.to_string(), false),
                Err(_) => (value.iter().map(|&b| char::from(b)).collect(), true),
            };
            headers.entries.push(Entry {
                name: name.to_string(),
                value,
                latin1,
            });
        }
        Ok(headers)
    }

    /// Add a header, keeping any existing values of the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        self.entries.push(Entry {
            name: name.to_string(),
            value: value.to_string(),
            latin1: false,
        });
    }

    /// Replace every value of `name` with a single value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.append(name, value);
    }

    /// Remove every value of `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !e.name.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// All values of `name`, joined with `", "` as for a list-valued header.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self.get_all(name).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// Iterate over the individual values of `name`.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (e.name.as_str(), e.value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append `Name: value\r\n` lines for every header to `out`, with
    /// obs-text values in their original bytes.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for entry in &self.entries {
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(b": ");
            if entry.latin1 {
                // Decoded from single bytes, so every char fits in one
                out.extend(entry.value.chars().map(|c| c as u8));
            } else {
                out.extend_from_slice(entry.value.as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Strip hop-by-hop and client-identifying headers and set an
/// authoritative `Host`.
///
/// 1. Headers named in the `Connection` header are removed.
/// 2. The fixed hop-by-hop list is removed.
/// 3. The fixed client-identity list is removed.
/// 4. `Host` is replaced by `target_host`.
#[must_use]
pub fn sanitize(headers: &Headers, target_host: &str) -> Headers {
    let mut out = headers.clone();

    let listed: Vec<String> = headers
        .get_all("connection")
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in &listed {
        out.remove(name);
    }

    out.entries.retain(|entry| {
        let lower = entry.name.to_ascii_lowercase();
        !HOP_BY_HOP.contains(&lower.as_str()) && !CLIENT_IDENTITY.contains(&lower.as_str())
    });

    out.set("Host", target_host);
    out
}

/// Whether `name` would be dropped by [`sanitize`] regardless of `Connection`.
#[must_use]
pub fn is_stripped(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str()) || CLIENT_IDENTITY.contains(&lower.as_str())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn headers(raw: &str) -> Headers {
        Headers::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_preserves_order_and_case() {
        let h = headers("Host: a.com\r\nX-Custom: 1\r\nAccept: */*\r\n\r\n");
        let names: Vec<&str> = h.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Host", "X-Custom", "Accept"]);
    }

    #[test]
    fn test_get_case_insensitive_and_joins_duplicates() {
        let h = headers("accept: text/html\r\nACCEPT: application/json\r\n");
        assert_eq!(h.get("Accept").unwrap(), "text/html, application/json");
        assert!(h.contains("aCcEpT"));
        assert!(h.get("missing").is_none());
    }

    #[test]
    fn test_parse_value_with_colon() {
        let h = headers("Host: example.com:8080\r\n");
        assert_eq!(h.get("host").unwrap(), "example.com:8080");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Headers::parse(b"NoColonHere\r\n").is_err());
        assert!(Headers::parse(b": empty-name\r\n").is_err());
        assert!(Headers::parse(b"X-A: 1\r\n continued\r\n").is_err());
        assert!(Headers::parse(b"Bad Name: 1\r\n").is_err());
    }

    #[test]
    fn test_sanitize_removes_hop_by_hop() {
        let h = headers(
            "Connection: keep-alive\r\nKeep-Alive: timeout=5\r\nProxy-Authorization: Basic abc\r\n\
             Proxy-Connection: keep-alive\r\nTE: trailers\r\nTransfer-Encoding: chunked\r\n\
             Upgrade: websocket\r\nTrailers: x\r\nProxy-Authenticate: Basic\r\nAccept: */*\r\n",
        );
        let out = sanitize(&h, "openai.com");
        let names: Vec<&str> = out.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Accept", "Host"]);
    }

    #[test]
    fn test_sanitize_removes_client_identity() {
        let h = headers(
            "X-Forwarded-For: 1.2.3.4\r\nX-Real-IP: 1.2.3.4\r\nForwarded: for=1.2.3.4\r\n\
             Via: 1.1 proxy\r\nX-Client-IP: 1.2.3.4\r\nClient-IP: 1.2.3.4\r\n\
             CF-Connecting-IP: 1.2.3.4\r\nFastly-Client-IP: 1.2.3.4\r\nTrue-Client-IP: 1.2.3.4\r\n\
             X-Cluster-Client-IP: 1.2.3.4\r\nX-Forwarded: for=1.2.3.4\r\nForwarded-For: 1.2.3.4\r\n\
             X-Forwarded-Proto: https\r\nPriority: u=1\r\nUser-Agent: curl/8\r\n",
        );
        let out = sanitize(&h, "openai.com");
        for (name, _) in out.iter() {
            assert!(!is_stripped(name), "{} leaked", name);
        }
        assert_eq!(out.get("user-agent").unwrap(), "curl/8");
    }

    #[test]
    fn test_sanitize_strips_connection_listed_headers() {
        let h = headers(
            "Connection: X-Secret, x-other ,\r\nconnection: X-Third\r\nx-secret: 1\r\n\
             X-Other: 2\r\nX-Third: 3\r\nX-Keep: 4\r\n",
        );
        let out = sanitize(&h, "openai.com");
        assert!(!out.contains("x-secret"));
        assert!(!out.contains("x-other"));
        assert!(!out.contains("x-third"));
        assert!(!out.contains("connection"));
        assert_eq!(out.get("x-keep").unwrap(), "4");
    }

    #[test]
    fn test_sanitize_connection_listing_denylisted_names() {
        let h = headers("Connection: X-Forwarded-For, Via\r\nX-Forwarded-For: 9.9.9.9\r\nVia: a\r\n");
        let out = sanitize(&h, "openai.com");
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("host").unwrap(), "openai.com");
    }

    #[test]
    fn test_sanitize_overwrites_host() {
        let h = headers("HOST: attacker.example\r\nhost: second\r\nAccept: */*\r\n");
        let out = sanitize(&h, "openai.com:8443");
        let hosts: Vec<&str> = out.get_all("host").collect();
        assert_eq!(hosts, vec!["openai.com:8443"]);
    }

    #[test]
    fn test_sanitize_adds_host_when_missing() {
        let out = sanitize(&Headers::new(), "chatgpt.com");
        assert_eq!(out.get("Host").unwrap(), "chatgpt.com");
    }

    #[test]
    fn test_sanitize_leaves_input_untouched() {
        let h = headers("X-Forwarded-For: 1.2.3.4\r\n");
        let _ = sanitize(&h, "openai.com");
        assert!(h.contains("x-forwarded-for"));
    }

    #[test]
    fn test_write_to() {
        let mut h = Headers::new();
        h.append("Host", "a.com");
        h.append("Accept", "*/*");
        let mut out = Vec::new();
        h.write_to(&mut out);
        assert_eq!(out, b"Host: a.com\r\nAccept: */*\r\n");
    }

    #[test]
    fn test_obs_text_value_round_trips() {
        let h = Headers::parse(b"X-Name: Jos\xe9\r\nAccept: */*\r\n").unwrap();
        assert_eq!(h.get("x-name").unwrap(), "Jos\u{e9}");
        let mut out = Vec::new();
        h.write_to(&mut out);
        assert_eq!(out, b"X-Name: Jos\xe9\r\nAccept: */*\r\n");
    }

    #[test]
    fn test_non_ascii_name_rejected() {
        assert!(Headers::parse(b"X-N\xe4me: 1\r\n").is_err());
    }
}
