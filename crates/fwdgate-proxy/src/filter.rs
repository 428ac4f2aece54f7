//! Domain allow-list matching.
//!
//! The allow-list mixes exact hostnames (`chatgpt.com`) and wildcard
//! entries (`*.chatgpt.com`). A wildcard matches its base domain and any
//! subdomain of it, but never a different domain that merely shares the
//! suffix: `*.chatgpt.com` matches `chatgpt.com` and `ab.chatgpt.com`, not
//! `evilchatgpt.com`.
//!
//! Candidates are normalized before matching, so scheme prefixes, path
//! suffixes, explicit ports and letter case never change the decision.

use std::collections::HashSet;

/// Immutable host allow-list, shared freely between connection tasks.
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    /// Allowed exact hosts (lowercased)
    exact: HashSet<String>,
    /// Wildcard base domains (`*.example.com` -> `example.com`, lowercased)
    wildcard_bases: Vec<String>,
}

impl DomainMatcher {
    /// Build a matcher from raw allow-list entries.
    ///
    /// Entries are trimmed and lowercased; blank entries are dropped.
    /// Entries starting with `*.` are wildcard patterns, all others exact.
    #[must_use]
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut exact = HashSet::new();
        let mut wildcard_bases = Vec::new();

        for entry in entries {
            let lower = entry.as_ref().trim().to_lowercase();
            if lower.is_empty() {
                continue;
            }
            if let Some(base) = lower.strip_prefix("*.") {
                if !base.is_empty() && !wildcard_bases.iter().any(|b| b == base) {
                    wildcard_bases.push(base.to_string());
                }
            } else {
                exact.insert(lower);
            }
        }

        Self {
            exact,
            wildcard_bases,
        }
    }

    /// Whether `host` is permitted by the allow-list.
    ///
    /// Returns false for empty or unparseable input.
    #[must_use]
    pub fn is_allowed(&self, host: &str) -> bool {
        let Some(normalized) = normalize_host(host) else {
            return false;
        };

        if self.exact.contains(&normalized) {
            return true;
        }

        self.wildcard_bases.iter().any(|base| {
            normalized == *base
                || (normalized.len() > base.len()
                    && normalized.ends_with(base.as_str())
                    && normalized.as_bytes()[normalized.len() - base.len() - 1] == b'.')
        })
    }

    /// Number of configured entries (exact + wildcard)
    #[must_use]
    pub fn allowed_count(&self) -> usize {
        self.exact.len().saturating_add(self.wildcard_bases.len())
    }
}

/// Reduce a host string to a bare lowercase hostname.
///
/// Strips a leading `http://` or `https://`, anything from the first `/`,
/// a trailing `:port`, and surrounding whitespace. Bracketed IPv6 literals
/// (`[::1]:443`) lose their brackets; bare IPv6 literals are left intact.
#[must_use]
pub fn normalize_host(host: &str) -> Option<String> {
    let lower = host.trim().to_lowercase();
    let without_scheme = lower
        .strip_prefix("http://")
        .or_else(|| lower.strip_prefix("https://"))
        .unwrap_or(&lower);
    let without_path = without_scheme
        .split_once('/')
        .map_or(without_scheme, |(authority, _)| authority);

    let bare = if let Some(rest) = without_path.strip_prefix('[') {
        // [v6] or [v6]:port
        let (addr, tail) = rest.split_once(']')?;
        if !(tail.is_empty() || tail.strip_prefix(':').is_some_and(is_port)) {
            return None;
        }
        addr
    } else {
        match without_path.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') && is_port(port) => name,
            _ => without_path,
        }
    };

    let bare = bare.trim();
    if bare.is_empty() {
        None
    } else {
        Some(bare.to_string())
    }
}

/// One or more ASCII digits.
fn is_port(digits: &str) -> bool {
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}
