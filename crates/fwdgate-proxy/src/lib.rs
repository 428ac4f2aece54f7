//! Allow-listed forward proxy.
//!
//! `fwdgate-proxy` mediates a client's outbound traffic toward a restricted
//! set of destination domains. It serves two request shapes:
//!
//! 1. **CONNECT tunnel** (`connect`) - The proxy validates the target host
//!    against the allow-list, then establishes a raw TCP tunnel. TLS is
//!    never terminated.
//!
//! 2. **HTTP relay** (`relay`) - Absolute-form plaintext requests
//!    (`GET http://host/path`) are sanitized, sent upstream, and the
//!    response is streamed back.
//!
//! Every request passes the same admission pipeline first (`server`):
//! proxy authentication (`auth`), per-client rate limiting (`ratelimit`)
//! and the domain allow-list (`filter`).

pub mod audit;
pub mod auth;
pub mod client;
pub mod config;
pub mod connect;
pub mod error;
pub mod filter;
pub mod headers;
pub mod health;
pub mod ratelimit;
pub mod relay;
pub mod request;
pub mod server;
pub mod upstream;

pub use config::{DnsOrder, ProxyConfig, RateLimitConfig};
pub use error::{ProxyError, Result};
pub use filter::DomainMatcher;
pub use server::{start, ProxyHandle, ProxyTarget};
