//! `/health` liveness report.

use serde::Serialize;
use std::time::Instant;

/// Body of the `/health` response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    /// RFC 3339 time of the report
    pub timestamp: String,
    /// Seconds since the proxy started
    pub uptime: f64,
    pub allowed_domains: usize,
    pub auth_enabled: bool,
}

impl HealthReport {
    #[must_use]
    pub fn new(started_at: Instant, allowed_domains: usize, auth_enabled: bool) -> Self {
        Self {
            status: "ok",
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            uptime: started_at.elapsed().as_secs_f64(),
            allowed_domains,
            auth_enabled,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
