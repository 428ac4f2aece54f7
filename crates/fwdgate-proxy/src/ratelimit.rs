//! Per-client request budget.
//!
//! Each client identity (the remote IP of the TCP connection) gets a fixed
//! window that opens at its first request and a points budget for that
//! window. Spending more than the budget blocks the identity for the block
//! duration; a block outlives the window it started in.
//!
//! `X-Forwarded-For` is never consulted: the proxy is the client's direct
//! edge and any forwarding header is client-controlled.

use crate::config::{instant_after, RateLimitConfig};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of [`RateLimiter::consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Within budget; `remaining` points are left in the current window
    Allowed { remaining: u32 },
    /// Over budget or blocked; the client may retry after `retry_after`
    Exceeded { retry_after: Duration },
}

impl RateDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: Instant,
    consumed: u32,
    blocked_until: Option<Instant>,
}

impl WindowState {
    fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            consumed: 0,
            blocked_until: None,
        }
    }

    /// Neither the window nor a block is still running.
    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        let window_over = now >= instant_after(self.window_start, window);
        let block_over = self.blocked_until.map_or(true, |until| now >= until);
        window_over && block_over
    }
}

#[derive(Debug)]
struct Windows {
    entries: HashMap<IpAddr, WindowState>,
    last_sweep: Instant,
}

/// Fixed-window rate limiter with a post-exhaustion block.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    points: u32,
    block: Duration,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(window: Duration, points: u32, block: Duration) -> Self {
        Self {
            window,
            points,
            block,
            windows: Mutex::new(Windows {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.window(), config.max_requests, config.block())
    }

    /// Spend one point for `identity`.
    pub fn consume(&self, identity: IpAddr) -> RateDecision {
        self.consume_at(identity, Instant::now())
    }

    /// [`consume`](Self::consume) with an explicit clock reading.
    pub fn consume_at(&self, identity: IpAddr, now: Instant) -> RateDecision {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if now.saturating_duration_since(windows.last_sweep) >= self.window {
            let window = self.window;
            let before = windows.entries.len();
            windows.entries.retain(|_, state| !state.is_idle(now, window));
            windows.last_sweep = now;
            let evicted = before - windows.entries.len();
            if evicted > 0 {
                debug!(evicted, "Evicted idle rate-limit entries");
            }
        }

        let state = windows
            .entries
            .entry(identity)
            .or_insert_with(|| WindowState::fresh(now));

        if let Some(until) = state.blocked_until {
            if now < until {
                return RateDecision::Exceeded {
                    retry_after: until.saturating_duration_since(now),
                };
            }
            *state = WindowState::fresh(now);
        }

        let window_end = instant_after(state.window_start, self.window);
        if now >= window_end {
            *state = WindowState::fresh(now);
        }

        let window_end = instant_after(state.window_start, self.window);
        state.consumed = state.consumed.saturating_add(1);
        if state.consumed <= self.points {
            return RateDecision::Allowed {
                remaining: self.points - state.consumed,
            };
        }

        if self.block.is_zero() {
            RateDecision::Exceeded {
                retry_after: window_end.saturating_duration_since(now),
            }
        } else {
            let until = instant_after(now, self.block);
            state.blocked_until = Some(until);
            RateDecision::Exceeded {
                retry_after: until.saturating_duration_since(now),
            }
        }
    }

    /// Number of identities currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}
