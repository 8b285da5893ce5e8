//! Per-client fixed-window rate limiting.
//!
//! Each client gets `max_requests` requests per window; the counter resets
//! once the window expires. Clients are keyed by the first `X-Forwarded-For`
//! address, then the peer IP.

use async_trait::async_trait;
use dashmap::DashMap;
use esgate_kernel::config::RateLimitConfig;
use esgate_kernel::pipeline::{Middleware, Request, ResponseWriter};
use std::time::{Duration, Instant};
use tracing::warn;

struct ClientState {
    count: u64,
    window_start: Instant,
}

pub struct RateLimitMiddleware {
    clients: DashMap<String, ClientState>,
    max_requests: u64,
    window: Duration,
}

impl RateLimitMiddleware {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_requests,
            window,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            u64::from(config.max_requests),
            Duration::from_secs(config.window_secs),
        )
    }

    /// Return `true` if a request from `client` is allowed.
    pub fn check(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .clients
            .entry(client.to_string())
            .or_insert_with(|| ClientState {
                count: 0,
                window_start: now,
            });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        if entry.count < self.max_requests {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    /// Drop clients whose window has expired.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.clients
            .retain(|_, state| now.duration_since(state.window_start) < self.window);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn client_key(req: &Request) -> String {
        if let Some(forwarded) = req.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next().map(str::trim).filter(|s| !s.is_empty()) {
                return first.to_string();
            }
        }
        req.remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "anonymous".to_string())
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate-limit"
    }

    async fn handle(&self, req: &Request, w: &mut ResponseWriter) {
        let client = Self::client_key(req);
        if self.check(&client) {
            return;
        }
        warn!(request_id = %req.id, client = %client, "rate limit exceeded");
        w.set_header("retry-after", self.window.as_secs().max(1).to_string());
        w.error(429, "Rate limit exceeded");
    }
}
