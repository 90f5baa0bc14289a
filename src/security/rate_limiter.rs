//! Fixed-window rate limiter keyed by caller identity and route.

use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Requests per window for routes without an explicit limit.
    pub default_limit: u32,
    /// Per-route request ceilings.
    pub routes: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let routes = [
            ("test_connection", 10),
            ("execute_sql", 30),
            ("aggregate", 30),
            ("find_documents", 60),
        ]
        .into_iter()
        .map(|(route, limit)| (route.to_string(), limit))
        .collect();

        Self {
            window_ms: 60_000,
            default_limit: 100,
            routes,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn limit_for(&self, route: &str) -> u32 {
        self.routes.get(route).copied().unwrap_or(self.default_limit)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

impl Window {
    fn fresh(now: Instant, length: Duration) -> Self {
        Self {
            count: 1,
            reset_at: now + length,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.reset_at
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub admitted: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    #[serde(skip)]
    pub retry_after: Duration,
}

/// Fixed-window rate limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<(String, String), Window>,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Check and count one request for `(identity, route)`.
    pub fn admit(&self, identity: &str, route: &str) -> Admission {
        self.admit_at(identity, route, Instant::now())
    }

    /// Like [`admit`](Self::admit), but a denial becomes [`GatewayError::RateLimited`].
    pub fn enforce(&self, identity: &str, route: &str) -> Result<Admission, GatewayError> {
        let admission = self.admit(identity, route);
        if admission.admitted {
            return Ok(admission);
        }
        Err(GatewayError::RateLimited {
            route: route.to_string(),
            reset_at: admission.reset_at,
            retry_after_ms: admission.retry_after.as_millis() as u64,
        })
    }

    fn admit_at(&self, identity: &str, route: &str, now: Instant) -> Admission {
        self.maybe_sweep(now);

        let limit = self.config.limit_for(route);
        let length = self.config.window();

        // The entry guard holds the shard lock, so increment-and-compare is atomic per key.
        let (admitted, window) = match self.windows.entry((identity.to_string(), route.to_string())) {
            Entry::Vacant(slot) => {
                let window = Window::fresh(now, length);
                slot.insert(window);
                (limit > 0, window)
            }
            Entry::Occupied(mut slot) => {
                let window = slot.get_mut();
                if window.is_expired(now) {
                    *window = Window::fresh(now, length);
                    (limit > 0, *window)
                } else if window.count < limit {
                    window.count += 1;
                    (true, *window)
                } else {
                    (false, *window)
                }
            }
        };

        let retry_after = window.reset_at.saturating_duration_since(now);
        let reset_at = Utc::now()
            + chrono::Duration::from_std(retry_after).unwrap_or_else(|_| chrono::Duration::zero());

        if admitted {
            debug!(
                "Admitted {} on {}: {}/{} in window",
                identity, route, window.count, limit
            );
        } else {
            warn!(
                identity = %identity,
                route = %route,
                limit,
                "Rate limit exceeded, retry in {}ms",
                retry_after.as_millis()
            );
        }

        Admission {
            admitted,
            limit,
            remaining: limit.saturating_sub(window.count),
            reset_at,
            retry_after,
        }
    }

    /// Drop expired windows at most once per window length.
    fn maybe_sweep(&self, now: Instant) {
        let Some(mut last_sweep) = self.last_sweep.try_lock() else {
            return;
        };
        if now.saturating_duration_since(*last_sweep) < self.config.window() {
            return;
        }
        *last_sweep = now;
        drop(last_sweep);

        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        debug!(
            "Swept {} expired rate limit windows",
            before.saturating_sub(self.windows.len())
        );
    }

    /// Number of tracked windows, expired ones included until swept.
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Rate limiter builder.
#[derive(Default)]
pub struct RateLimiterBuilder {
    config: RateLimitConfig,
}

impl RateLimiterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window_ms = window.as_millis() as u64;
        self
    }

    pub fn default_limit(mut self, limit: u32) -> Self {
        self.config.default_limit = limit;
        self
    }

    pub fn route_limit(mut self, route: impl Into<String>, limit: u32) -> Self {
        self.config.routes.insert(route.into(), limit);
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter::new(self.config)
    }
}
