//! Pool settings, pooled connection entries and registry metrics.

use crate::database::descriptor::PoolBounds;
use crate::error::ConfigError;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sizing and timing for one backend pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_size: u32,
    pub min_size: u32,
    pub connect_timeout: Duration,
    /// Idle connections older than this are pruned.
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_size: 2,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolSettings {
    /// Apply descriptor bounds over the defaults.
    pub fn from_bounds(bounds: &PoolBounds) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_size = bounds.max_size.unwrap_or(defaults.max_size);
        if max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool.max_size".into(),
                message: "must be at least 1".into(),
            });
        }
        let min_size = bounds.min_size.unwrap_or(defaults.min_size).min(max_size);

        Ok(Self {
            max_size,
            min_size,
            ..defaults
        })
    }
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
    Closed,
}

/// A live backend handle owned by the registry.
pub struct PooledConnection<H> {
    id: String,
    handle: H,
    status: RwLock<ConnectionStatus>,
    last_validated_at: RwLock<Instant>,
    created_at: Instant,
}

impl<H> PooledConnection<H> {
    pub fn new(id: impl Into<String>, handle: H) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            handle,
            status: RwLock::new(ConnectionStatus::Connected),
            last_validated_at: RwLock::new(now),
            created_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn last_validated_at(&self) -> Instant {
        *self.last_validated_at.read()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }

    pub(crate) fn mark_validated(&self) {
        *self.last_validated_at.write() = Instant::now();
        self.set_status(ConnectionStatus::Connected);
    }
}

impl<H> std::fmt::Debug for PooledConnection<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<H> std::ops::Deref for PooledConnection<H> {
    type Target = H;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

/// Registry counters for monitoring.
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    pub pools_built: AtomicU64,
    pub build_failures: AtomicU64,
    pub probes: AtomicU64,
    pub probe_failures: AtomicU64,
    pub evictions: AtomicU64,
    pub closes: AtomicU64,
}

impl RegistryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pool_built(&self) {
        self.pools_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_failure(&self) {
        self.build_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_failure(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RegistryMetricsSnapshot {
        RegistryMetricsSnapshot {
            pools_built: self.pools_built.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryMetricsSnapshot {
    pub pools_built: u64,
    pub build_failures: u64,
    pub probes: u64,
    pub probe_failures: u64,
    pub evictions: u64,
    pub closes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_settings_default() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_size, 10);
        assert_eq!(settings.min_size, 2);
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_pool_settings_from_bounds() {
        let settings = PoolSettings::from_bounds(&PoolBounds {
            max_size: Some(4),
            min_size: Some(8),
        })
        .unwrap();
        assert_eq!(settings.max_size, 4);
        assert_eq!(settings.min_size, 4);

        assert!(
            PoolSettings::from_bounds(&PoolBounds {
                max_size: Some(0),
                min_size: None,
            })
            .is_err()
        );
    }

    #[test]
    fn test_pooled_connection_status() {
        let conn = PooledConnection::new("c1", ());
        assert_eq!(conn.status(), ConnectionStatus::Connected);
        conn.set_status(ConnectionStatus::Error);
        assert_eq!(conn.status(), ConnectionStatus::Error);
        conn.mark_validated();
        assert_eq!(conn.status(), ConnectionStatus::Connected);
        assert!(conn.last_validated_at() >= conn.created_at());
    }

    #[test]
    fn test_pooled_connection_debug_without_handle_debug() {
        struct Opaque;
        let conn = PooledConnection::new("c1", Opaque);
        let debug = format!("{:?}", conn);
        assert!(debug.contains("c1"));
        assert!(debug.contains("Connected"));
    }

    #[test]
    fn test_registry_metrics() {
        let metrics = RegistryMetrics::new();
        metrics.record_pool_built();
        metrics.record_probe();
        metrics.record_probe();
        metrics.record_probe_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pools_built, 1);
        assert_eq!(snapshot.probes, 2);
        assert_eq!(snapshot.probe_failures, 1);
    }
}
