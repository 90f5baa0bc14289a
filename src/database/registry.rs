//! Process-wide cache of live backend pools, keyed by connection id.
//!
//! A cached pool is only reused for the exact descriptor it was built from;
//! an edited descriptor replaces the pool on its next use.
//!
//! Every id owns a slot guarded by an async mutex. Lookups, probes, builds and
//! closes for one id are serialized on that mutex, so concurrent first requests
//! build exactly one pool while requests for other ids proceed independently.

use crate::database::descriptor::{BackendKind, ConnectionDescriptor};
use crate::database::pool::{ConnectionStatus, PooledConnection, RegistryMetrics};
use crate::database::traits::Connector;
use crate::error::{DatabaseError, DbResult};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Upper bound for a liveness probe.
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(15);

struct Slot<H> {
    connection: Option<Arc<PooledConnection<H>>>,
    /// Descriptor the cached connection was built from.
    built_from: Option<ConnectionDescriptor>,
    /// Set once the slot has been closed and unlinked from the map.
    retired: bool,
}

impl<H> Default for Slot<H> {
    fn default() -> Self {
        Self {
            connection: None,
            built_from: None,
            retired: false,
        }
    }
}

/// Outcome of a connection test.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub success: bool,
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Connection registry for one backend kind.
pub struct ConnectionRegistry<C: Connector> {
    connector: C,
    slots: DashMap<String, Arc<Mutex<Slot<C::Handle>>>>,
    probe_timeout: Duration,
    build_timeout: Duration,
    metrics: Arc<RegistryMetrics>,
}

impl<C: Connector> ConnectionRegistry<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
            probe_timeout: MAX_PROBE_TIMEOUT,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            metrics: Arc::new(RegistryMetrics::new()),
        }
    }

    /// Probe timeout, capped at [`MAX_PROBE_TIMEOUT`].
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout.min(MAX_PROBE_TIMEOUT);
        self
    }

    pub fn with_build_timeout(mut self, build_timeout: Duration) -> Self {
        self.build_timeout = build_timeout;
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.connector.kind()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    /// Number of ids with a slot, including ids whose build is in flight.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, id: &str) -> Arc<Mutex<Slot<C::Handle>>> {
        Arc::clone(
            self.slots
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
                .value(),
        )
    }

    /// Return a validated pool for the descriptor, building one if needed.
    ///
    /// A cached pool built from a different descriptor is closed and rebuilt.
    /// Otherwise it is probed first; a failed or timed-out probe evicts and
    /// closes it, then a fresh pool is built. Failed builds are never cached
    /// and leave no slot behind.
    #[instrument(skip(self, descriptor), fields(connection_id = %descriptor.id, backend = %self.kind()))]
    pub async fn get_or_create(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> DbResult<Arc<PooledConnection<C::Handle>>> {
        loop {
            let slot = self.slot(&descriptor.id);
            let mut guard = slot.lock().await;
            if guard.retired {
                // Closed while we waited; the next iteration picks up a fresh slot.
                continue;
            }

            if let Some(connection) = guard.connection.clone()
                && guard.built_from.as_ref() != Some(descriptor)
            {
                info!("Descriptor changed, replacing pool");
                guard.connection = None;
                guard.built_from = None;
                connection.set_status(ConnectionStatus::Closed);
                self.connector.close(connection.handle()).await;
                self.metrics.record_eviction();
            }

            if let Some(connection) = guard.connection.clone() {
                match self.probe(&connection).await {
                    Ok(()) => {
                        debug!("Reusing validated pool");
                        return Ok(connection);
                    }
                    Err(e) => {
                        warn!("Probe failed, evicting pool: {}", e);
                        guard.connection = None;
                        guard.built_from = None;
                        connection.set_status(ConnectionStatus::Error);
                        self.connector.close(connection.handle()).await;
                        self.metrics.record_eviction();
                    }
                }
            }

            let connection = match self.build(descriptor).await {
                Ok(built) => Arc::new(built),
                Err(e) => {
                    // Waiters on this slot move on to a fresh one.
                    guard.retired = true;
                    self.slots
                        .remove_if(&descriptor.id, |_, current| Arc::ptr_eq(current, &slot));
                    return Err(e);
                }
            };
            guard.connection = Some(Arc::clone(&connection));
            guard.built_from = Some(descriptor.clone());
            return Ok(connection);
        }
    }

    async fn build(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> DbResult<PooledConnection<C::Handle>> {
        let started = Instant::now();
        let result = timeout(self.build_timeout, self.connector.build(descriptor))
            .await
            .map_err(|_| DatabaseError::Timeout(self.build_timeout.as_millis() as u64))
            .and_then(|built| built);

        match result {
            Ok(handle) => {
                self.metrics.record_pool_built();
                info!(
                    "Pool built in {}ms",
                    started.elapsed().as_millis()
                );
                Ok(PooledConnection::new(descriptor.id.clone(), handle))
            }
            Err(e) => {
                self.metrics.record_build_failure();
                warn!("Pool build failed: {}", e);
                Err(e)
            }
        }
    }

    async fn probe(&self, connection: &PooledConnection<C::Handle>) -> DbResult<()> {
        self.metrics.record_probe();
        let result = timeout(self.probe_timeout, self.connector.probe(connection.handle()))
            .await
            .map_err(|_| DatabaseError::Timeout(self.probe_timeout.as_millis() as u64))
            .and_then(|probed| probed);

        match result {
            Ok(()) => {
                connection.mark_validated();
                Ok(())
            }
            Err(e) => {
                self.metrics.record_probe_failure();
                Err(e)
            }
        }
    }

    /// Close and forget the pool for `id`. Returns whether a pool was closed.
    ///
    /// Closing an unknown id is a no-op; a later `get_or_create` builds afresh.
    #[instrument(skip(self))]
    pub async fn close(&self, id: &str) -> bool {
        let Some(slot) = self.slots.get(id).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };

        let mut guard = slot.lock().await;
        if guard.retired {
            return false;
        }
        guard.retired = true;
        self.slots
            .remove_if(id, |_, current| Arc::ptr_eq(current, &slot));

        guard.built_from = None;
        let Some(connection) = guard.connection.take() else {
            return false;
        };
        connection.set_status(ConnectionStatus::Closed);
        self.connector.close(connection.handle()).await;
        self.metrics.record_close();
        info!("Closed pool for connection {}", id);
        true
    }

    /// Close every pool. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            if self.close(&id).await {
                closed += 1;
            }
        }
        info!("Closed {} {} pools", closed, self.kind());
        closed
    }

    /// Build or validate the pool for a descriptor without surfacing the error.
    pub async fn test_connection(&self, descriptor: &ConnectionDescriptor) -> TestOutcome {
        let started = Instant::now();
        let result = self.get_or_create(descriptor).await;
        TestOutcome {
            success: result.is_ok(),
            backend: self.kind(),
            error: result.err().map(|e| e.to_string()),
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Status of the pool for `id`, `Connecting` while its slot is busy.
    pub fn status(&self, id: &str) -> Option<ConnectionStatus> {
        let slot = self.slots.get(id).map(|entry| Arc::clone(entry.value()))?;
        match slot.try_lock() {
            Ok(guard) => guard.connection.as_ref().map(|c| c.status()),
            Err(_) => Some(ConnectionStatus::Connecting),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::MockConnector;
    use std::sync::atomic::Ordering;

    fn descriptor(id: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::new(id, BackendKind::Document).host("localhost")
    }

    #[tokio::test]
    async fn test_reuses_cached_pool() {
        let connector = MockConnector::new(BackendKind::Document);
        let builds = connector.builds();
        let registry = ConnectionRegistry::new(connector);

        let first = registry.get_or_create(&descriptor("c1")).await.unwrap();
        let second = registry.get_or_create(&descriptor("c1")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(registry.metrics().snapshot().probes, 1);
        assert_eq!(registry.status("c1"), Some(ConnectionStatus::Connected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_build_once() {
        let connector = MockConnector::new(BackendKind::Document)
            .with_build_delay(Duration::from_millis(50));
        let builds = connector.builds();
        let registry = Arc::new(ConnectionRegistry::new(connector));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create(&descriptor("c1")).await })
            })
            .collect();

        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.unwrap().unwrap());
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(connections.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_ids_build_in_parallel() {
        let connector = MockConnector::new(BackendKind::Document)
            .with_build_delay(Duration::from_millis(200));
        let builds = connector.builds();
        let registry = Arc::new(ConnectionRegistry::new(connector));

        let started = Instant::now();
        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry.get_or_create(&descriptor(&format!("c{}", i))).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(builds.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() < Duration::from_millis(700));
        assert_eq!(registry.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_probe_evicts_and_rebuilds() {
        let connector = MockConnector::new(BackendKind::Document);
        let builds = connector.builds();
        let closes = connector.closes();
        let probe_ok = connector.probe_switch();
        let registry = ConnectionRegistry::new(connector);

        let first = registry.get_or_create(&descriptor("c1")).await.unwrap();
        probe_ok.store(false, Ordering::SeqCst);
        let second = registry.get_or_create(&descriptor("c1")).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.status(), ConnectionStatus::Error);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.metrics().snapshot().evictions, 1);
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_failure() {
        let connector = MockConnector::new(BackendKind::Document)
            .with_probe_delay(Duration::from_millis(200));
        let builds = connector.builds();
        let registry =
            ConnectionRegistry::new(connector).with_probe_timeout(Duration::from_millis(20));

        registry.get_or_create(&descriptor("c1")).await.unwrap();
        registry.get_or_create(&descriptor("c1")).await.unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(registry.metrics().snapshot().probe_failures, 1);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_capped() {
        let registry = ConnectionRegistry::new(MockConnector::new(BackendKind::Document))
            .with_probe_timeout(Duration::from_secs(60));
        assert_eq!(registry.probe_timeout, MAX_PROBE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_failed_build_is_not_cached() {
        let connector = MockConnector::new(BackendKind::Document);
        let builds = connector.builds();
        let build_ok = connector.build_switch();
        let registry = ConnectionRegistry::new(connector);

        build_ok.store(false, Ordering::SeqCst);
        let err = registry.get_or_create(&descriptor("c1")).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(registry.status("c1"), None);
        assert!(registry.is_empty());

        build_ok.store(true, Ordering::SeqCst);
        registry.get_or_create(&descriptor("c1")).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(registry.metrics().snapshot().build_failures, 1);
    }

    #[tokio::test]
    async fn test_build_timeout() {
        let connector = MockConnector::new(BackendKind::Document)
            .with_build_delay(Duration::from_millis(200));
        let registry =
            ConnectionRegistry::new(connector).with_build_timeout(Duration::from_millis(20));

        let err = registry.get_or_create(&descriptor("c1")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Timeout(20)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_build_releases_waiters() {
        let connector = MockConnector::new(BackendKind::Document)
            .with_build_delay(Duration::from_millis(50));
        let builds = connector.builds();
        let build_ok = connector.build_switch();
        build_ok.store(false, Ordering::SeqCst);
        let registry = Arc::new(ConnectionRegistry::new(connector));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create(&descriptor("c1")).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_err());
        }

        // Each waiter retried on a fresh slot rather than reusing a dead one.
        assert_eq!(builds.load(Ordering::SeqCst), 4);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_edited_descriptor_replaces_pool() {
        let connector = MockConnector::new(BackendKind::Document);
        let builds = connector.builds();
        let closes = connector.closes();
        let registry = ConnectionRegistry::new(connector);

        let original = registry.get_or_create(&descriptor("c1")).await.unwrap();
        let edited = ConnectionDescriptor::new("c1", BackendKind::Document).host("replica.internal");
        let replaced = registry.get_or_create(&edited).await.unwrap();

        assert!(!Arc::ptr_eq(&original, &replaced));
        assert_eq!(original.status(), ConnectionStatus::Closed);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);

        // Same descriptor again: cached pool is reused.
        let again = registry.get_or_create(&edited).await.unwrap();
        assert!(Arc::ptr_eq(&replaced, &again));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rebuilds_lazily() {
        let connector = MockConnector::new(BackendKind::Document);
        let builds = connector.builds();
        let closes = connector.closes();
        let registry = ConnectionRegistry::new(connector);

        let first = registry.get_or_create(&descriptor("c1")).await.unwrap();
        assert!(registry.close("c1").await);
        assert!(!registry.close("c1").await);
        assert!(!registry.close("never-opened").await);
        assert_eq!(first.status(), ConnectionStatus::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());

        registry.get_or_create(&descriptor("c1")).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_during_build_leaves_no_orphan() {
        let connector = MockConnector::new(BackendKind::Document)
            .with_build_delay(Duration::from_millis(100));
        let closes = connector.closes();
        let registry = Arc::new(ConnectionRegistry::new(connector));

        let building = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_or_create(&descriptor("c1")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.status("c1"), Some(ConnectionStatus::Connecting));

        // Waits for the build, then closes the pool it produced.
        assert!(registry.close("c1").await);
        let built = building.await.unwrap().unwrap();

        assert_eq!(built.status(), ConnectionStatus::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all() {
        let connector = MockConnector::new(BackendKind::Document);
        let closes = connector.closes();
        let registry = ConnectionRegistry::new(connector);

        for id in ["a", "b", "c"] {
            registry.get_or_create(&descriptor(id)).await.unwrap();
        }
        assert_eq!(registry.close_all().await, 3);
        assert_eq!(closes.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.metrics().snapshot().closes, 3);
    }

    #[tokio::test]
    async fn test_test_connection_reports_failure() {
        let connector = MockConnector::new(BackendKind::Document);
        connector.build_switch().store(false, Ordering::SeqCst);
        let registry = ConnectionRegistry::new(connector);

        let outcome = registry.test_connection(&descriptor("c1")).await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        assert_eq!(outcome.backend, BackendKind::Document);
    }
}
