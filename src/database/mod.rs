//! Database abstraction layer.
//!
//! Two backends sit behind one [`Connector`] capability:
//!
//! - [`MongoConnector`] - document store, one driver client per descriptor
//! - [`PostgresConnector`] - relational store, one deadpool per descriptor
//!
//! A [`ConnectionRegistry`] per backend kind caches the live pools by
//! connection id and probes them before reuse.

pub mod connection_string;
pub mod descriptor;
pub mod mongo;
pub mod pool;
pub mod postgres;
pub mod registry;
pub mod result;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use connection_string::{
    ConnectionBuilder, ConnectionTarget, DocumentTarget, RelationalEndpoint, RelationalTarget,
    TlsMode,
};
pub use descriptor::{
    BackendKind, ConnectionDescriptor, DescriptorStore, InMemoryDescriptorStore, PoolBounds,
};
pub use mongo::{MongoConnector, MongoHandle};
pub use pool::{
    ConnectionStatus, PoolSettings, PooledConnection, RegistryMetrics, RegistryMetricsSnapshot,
};
pub use postgres::{PgHandle, PostgresConnector};
pub use registry::{ConnectionRegistry, MAX_PROBE_TIMEOUT, TestOutcome};
pub use result::*;
pub use traits::{Connector, DocumentBackend, RelationalBackend};
