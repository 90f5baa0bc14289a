//! Backend connector and operation traits.

use crate::database::descriptor::{BackendKind, ConnectionDescriptor};
use crate::database::result::{CollectionInfo, SqlResult, TableInfo, WriteSummary};
use crate::error::DbResult;
use crate::security::{SanitizedQuery, ValidatedStatement};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Builds, probes and closes backend pools.
///
/// The registry owns every handle a connector produces and is the only
/// caller of [`close`](Connector::close).
///
/// Implementations: [`MongoConnector`](crate::database::MongoConnector),
/// [`PostgresConnector`](crate::database::PostgresConnector).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// A ready-to-use pool.
    type Handle: Send + Sync + 'static;

    fn kind(&self) -> BackendKind;

    /// Build a pool for the descriptor and verify it can reach the backend.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ConnectionFailed`](crate::error::DatabaseError::ConnectionFailed)
    /// when the backend is unreachable or rejects the credentials.
    async fn build(&self, descriptor: &ConnectionDescriptor) -> DbResult<Self::Handle>;

    /// Cheap round trip proving the pool is still usable.
    async fn probe(&self, handle: &Self::Handle) -> DbResult<()>;

    /// Release the pool. Must not fail; errors are logged by the implementation.
    async fn close(&self, handle: &Self::Handle);
}

/// Operations of a document-store pool.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    async fn list_databases(&self) -> DbResult<Vec<String>>;

    async fn list_collections(&self, database: &str) -> DbResult<Vec<CollectionInfo>>;

    /// Returns the page of documents and the total matching the filter.
    async fn find(
        &self,
        database: &str,
        collection: &str,
        query: &SanitizedQuery,
    ) -> DbResult<(Vec<Value>, u64)>;

    async fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: &[Value],
    ) -> DbResult<Vec<Value>>;

    async fn insert_one(
        &self,
        database: &str,
        collection: &str,
        document: &Map<String, Value>,
    ) -> DbResult<WriteSummary>;

    async fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: &Map<String, Value>,
        update: &Map<String, Value>,
    ) -> DbResult<WriteSummary>;

    async fn delete_many(
        &self,
        database: &str,
        collection: &str,
        filter: &Map<String, Value>,
    ) -> DbResult<WriteSummary>;
}

/// Operations of a relational pool.
#[async_trait]
pub trait RelationalBackend: Send + Sync {
    /// Lists user schemas, system schemas excluded.
    async fn list_schemas(&self) -> DbResult<Vec<String>>;

    /// Lists tables and views in a schema.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::NotFound`](crate::error::DatabaseError::NotFound)
    /// if the schema does not exist.
    async fn list_tables(&self, schema: &str) -> DbResult<Vec<TableInfo>>;

    /// Executes one validated statement with its bound parameters.
    async fn execute(&self, statement: &ValidatedStatement) -> DbResult<SqlResult>;
}
