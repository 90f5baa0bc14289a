//! Gateway composition root.
//!
//! Every operation follows the same path: the caller is admitted by the
//! [`RateLimiter`], the connection descriptor is resolved for the calling
//! user, the backend registry supplies a validated pool, the payload is
//! sanitized, and only then does the backend see the request.

use crate::config::GatewayConfig;
use crate::database::{
    AggregateResult, BackendKind, CollectionInfo, ConnectionDescriptor, ConnectionRegistry,
    Connector, DescriptorStore, DocumentBackend, FindResult, MongoConnector, PooledConnection,
    PostgresConnector, RegistryMetricsSnapshot, RelationalBackend, SqlResult, TableInfo,
    TestOutcome, WriteSummary,
};
use crate::error::{
    ConfigError, DatabaseError, DbResult, GatewayError, RejectionKind, Result, SanitizationError,
};
use crate::security::document::type_name;
use crate::security::{DocumentQuerySanitizer, RateLimiter, StatementGuard};
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Route names used for rate limiting and logging.
pub mod routes {
    pub const TEST_CONNECTION: &str = "test_connection";
    pub const LIST_DATABASES: &str = "list_databases";
    pub const LIST_SCHEMAS: &str = "list_schemas";
    pub const LIST_COLLECTIONS: &str = "list_collections";
    pub const LIST_TABLES: &str = "list_tables";
    pub const FIND_DOCUMENTS: &str = "find_documents";
    pub const AGGREGATE: &str = "aggregate";
    pub const INSERT_DOCUMENT: &str = "insert_document";
    pub const UPDATE_DOCUMENTS: &str = "update_documents";
    pub const DELETE_DOCUMENTS: &str = "delete_documents";
    pub const EXECUTE_SQL: &str = "execute_sql";
    pub const CLOSE_CONNECTION: &str = "close_connection";
}

const DEFAULT_SCHEMA: &str = "public";

/// Who is calling: the owner of the connection records and the rate-limit identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: String,
    pub identity: String,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            identity: identity.into(),
        }
    }

    /// Context whose rate-limit identity is the user id itself.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            identity: user_id.clone(),
            user_id,
        }
    }
}

/// Registry counters for both backends.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMetrics {
    pub document: RegistryMetricsSnapshot,
    pub relational: RegistryMetricsSnapshot,
}

/// The gateway: one registry per backend kind plus the admission and sanitization layers.
pub struct Gateway<D: Connector = MongoConnector, R: Connector = PostgresConnector> {
    config: GatewayConfig,
    store: Arc<dyn DescriptorStore>,
    rate_limiter: RateLimiter,
    documents: ConnectionRegistry<D>,
    relational: ConnectionRegistry<R>,
    sanitizer: DocumentQuerySanitizer,
    guard: StatementGuard,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }
}

impl<D, R> Gateway<D, R>
where
    D: Connector,
    D::Handle: DocumentBackend,
    R: Connector,
    R::Handle: RelationalBackend,
{
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn document_registry(&self) -> &ConnectionRegistry<D> {
        &self.documents
    }

    pub fn relational_registry(&self) -> &ConnectionRegistry<R> {
        &self.relational
    }

    pub fn metrics(&self) -> GatewayMetrics {
        GatewayMetrics {
            document: self.documents.metrics().snapshot(),
            relational: self.relational.metrics().snapshot(),
        }
    }

    /// Build or probe the pool behind a connection and report the outcome.
    ///
    /// Connection failures are reported in the outcome rather than as an error.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn test_connection(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
    ) -> Result<TestOutcome> {
        let descriptor = self.admit(ctx, routes::TEST_CONNECTION, connection_id).await?;
        let outcome = match descriptor.backend_kind {
            BackendKind::Document => self.documents.test_connection(&descriptor).await,
            BackendKind::Relational => self.relational.test_connection(&descriptor).await,
        };
        info!(
            success = outcome.success,
            latency_ms = outcome.latency_ms,
            "Connection test finished"
        );
        Ok(outcome)
    }

    /// Database names for a document store, schema names for a relational one.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn list_databases(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
    ) -> Result<Vec<String>> {
        let descriptor = self.admit(ctx, routes::LIST_DATABASES, connection_id).await?;
        match descriptor.backend_kind {
            BackendKind::Document => {
                let connection = self.documents.get_or_create(&descriptor).await?;
                self.run(connection.list_databases()).await
            }
            BackendKind::Relational => {
                let connection = self.relational.get_or_create(&descriptor).await?;
                self.run(connection.list_schemas()).await
            }
        }
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn list_schemas(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
    ) -> Result<Vec<String>> {
        let connection = self
            .relational_connection(ctx, routes::LIST_SCHEMAS, connection_id)
            .await?;
        self.run(connection.list_schemas()).await
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn list_collections(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        database: &str,
    ) -> Result<Vec<CollectionInfo>> {
        let connection = self
            .document_connection(ctx, routes::LIST_COLLECTIONS, connection_id)
            .await?;
        self.run(connection.list_collections(database)).await
    }

    /// Tables of one schema, `public` when none is given.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn list_tables(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableInfo>> {
        let connection = self
            .relational_connection(ctx, routes::LIST_TABLES, connection_id)
            .await?;
        let schema = schema.filter(|s| !s.trim().is_empty()).unwrap_or(DEFAULT_SCHEMA);
        self.run(connection.list_tables(schema)).await
    }

    #[instrument(skip(self, ctx, params), fields(user = %ctx.user_id))]
    pub async fn find_documents(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        database: &str,
        collection: &str,
        params: &Value,
    ) -> Result<FindResult> {
        let connection = self
            .document_connection(ctx, routes::FIND_DOCUMENTS, connection_id)
            .await?;
        let query = self
            .sanitizer
            .sanitize_query_params(params)
            .map_err(GatewayError::QueryRejected)?;

        let (documents, total) = self
            .run(connection.find(database, collection, &query))
            .await?;
        debug!("Returned {} of {} documents", documents.len(), total);
        Ok(FindResult::new(documents, total, query.skip, query.limit))
    }

    #[instrument(skip(self, ctx, pipeline), fields(user = %ctx.user_id))]
    pub async fn aggregate(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        database: &str,
        collection: &str,
        pipeline: &Value,
    ) -> Result<AggregateResult> {
        let connection = self
            .document_connection(ctx, routes::AGGREGATE, connection_id)
            .await?;
        let stages = self
            .sanitizer
            .sanitize_pipeline(pipeline)
            .map_err(GatewayError::QueryRejected)?;

        let documents = self
            .run(connection.aggregate(database, collection, &stages))
            .await?;
        Ok(AggregateResult { documents })
    }

    #[instrument(skip(self, ctx, document), fields(user = %ctx.user_id))]
    pub async fn insert_document(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        database: &str,
        collection: &str,
        document: &Value,
    ) -> Result<WriteSummary> {
        let connection = self
            .document_connection(ctx, routes::INSERT_DOCUMENT, connection_id)
            .await?;
        let document = self
            .sanitizer
            .sanitize_document(document)
            .map_err(GatewayError::QueryRejected)?;

        self.run(connection.insert_one(database, collection, &document))
            .await
    }

    #[instrument(skip(self, ctx, filter, update), fields(user = %ctx.user_id))]
    pub async fn update_documents(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        database: &str,
        collection: &str,
        filter: &Value,
        update: &Value,
    ) -> Result<WriteSummary> {
        let connection = self
            .document_connection(ctx, routes::UPDATE_DOCUMENTS, connection_id)
            .await?;
        let filter = self.filter_map(filter)?;
        let update = self
            .sanitizer
            .sanitize_update(update)
            .map_err(GatewayError::QueryRejected)?;

        self.run(connection.update_many(database, collection, &filter, &update))
            .await
    }

    /// Delete matching documents. An empty filter is rejected.
    #[instrument(skip(self, ctx, filter), fields(user = %ctx.user_id))]
    pub async fn delete_documents(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        database: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<WriteSummary> {
        let connection = self
            .document_connection(ctx, routes::DELETE_DOCUMENTS, connection_id)
            .await?;
        let filter = self.filter_map(filter)?;
        if filter.is_empty() {
            warn!("Delete without a filter rejected");
            return Err(GatewayError::QueryRejected(SanitizationError::new(
                RejectionKind::EmptyFilter,
                "{}",
                "delete requires a non-empty filter",
            )));
        }

        self.run(connection.delete_many(database, collection, &filter))
            .await
    }

    /// Run one SQL statement with positional parameters.
    #[instrument(skip(self, ctx, sql, params), fields(user = %ctx.user_id, params = params.len()))]
    pub async fn execute_sql(
        &self,
        ctx: &RequestContext,
        connection_id: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<SqlResult> {
        let connection = self
            .relational_connection(ctx, routes::EXECUTE_SQL, connection_id)
            .await?;
        let statement = self
            .guard
            .validate_parameterized_statement(sql, params)
            .map_err(GatewayError::SqlInjection)?;

        let result = self.run(connection.execute(&statement)).await?;
        info!(
            rows = result.row_count,
            elapsed_ms = result.execution_time_ms,
            "Statement executed"
        );
        Ok(result)
    }

    /// Close the pool behind a connection owned by the caller.
    #[instrument(skip(self, ctx), fields(user = %ctx.user_id))]
    pub async fn close_connection(&self, ctx: &RequestContext, connection_id: &str) -> Result<bool> {
        let descriptor = self
            .admit(ctx, routes::CLOSE_CONNECTION, connection_id)
            .await?;
        let closed = match descriptor.backend_kind {
            BackendKind::Document => self.documents.close(&descriptor.id).await,
            BackendKind::Relational => self.relational.close(&descriptor.id).await,
        };
        Ok(closed)
    }

    /// Close every cached pool of both backends.
    pub async fn close_all(&self) -> usize {
        let closed = self.documents.close_all().await + self.relational.close_all().await;
        info!("Gateway closed {} pools", closed);
        closed
    }

    async fn admit(
        &self,
        ctx: &RequestContext,
        route: &'static str,
        connection_id: &str,
    ) -> Result<ConnectionDescriptor> {
        self.rate_limiter.enforce(&ctx.identity, route)?;
        let descriptor = self.store.get_descriptor(&ctx.user_id, connection_id).await?;
        debug!(
            connection_id = %descriptor.id,
            backend = %descriptor.backend_kind,
            "Descriptor resolved"
        );
        Ok(descriptor)
    }

    async fn document_connection(
        &self,
        ctx: &RequestContext,
        route: &'static str,
        connection_id: &str,
    ) -> Result<Arc<PooledConnection<D::Handle>>> {
        let descriptor = self.admit(ctx, route, connection_id).await?;
        require_kind(&descriptor, BackendKind::Document, route)?;
        Ok(self.documents.get_or_create(&descriptor).await?)
    }

    async fn relational_connection(
        &self,
        ctx: &RequestContext,
        route: &'static str,
        connection_id: &str,
    ) -> Result<Arc<PooledConnection<R::Handle>>> {
        let descriptor = self.admit(ctx, route, connection_id).await?;
        require_kind(&descriptor, BackendKind::Relational, route)?;
        Ok(self.relational.get_or_create(&descriptor).await?)
    }

    /// Sanitize a write filter; `null` means match everything.
    fn filter_map(&self, filter: &Value) -> Result<Map<String, Value>> {
        match filter {
            Value::Null => Ok(Map::new()),
            Value::Object(_) => match self
                .sanitizer
                .sanitize_filter(filter)
                .map_err(GatewayError::QueryRejected)?
            {
                Value::Object(map) => Ok(map),
                _ => Ok(Map::new()),
            },
            other => Err(GatewayError::QueryRejected(SanitizationError::new(
                RejectionKind::InvalidShape,
                type_name(other),
                "filter must be an object",
            ))),
        }
    }

    async fn run<T>(&self, operation: impl Future<Output = DbResult<T>>) -> Result<T> {
        let limit = self.config.timeouts.query_timeout();
        let result = timeout(limit, operation)
            .await
            .map_err(|_| DatabaseError::Timeout(limit.as_millis() as u64))?;
        Ok(result?)
    }
}

fn require_kind(
    descriptor: &ConnectionDescriptor,
    expected: BackendKind,
    operation: &'static str,
) -> Result<()> {
    if descriptor.backend_kind == expected {
        return Ok(());
    }
    warn!(
        connection_id = %descriptor.id,
        "Operation {} not available on {} connections", operation, descriptor.backend_kind
    );
    Err(GatewayError::UnsupportedOperation {
        operation,
        backend: descriptor.backend_kind.as_str(),
    })
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder<D = MongoConnector, R = PostgresConnector> {
    config: Option<GatewayConfig>,
    store: Option<Arc<dyn DescriptorStore>>,
    document_connector: D,
    relational_connector: R,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            document_connector: MongoConnector::new(),
            relational_connector: PostgresConnector::new(),
        }
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, R> GatewayBuilder<D, R> {
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn DescriptorStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the backend connectors.
    pub fn connectors<D2, R2>(self, documents: D2, relational: R2) -> GatewayBuilder<D2, R2> {
        GatewayBuilder {
            config: self.config,
            store: self.store,
            document_connector: documents,
            relational_connector: relational,
        }
    }
}

impl<D, R> GatewayBuilder<D, R>
where
    D: Connector,
    D::Handle: DocumentBackend,
    R: Connector,
    R::Handle: RelationalBackend,
{
    pub fn build(self) -> Result<Gateway<D, R>> {
        let store = self
            .store
            .ok_or(ConfigError::MissingField("store".into()))?;
        let config = self.config.unwrap_or_default();
        let timeouts = config.timeouts;

        if self.document_connector.kind() != BackendKind::Document
            || self.relational_connector.kind() != BackendKind::Relational
        {
            return Err(ConfigError::InvalidValue {
                field: "connectors".into(),
                message: "connectors are registered for the wrong backend kind".into(),
            }
            .into());
        }

        let documents = ConnectionRegistry::new(self.document_connector)
            .with_probe_timeout(timeouts.probe_timeout())
            .with_build_timeout(timeouts.build_timeout());
        let relational = ConnectionRegistry::new(self.relational_connector)
            .with_probe_timeout(timeouts.probe_timeout())
            .with_build_timeout(timeouts.build_timeout());

        info!("Gateway {} v{} ready", config.name, config.version);
        Ok(Gateway {
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            sanitizer: DocumentQuerySanitizer::new(config.document_policy.clone()),
            guard: StatementGuard::new(config.sql_policy.clone()),
            store,
            documents,
            relational,
            config,
        })
    }
}
