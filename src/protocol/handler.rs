//! Request decoding and dispatch onto the gateway.

use crate::database::{Connector, DocumentBackend, RelationalBackend};
use crate::error::{GatewayError, ProtocolError, Result};
use crate::gateway::{Gateway, RequestContext};
use crate::protocol::types::{Operation, Request, RequestId, Response};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Routes decoded requests to gateway operations.
pub struct Dispatcher<D: Connector, R: Connector> {
    gateway: Arc<Gateway<D, R>>,
}

impl<D: Connector, R: Connector> Clone for Dispatcher<D, R> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
        }
    }
}

impl<D, R> Dispatcher<D, R>
where
    D: Connector,
    D::Handle: DocumentBackend,
    R: Connector,
    R::Handle: RelationalBackend,
{
    pub fn new(gateway: Arc<Gateway<D, R>>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway<D, R>> {
        &self.gateway
    }

    /// Decode and run one request line. Never fails: errors become error responses.
    pub async fn dispatch(&self, message: Value) -> Response {
        let id = message
            .get("id")
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

        let request = match decode(message) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejected request: {}", e);
                return Response::failure(id, &e);
            }
        };

        match self.handle(request.operation, &context(&request.user_id, request.identity)).await {
            Ok(result) => Response::success(request.id, result),
            Err(e) => {
                warn!(code = e.code(), "Request failed: {}", e);
                Response::failure(request.id, &e)
            }
        }
    }

    #[instrument(skip(self, operation, ctx), fields(op = operation.name(), user = %ctx.user_id))]
    async fn handle(&self, operation: Operation, ctx: &RequestContext) -> Result<Value> {
        debug!("Dispatching operation");
        let gateway = &self.gateway;

        match operation {
            Operation::TestConnection { connection_id } => {
                to_value(gateway.test_connection(ctx, &connection_id).await?)
            }
            Operation::ListDatabases { connection_id } => {
                to_value(gateway.list_databases(ctx, &connection_id).await?)
            }
            Operation::ListSchemas { connection_id } => {
                to_value(gateway.list_schemas(ctx, &connection_id).await?)
            }
            Operation::ListCollections {
                connection_id,
                database,
            } => to_value(gateway.list_collections(ctx, &connection_id, &database).await?),
            Operation::ListTables {
                connection_id,
                schema,
            } => to_value(
                gateway
                    .list_tables(ctx, &connection_id, schema.as_deref())
                    .await?,
            ),
            Operation::FindDocuments {
                connection_id,
                database,
                collection,
                query,
            } => to_value(
                gateway
                    .find_documents(ctx, &connection_id, &database, &collection, &query)
                    .await?,
            ),
            Operation::Aggregate {
                connection_id,
                database,
                collection,
                pipeline,
            } => to_value(
                gateway
                    .aggregate(ctx, &connection_id, &database, &collection, &pipeline)
                    .await?,
            ),
            Operation::InsertDocument {
                connection_id,
                database,
                collection,
                document,
            } => to_value(
                gateway
                    .insert_document(ctx, &connection_id, &database, &collection, &document)
                    .await?,
            ),
            Operation::UpdateDocuments {
                connection_id,
                database,
                collection,
                filter,
                update,
            } => to_value(
                gateway
                    .update_documents(ctx, &connection_id, &database, &collection, &filter, &update)
                    .await?,
            ),
            Operation::DeleteDocuments {
                connection_id,
                database,
                collection,
                filter,
            } => to_value(
                gateway
                    .delete_documents(ctx, &connection_id, &database, &collection, &filter)
                    .await?,
            ),
            Operation::ExecuteSql {
                connection_id,
                sql,
                params,
            } => to_value(gateway.execute_sql(ctx, &connection_id, &sql, &params).await?),
            Operation::CloseConnection { connection_id } => {
                let closed = gateway.close_connection(ctx, &connection_id).await?;
                Ok(serde_json::json!({ "closed": closed }))
            }
            Operation::CloseAll => {
                let closed = gateway.close_all().await;
                Ok(serde_json::json!({ "closed": closed }))
            }
            Operation::Metrics => to_value(gateway.metrics()),
        }
    }
}

fn decode(message: Value) -> Result<Request> {
    let op = match message.get("op") {
        Some(Value::String(op)) => op.clone(),
        Some(_) => return Err(ProtocolError::InvalidRequest("'op' must be a string".into()).into()),
        None => return Err(ProtocolError::InvalidRequest("missing 'op'".into()).into()),
    };
    if !Operation::NAMES.contains(&op.as_str()) {
        return Err(ProtocolError::UnknownOperation(op).into());
    }

    serde_json::from_value(message)
        .map_err(|e| GatewayError::Protocol(ProtocolError::InvalidRequest(e.to_string().into())))
}

fn context(user_id: &str, identity: Option<String>) -> RequestContext {
    match identity.filter(|i| !i.is_empty()) {
        Some(identity) => RequestContext::new(user_id, identity),
        None => RequestContext::for_user(user_id),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::database::testing::MockConnector;
    use crate::database::{BackendKind, ConnectionDescriptor, InMemoryDescriptorStore};
    use serde_json::json;

    fn dispatcher() -> Dispatcher<MockConnector, MockConnector> {
        let store = InMemoryDescriptorStore::new();
        store.insert(
            "alice",
            ConnectionDescriptor::new("mongo-1", BackendKind::Document).host("localhost"),
        )
        .unwrap();
        store.insert(
            "alice",
            ConnectionDescriptor::new("pg-1", BackendKind::Relational)
                .host("localhost")
                .credentials("app", "secret"),
        )
        .unwrap();
        let gateway = Gateway::builder()
            .config(GatewayConfig::default())
            .store(Arc::new(store))
            .connectors(
                MockConnector::new(BackendKind::Document),
                MockConnector::new(BackendKind::Relational),
            )
            .build()
            .unwrap();
        Dispatcher::new(Arc::new(gateway))
    }

    #[tokio::test]
    async fn test_dispatch_find() {
        let response = dispatcher()
            .dispatch(json!({
                "id": 1,
                "user_id": "alice",
                "op": "find_documents",
                "connection_id": "mongo-1",
                "database": "app",
                "collection": "users",
                "query": {"limit": 1}
            }))
            .await;

        assert!(response.ok);
        assert_eq!(response.id, Some(RequestId::Number(1)));
        let result = response.result.unwrap();
        assert_eq!(result["total"], json!(5));
        assert_eq!(result["documents"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_sql_rejection() {
        let response = dispatcher()
            .dispatch(json!({
                "id": "q",
                "user_id": "alice",
                "op": "execute_sql",
                "connection_id": "pg-1",
                "sql": "SELECT pg_sleep(10)"
            }))
            .await;

        assert!(!response.ok);
        let error = response.error.unwrap();
        assert_eq!(error.code, "sql_injection");
        assert!(error.kind.is_some());
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let response = dispatcher()
            .dispatch(json!({"id": 3, "user_id": "alice", "op": "drop_everything"}))
            .await;
        assert_eq!(response.id, Some(RequestId::Number(3)));
        assert_eq!(response.error.unwrap().code, "protocol_error");
    }

    #[tokio::test]
    async fn test_invalid_request() {
        let d = dispatcher();

        let missing_op = d.dispatch(json!({"id": 4, "user_id": "alice"})).await;
        assert!(!missing_op.ok);

        let missing_field = d
            .dispatch(json!({"id": 5, "user_id": "alice", "op": "list_collections", "connection_id": "mongo-1"}))
            .await;
        let error = missing_field.error.unwrap();
        assert_eq!(error.code, "protocol_error");
        assert!(error.message.contains("database"));
    }

    #[tokio::test]
    async fn test_close_and_metrics() {
        let d = dispatcher();
        d.dispatch(json!({"user_id": "alice", "op": "list_databases", "connection_id": "pg-1"}))
            .await;

        let closed = d
            .dispatch(json!({"user_id": "alice", "op": "close_connection", "connection_id": "pg-1"}))
            .await;
        assert_eq!(closed.result.unwrap(), json!({"closed": true}));

        let metrics = d.dispatch(json!({"user_id": "alice", "op": "metrics"})).await;
        let metrics = metrics.result.unwrap();
        assert_eq!(metrics["relational"]["pools_built"], json!(1));
        assert_eq!(metrics["relational"]["closes"], json!(1));
    }

    #[test]
    fn test_identity_falls_back_to_user() {
        assert_eq!(context("alice", None).identity, "alice");
        assert_eq!(context("alice", Some(String::new())).identity, "alice");
        assert_eq!(context("alice", Some("10.0.0.1".into())).identity, "10.0.0.1");
    }
}
