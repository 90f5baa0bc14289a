//! Wire types of the JSON-lines service.
//!
//! One request per line:
//!
//! ```json
//! {"id": 1, "user_id": "alice", "identity": "10.0.0.1", "op": "find_documents",
//!  "connection_id": "mongo-1", "database": "app", "collection": "users",
//!  "query": {"filter": {"age": {"$gte": 21}}, "limit": 10}}
//! ```
//!
//! One response per line, in completion order:
//!
//! ```json
//! {"id": 1, "ok": true, "result": {"documents": [], "total": 0, "page": 1, "limit": 10, "has_more": false}}
//! {"id": 2, "ok": false, "error": {"code": "query_rejected", "message": "...", "kind": "disallowed_operator", "token": "$where"}}
//! ```

use crate::error::{GatewayError, RejectionKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request id echoed back in the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// A decoded request line.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<RequestId>,
    pub user_id: String,
    /// Rate-limit identity; the user id when absent.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(flatten)]
    pub operation: Operation,
}

/// Gateway operation selected by the `op` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    TestConnection {
        connection_id: String,
    },
    ListDatabases {
        connection_id: String,
    },
    ListSchemas {
        connection_id: String,
    },
    ListCollections {
        connection_id: String,
        database: String,
    },
    ListTables {
        connection_id: String,
        #[serde(default)]
        schema: Option<String>,
    },
    FindDocuments {
        connection_id: String,
        database: String,
        collection: String,
        #[serde(default)]
        query: Value,
    },
    Aggregate {
        connection_id: String,
        database: String,
        collection: String,
        pipeline: Value,
    },
    InsertDocument {
        connection_id: String,
        database: String,
        collection: String,
        document: Value,
    },
    UpdateDocuments {
        connection_id: String,
        database: String,
        collection: String,
        #[serde(default)]
        filter: Value,
        update: Value,
    },
    DeleteDocuments {
        connection_id: String,
        database: String,
        collection: String,
        #[serde(default)]
        filter: Value,
    },
    ExecuteSql {
        connection_id: String,
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    CloseConnection {
        connection_id: String,
    },
    CloseAll,
    Metrics,
}

impl Operation {
    /// Every value accepted in the `op` field.
    pub const NAMES: &'static [&'static str] = &[
        "test_connection",
        "list_databases",
        "list_schemas",
        "list_collections",
        "list_tables",
        "find_documents",
        "aggregate",
        "insert_document",
        "update_documents",
        "delete_documents",
        "execute_sql",
        "close_connection",
        "close_all",
        "metrics",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::TestConnection { .. } => "test_connection",
            Self::ListDatabases { .. } => "list_databases",
            Self::ListSchemas { .. } => "list_schemas",
            Self::ListCollections { .. } => "list_collections",
            Self::ListTables { .. } => "list_tables",
            Self::FindDocuments { .. } => "find_documents",
            Self::Aggregate { .. } => "aggregate",
            Self::InsertDocument { .. } => "insert_document",
            Self::UpdateDocuments { .. } => "update_documents",
            Self::DeleteDocuments { .. } => "delete_documents",
            Self::ExecuteSql { .. } => "execute_sql",
            Self::CloseConnection { .. } => "close_connection",
            Self::CloseAll => "close_all",
            Self::Metrics => "metrics",
        }
    }
}

/// A response line.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Option<RequestId>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: &GatewayError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody::from(error)),
        }
    }
}

/// Error payload: a stable code, the message and any rejection or retry details.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<RejectionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&GatewayError> for ErrorBody {
    fn from(error: &GatewayError) -> Self {
        let rejection = error.rejection();
        let (reset_at, retry_after_ms) = match error {
            GatewayError::RateLimited {
                reset_at,
                retry_after_ms,
                ..
            } => (Some(*reset_at), Some(*retry_after_ms)),
            _ => (None, None),
        };
        Self {
            code: error.code(),
            message: error.to_string(),
            kind: rejection.map(|r| r.kind),
            token: rejection.map(|r| r.token.clone()),
            reset_at,
            retry_after_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SanitizationError;
    use serde_json::json;

    #[test]
    fn test_request_parsing() {
        let request: Request = serde_json::from_value(json!({
            "id": 7,
            "user_id": "alice",
            "op": "execute_sql",
            "connection_id": "pg-1",
            "sql": "SELECT $1",
            "params": [1]
        }))
        .unwrap();

        assert_eq!(request.id, Some(RequestId::Number(7)));
        assert!(request.identity.is_none());
        match request.operation {
            Operation::ExecuteSql {
                connection_id,
                sql,
                params,
            } => {
                assert_eq!(connection_id, "pg-1");
                assert_eq!(sql, "SELECT $1");
                assert_eq!(params, vec![json!(1)]);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_optional_fields_default() {
        let request: Request = serde_json::from_value(json!({
            "id": "a",
            "user_id": "alice",
            "op": "find_documents",
            "connection_id": "m",
            "database": "app",
            "collection": "users"
        }))
        .unwrap();
        assert_eq!(request.operation.name(), "find_documents");
        assert!(matches!(
            request.operation,
            Operation::FindDocuments { query: Value::Null, .. }
        ));

        let request: Request =
            serde_json::from_value(json!({"user_id": "alice", "op": "close_all"})).unwrap();
        assert!(request.id.is_none());
        assert!(matches!(request.operation, Operation::CloseAll));
    }

    #[test]
    fn test_names_cover_operations() {
        for name in Operation::NAMES {
            let request: std::result::Result<Request, _> =
                serde_json::from_value(json!({"user_id": "u", "op": name}));
            // Operations with required fields fail on those fields, never on the tag.
            if let Err(e) = request {
                assert!(!e.to_string().contains("unknown variant"), "{}", e);
            }
        }
    }

    #[test]
    fn test_error_body_carries_rejection() {
        let error = GatewayError::QueryRejected(SanitizationError::new(
            RejectionKind::DisallowedOperator,
            "$where",
            "operator is denied",
        ));
        let body = serde_json::to_value(Response::failure(Some(1.into()), &error)).unwrap();

        assert_eq!(body["ok"], json!(false));
        assert_eq!(body["error"]["code"], json!("query_rejected"));
        assert_eq!(body["error"]["kind"], json!("disallowed_operator"));
        assert_eq!(body["error"]["token"], json!("$where"));
        assert!(body.get("result").is_none());
    }

    #[test]
    fn test_success_shape() {
        let body = serde_json::to_value(Response::success(None, json!({"n": 1}))).unwrap();
        assert_eq!(body, json!({"id": null, "ok": true, "result": {"n": 1}}));
    }
}
