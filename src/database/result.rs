//! Result types returned by backend operations.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;

/// Result of one SQL statement.
#[derive(Debug, Clone, Serialize)]
pub struct SqlResult {
    pub fields: Vec<Column>,
    pub rows: Vec<Row>,
    /// Rows returned, or rows affected for statements without a result set.
    pub row_count: u64,
    pub execution_time_ms: u64,
}

impl SqlResult {
    pub fn empty() -> Self {
        Self {
            fields: vec![],
            rows: vec![],
            row_count: 0,
            execution_time_ms: 0,
        }
    }

    pub fn new(fields: Vec<Column>, rows: Vec<Row>, execution_time_ms: u64) -> Self {
        let row_count = rows.len() as u64;
        Self {
            fields,
            rows,
            row_count,
            execution_time_ms,
        }
    }

    pub fn affected(row_count: u64, execution_time_ms: u64) -> Self {
        Self {
            row_count,
            execution_time_ms,
            ..Self::empty()
        }
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Row data as a map of column name to value.
pub type Row = HashMap<String, CellValue>;

/// Cell value that can hold different SQL types.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    String(String),
    DateTime(DateTime<Utc>),
    Bytes(#[serde(serialize_with = "serialize_base64")] Vec<u8>),
    Json(Value),
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for CellValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Decimal> for CellValue {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<DateTime<Utc>> for CellValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl From<Vec<u8>> for CellValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Value> for CellValue {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

/// Relational table or view.
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub table_type: TableType,
    /// Planner estimate, not an exact count.
    pub row_estimate: i64,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableType {
    Table,
    View,
    MaterializedView,
    PartitionedTable,
    ForeignTable,
}

impl TableType {
    /// Map a `pg_class.relkind` code.
    pub fn from_relkind(relkind: &str) -> Self {
        match relkind {
            "v" => Self::View,
            "m" => Self::MaterializedView,
            "p" => Self::PartitionedTable,
            "f" => Self::ForeignTable,
            _ => Self::Table,
        }
    }
}

/// Document collection with storage statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub count: u64,
    pub size_bytes: u64,
    pub avg_object_size: u64,
}

/// One page of documents.
#[derive(Debug, Clone, Serialize)]
pub struct FindResult {
    pub documents: Vec<Value>,
    /// Documents matching the filter, ignoring skip and limit.
    pub total: u64,
    /// 1-based page derived from skip and limit.
    pub page: u64,
    pub limit: i64,
    pub has_more: bool,
}

impl FindResult {
    pub fn new(documents: Vec<Value>, total: u64, skip: u64, limit: i64) -> Self {
        let page = if limit > 0 { skip / limit as u64 + 1 } else { 1 };
        let has_more = skip + (documents.len() as u64) < total;
        Self {
            documents,
            total,
            page,
            limit,
            has_more,
        }
    }
}

/// Output of an aggregation pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub documents: Vec<Value>,
}

/// Counts reported by document writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_id: Option<Value>,
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
}

impl WriteSummary {
    pub fn inserted(id: Value) -> Self {
        Self {
            inserted_id: Some(id),
            ..Self::default()
        }
    }

    pub fn updated(matched_count: u64, modified_count: u64) -> Self {
        Self {
            matched_count,
            modified_count,
            ..Self::default()
        }
    }

    pub fn deleted(deleted_count: u64) -> Self {
        Self {
            deleted_count,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_find_result_paging() {
        let docs = vec![json!({"a": 1}); 10];
        let result = FindResult::new(docs, 35, 20, 10);
        assert_eq!(result.page, 3);
        assert!(result.has_more);

        let last = FindResult::new(vec![json!({}); 5], 35, 30, 10);
        assert_eq!(last.page, 4);
        assert!(!last.has_more);
    }

    #[test]
    fn test_bytes_serialize_as_base64() {
        let cell = CellValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(serde_json::to_value(&cell).unwrap(), json!("3q2+7w=="));
    }

    #[test]
    fn test_cell_value_from_option() {
        assert!(CellValue::from(None::<i64>).is_null());
        assert_eq!(CellValue::from(Some(7i64)).as_i64(), Some(7));
    }

    #[test]
    fn test_affected_result_has_no_fields() {
        let result = SqlResult::affected(3, 12);
        assert!(result.fields.is_empty());
        assert_eq!(result.row_count, 3);
    }

    #[test]
    fn test_table_type_from_relkind() {
        assert_eq!(TableType::from_relkind("r"), TableType::Table);
        assert_eq!(TableType::from_relkind("m"), TableType::MaterializedView);
    }
}
