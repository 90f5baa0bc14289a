//! In-process connector used by unit tests.

use crate::database::descriptor::{BackendKind, ConnectionDescriptor};
use crate::database::result::{
    CellValue, CollectionInfo, Column, Row, SqlResult, TableInfo, TableType, WriteSummary,
};
use crate::database::traits::{Connector, DocumentBackend, RelationalBackend};
use crate::error::{DatabaseError, DbResult};
use crate::security::{SanitizedQuery, ValidatedStatement};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub struct MockConnector {
    kind: BackendKind,
    builds: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    build_ok: Arc<AtomicBool>,
    probe_ok: Arc<AtomicBool>,
    build_delay: Duration,
    probe_delay: Duration,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockConnector {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            builds: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            build_ok: Arc::new(AtomicBool::new(true)),
            probe_ok: Arc::new(AtomicBool::new(true)),
            build_delay: Duration::ZERO,
            probe_delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn builds(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.builds)
    }

    pub fn closes(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }

    pub fn build_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.build_ok)
    }

    pub fn probe_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.probe_ok)
    }

    /// Backend operations executed on any handle, in order.
    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }
}

pub struct MockHandle {
    pub serial: usize,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockHandle {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Handle = MockHandle;

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn build(&self, descriptor: &ConnectionDescriptor) -> DbResult<MockHandle> {
        let serial = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.build_delay.is_zero() {
            tokio::time::sleep(self.build_delay).await;
        }
        if !self.build_ok.load(Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionFailed(format!(
                "{} unreachable",
                descriptor.id
            )));
        }
        Ok(MockHandle {
            serial,
            calls: Arc::clone(&self.calls),
        })
    }

    async fn probe(&self, _handle: &MockHandle) -> DbResult<()> {
        if !self.probe_delay.is_zero() {
            tokio::time::sleep(self.probe_delay).await;
        }
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DatabaseError::ProbeFailed("connection reset".into()))
        }
    }

    async fn close(&self, _handle: &MockHandle) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentBackend for MockHandle {
    async fn list_databases(&self) -> DbResult<Vec<String>> {
        self.record("list_databases");
        Ok(vec!["admin".into(), "app".into()])
    }

    async fn list_collections(&self, database: &str) -> DbResult<Vec<CollectionInfo>> {
        self.record(format!("list_collections:{}", database));
        Ok(vec![CollectionInfo {
            name: "users".into(),
            count: 3,
            size_bytes: 300,
            avg_object_size: 100,
        }])
    }

    async fn find(
        &self,
        _database: &str,
        collection: &str,
        query: &SanitizedQuery,
    ) -> DbResult<(Vec<Value>, u64)> {
        self.record(format!("find:{}", collection));
        let documents = (0..query.limit.min(2))
            .map(|i| json!({"n": i, "filter": query.filter.clone()}))
            .collect();
        Ok((documents, 5))
    }

    async fn aggregate(
        &self,
        _database: &str,
        collection: &str,
        pipeline: &[Value],
    ) -> DbResult<Vec<Value>> {
        self.record(format!("aggregate:{}", collection));
        Ok(vec![json!({"stages": pipeline.len()})])
    }

    async fn insert_one(
        &self,
        _database: &str,
        collection: &str,
        _document: &Map<String, Value>,
    ) -> DbResult<WriteSummary> {
        self.record(format!("insert_one:{}", collection));
        Ok(WriteSummary::inserted(json!({"$oid": "65f1c0ffee0000000000abcd"})))
    }

    async fn update_many(
        &self,
        _database: &str,
        collection: &str,
        _filter: &Map<String, Value>,
        _update: &Map<String, Value>,
    ) -> DbResult<WriteSummary> {
        self.record(format!("update_many:{}", collection));
        Ok(WriteSummary::updated(2, 1))
    }

    async fn delete_many(
        &self,
        _database: &str,
        collection: &str,
        _filter: &Map<String, Value>,
    ) -> DbResult<WriteSummary> {
        self.record(format!("delete_many:{}", collection));
        Ok(WriteSummary::deleted(4))
    }
}

#[async_trait]
impl RelationalBackend for MockHandle {
    async fn list_schemas(&self) -> DbResult<Vec<String>> {
        self.record("list_schemas");
        Ok(vec!["public".into()])
    }

    async fn list_tables(&self, schema: &str) -> DbResult<Vec<TableInfo>> {
        self.record(format!("list_tables:{}", schema));
        if schema != "public" {
            return Err(DatabaseError::not_found("schema", schema));
        }
        Ok(vec![TableInfo {
            schema: "public".into(),
            name: "users".into(),
            table_type: TableType::Table,
            row_estimate: 3,
            size_bytes: 8192,
        }])
    }

    async fn execute(&self, statement: &ValidatedStatement) -> DbResult<SqlResult> {
        self.record(format!("execute:{}", statement.sql));
        let mut row = Row::new();
        row.insert("params".into(), CellValue::Int(statement.params.len() as i64));
        Ok(SqlResult::new(
            vec![Column::new("params", "int8")],
            vec![row],
            1,
        ))
    }
}
