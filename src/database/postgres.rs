//! PostgreSQL connector using `tokio-postgres` and `deadpool`.

use crate::database::connection_string::{
    ConnectionBuilder, ConnectionTarget, RelationalEndpoint, RelationalTarget, TlsMode,
};
use crate::database::descriptor::{BackendKind, ConnectionDescriptor};
use crate::database::result::*;
use crate::database::traits::{Connector, RelationalBackend};
use crate::error::{DatabaseError, DbResult};
use crate::security::{SqlParam, ValidatedStatement};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{
    Config as DeadpoolConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, SslMode,
    Timeouts,
};
use futures_util::future::try_join_all;
use postgres_native_tls::MakeTlsConnector;
use rust_decimal::Decimal;
use serde_json::Value;
use std::error::Error as StdError;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio_postgres::NoTls;
use tokio_postgres::types::{Format, IsNull, Kind, ToSql, Type, to_sql_checked};
use tracing::{debug, info, instrument, warn};

/// Builds one deadpool per descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnector;

impl PostgresConnector {
    pub fn new() -> Self {
        Self
    }

    fn pool(target: &RelationalTarget) -> DbResult<Pool> {
        let mut config = DeadpoolConfig::new();
        match &target.endpoint {
            RelationalEndpoint::ConnectionString(url) => config.url = Some(url.clone()),
            RelationalEndpoint::Discrete {
                host,
                port,
                database,
                user,
                password,
            } => {
                config.host = Some(host.clone());
                config.port = Some(*port);
                config.dbname = Some(database.clone());
                config.user = Some(user.clone());
                config.password = password.clone();
                if target.tls != TlsMode::Disabled {
                    config.ssl_mode = Some(SslMode::Require);
                }
            }
        }
        config.application_name = Some("db-gateway".to_string());
        config.connect_timeout = Some(target.pool.connect_timeout);
        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = PoolConfig::new(target.pool.max_size as usize);
        pool_config.timeouts = Timeouts {
            wait: Some(target.pool.connect_timeout),
            create: Some(target.pool.connect_timeout),
            recycle: Some(target.pool.connect_timeout),
        };
        config.pool = Some(pool_config);

        let created = match target.tls {
            TlsMode::Disabled => config.create_pool(Some(Runtime::Tokio1), NoTls),
            TlsMode::AcceptInvalidCerts => {
                config.create_pool(Some(Runtime::Tokio1), Self::tls_connector(true)?)
            }
            TlsMode::Verified => {
                config.create_pool(Some(Runtime::Tokio1), Self::tls_connector(false)?)
            }
        };
        created.map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))
    }

    fn tls_connector(accept_invalid: bool) -> DbResult<MakeTlsConnector> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(accept_invalid)
            .danger_accept_invalid_hostnames(accept_invalid)
            .build()
            .map_err(|e| DatabaseError::ConnectionFailed(format!("TLS setup failed: {}", e)))?;
        Ok(MakeTlsConnector::new(connector))
    }
}

/// A live deadpool plus its idle policy.
pub struct PgHandle {
    pool: Pool,
    idle_timeout: Duration,
    endpoint: String,
}

impl PgHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> deadpool_postgres::Status {
        self.pool.status()
    }

    async fn client(&self) -> DbResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| match e {
            deadpool_postgres::PoolError::Timeout(_) => DatabaseError::PoolExhausted,
            deadpool_postgres::PoolError::Closed => DatabaseError::Closed(self.endpoint.clone()),
            other => DatabaseError::ConnectionFailed(other.to_string()),
        })
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Handle = PgHandle;

    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    #[instrument(skip(self, descriptor), fields(connection_id = %descriptor.id))]
    async fn build(&self, descriptor: &ConnectionDescriptor) -> DbResult<PgHandle> {
        let target = match ConnectionBuilder::build(descriptor)
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
        {
            ConnectionTarget::Relational(target) => target,
            ConnectionTarget::Document(_) => {
                return Err(DatabaseError::ConnectionFailed(
                    "descriptor does not describe a relational store".into(),
                ));
            }
        };

        let endpoint = target.endpoint_label();
        info!("Connecting to PostgreSQL: {} (tls: {:?})", endpoint, target.tls);
        let pool = Self::pool(&target)?;

        // Open the minimum idle set up front; this also proves the credentials.
        let warm = target.pool.min_size.max(1) as usize;
        let clients = try_join_all((0..warm).map(|_| pool.get()))
            .await
            .map_err(|e| {
                pool.close();
                DatabaseError::ConnectionFailed(e.to_string())
            })?;
        drop(clients);

        info!(
            "PostgreSQL connection pool created with {} warm of max {}",
            warm, target.pool.max_size
        );

        Ok(PgHandle {
            pool,
            idle_timeout: target.pool.idle_timeout,
            endpoint,
        })
    }

    async fn probe(&self, handle: &PgHandle) -> DbResult<()> {
        let pruned = handle
            .pool
            .retain(|_, metrics| metrics.last_used() < handle.idle_timeout);
        if !pruned.removed.is_empty() {
            debug!("Pruned {} idle connections", pruned.removed.len());
        }

        let client = handle.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| DatabaseError::ProbeFailed(e.to_string()))
    }

    async fn close(&self, handle: &PgHandle) {
        debug!("Closing PostgreSQL pool for {}", handle.endpoint);
        handle.pool.close();
    }
}

impl PgHandle {
    /// Convert a PostgreSQL row to our Row type.
    fn convert_row(pg_row: &tokio_postgres::Row, columns: &[tokio_postgres::Column]) -> Row {
        columns
            .iter()
            .enumerate()
            .map(|(i, col)| (col.name().to_string(), Self::get_cell_value(pg_row, i, col.type_())))
            .collect()
    }

    /// Extract a cell by its declared column type.
    fn get_cell_value(row: &tokio_postgres::Row, index: usize, ty: &Type) -> CellValue {
        let cell = match *ty {
            Type::BOOL => row.try_get::<_, Option<bool>>(index).map(CellValue::from),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(index)
                .map(|v| v.map(|n| n as i64).into()),
            Type::INT4 => row.try_get::<_, Option<i32>>(index).map(CellValue::from),
            Type::INT8 => row.try_get::<_, Option<i64>>(index).map(CellValue::from),
            Type::OID => row
                .try_get::<_, Option<u32>>(index)
                .map(|v| v.map(|n| n as i64).into()),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(index)
                .map(|v| v.map(|n| n as f64).into()),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(index).map(CellValue::from),
            Type::NUMERIC => row.try_get::<_, Option<Decimal>>(index).map(CellValue::from),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<DateTime<Utc>>>(index)
                .map(CellValue::from),
            Type::TIMESTAMP => row
                .try_get::<_, Option<NaiveDateTime>>(index)
                .map(|v| v.map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc)).into()),
            Type::DATE => row
                .try_get::<_, Option<NaiveDate>>(index)
                .map(|v| v.map(|d| d.to_string()).into()),
            Type::TIME => row
                .try_get::<_, Option<NaiveTime>>(index)
                .map(|v| v.map(|t| t.to_string()).into()),
            Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(index).map(CellValue::from),
            Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(index).map(CellValue::from),
            Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
                .try_get::<_, Option<Vec<String>>>(index)
                .map(|v| v.map(|items| Value::from(items)).into()),
            Type::INT4_ARRAY => row
                .try_get::<_, Option<Vec<i32>>>(index)
                .map(|v| v.map(|items| Value::from(items)).into()),
            Type::INT8_ARRAY => row
                .try_get::<_, Option<Vec<i64>>>(index)
                .map(|v| v.map(|items| Value::from(items)).into()),
            _ => row.try_get::<_, Option<String>>(index).map(CellValue::from),
        };

        cell.unwrap_or_else(|_| CellValue::String(format!("<{}>", ty.name())))
    }

    fn bind_params(
        params: &[SqlParam],
        types: &[Type],
    ) -> DbResult<Vec<Box<dyn ToSql + Sync + Send>>> {
        params
            .iter()
            .zip(types)
            .map(|(param, ty)| bind_param(param, ty))
            .collect()
    }
}

#[async_trait]
impl RelationalBackend for PgHandle {
    #[instrument(skip(self), fields(db = "postgres"))]
    async fn list_schemas(&self) -> DbResult<Vec<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT schema_name
                FROM information_schema.schemata
                WHERE schema_name NOT IN ('pg_catalog', 'information_schema')
                  AND schema_name NOT LIKE 'pg\_toast%'
                  AND schema_name NOT LIKE 'pg\_temp\_%'
                ORDER BY schema_name
                "#,
                &[],
            )
            .await
            .map_err(pg_error)?;

        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    #[instrument(skip(self), fields(db = "postgres"))]
    async fn list_tables(&self, schema: &str) -> DbResult<Vec<TableInfo>> {
        let client = self.client().await?;

        let exists = client
            .query_opt("SELECT 1 FROM pg_namespace WHERE nspname = $1", &[&schema])
            .await
            .map_err(pg_error)?;
        if exists.is_none() {
            return Err(DatabaseError::not_found("schema", schema));
        }

        let rows = client
            .query(
                r#"
                SELECT
                    n.nspname AS schema_name,
                    c.relname AS table_name,
                    c.relkind::text AS relkind,
                    GREATEST(c.reltuples, 0)::bigint AS row_estimate,
                    pg_total_relation_size(c.oid) AS size_bytes
                FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1
                  AND c.relkind IN ('r', 'v', 'm', 'p', 'f')
                ORDER BY c.relname
                "#,
                &[&schema],
            )
            .await
            .map_err(pg_error)?;

        Ok(rows
            .iter()
            .map(|row| TableInfo {
                schema: row.get("schema_name"),
                name: row.get("table_name"),
                table_type: TableType::from_relkind(row.get::<_, &str>("relkind")),
                row_estimate: row.get("row_estimate"),
                size_bytes: row.get("size_bytes"),
            })
            .collect())
    }

    #[instrument(skip(self, statement), fields(db = "postgres", params = statement.params.len()))]
    async fn execute(&self, statement: &ValidatedStatement) -> DbResult<SqlResult> {
        let start = Instant::now();
        let client = self.client().await?;

        debug!("Executing statement: {}", statement.sql);

        let stmt = client
            .prepare(&statement.sql)
            .await
            .map_err(pg_error)?;

        let boxed = PgHandle::bind_params(&statement.params, stmt.params())?;
        let params: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        if stmt.columns().is_empty() {
            let affected = client.execute(&stmt, &params).await.map_err(pg_error)?;
            return Ok(SqlResult::affected(
                affected,
                start.elapsed().as_millis() as u64,
            ));
        }

        let pg_rows = client.query(&stmt, &params).await.map_err(pg_error)?;

        let fields: Vec<Column> = stmt
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), c.type_().name()))
            .collect();

        let rows: Vec<Row> = pg_rows
            .iter()
            .map(|r| PgHandle::convert_row(r, stmt.columns()))
            .collect();

        Ok(SqlResult::new(
            fields,
            rows,
            start.elapsed().as_millis() as u64,
        ))
    }
}

/// Bind-time NULL accepted for any column type.
#[derive(Debug)]
struct AnyNull;

impl ToSql for AnyNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// A string sent in text format, left for the server to parse into the column type.
#[derive(Debug)]
struct TextLiteral(String);

impl ToSql for TextLiteral {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        out.extend_from_slice(self.0.as_bytes());
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

fn unsupported(param: &SqlParam, ty: &Type) -> DatabaseError {
    DatabaseError::UnsupportedParamType(format!("{} (got {})", ty.name(), param.kind()))
}

fn is_text(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

/// Coerce a validated parameter to the type the server inferred for its placeholder.
fn bind_param(param: &SqlParam, ty: &Type) -> DbResult<Box<dyn ToSql + Sync + Send>> {
    let bound: Box<dyn ToSql + Sync + Send> = match param {
        SqlParam::Null => Box::new(AnyNull),
        SqlParam::Bool(b) => match *ty {
            Type::BOOL => Box::new(*b),
            _ if is_text(ty) => Box::new(b.to_string()),
            _ => return Err(unsupported(param, ty)),
        },
        SqlParam::Int(n) => match *ty {
            Type::INT2 => Box::new(i16::try_from(*n).map_err(|_| unsupported(param, ty))?),
            Type::INT4 => Box::new(i32::try_from(*n).map_err(|_| unsupported(param, ty))?),
            Type::INT8 => Box::new(*n),
            Type::FLOAT4 => Box::new(*n as f32),
            Type::FLOAT8 => Box::new(*n as f64),
            Type::NUMERIC => Box::new(Decimal::from(*n)),
            Type::JSON | Type::JSONB => Box::new(Value::from(*n)),
            _ if is_text(ty) => Box::new(n.to_string()),
            _ => return Err(unsupported(param, ty)),
        },
        SqlParam::Float(f) => match *ty {
            Type::FLOAT4 => Box::new(*f as f32),
            Type::FLOAT8 => Box::new(*f),
            Type::NUMERIC => {
                Box::new(Decimal::try_from(*f).map_err(|_| unsupported(param, ty))?)
            }
            Type::JSON | Type::JSONB => Box::new(Value::from(*f)),
            _ if is_text(ty) => Box::new(f.to_string()),
            _ => return Err(unsupported(param, ty)),
        },
        SqlParam::Text(s) => bind_text(s, param, ty)?,
        SqlParam::Timestamp(dt) => match *ty {
            Type::TIMESTAMPTZ => Box::new(*dt),
            Type::TIMESTAMP => Box::new(dt.naive_utc()),
            Type::DATE => Box::new(dt.date_naive()),
            _ if is_text(ty) => Box::new(dt.to_rfc3339()),
            _ => return Err(unsupported(param, ty)),
        },
        SqlParam::Bytes(bytes) => match *ty {
            Type::BYTEA => Box::new(bytes.clone()),
            _ => return Err(unsupported(param, ty)),
        },
        SqlParam::Array(items) => bind_array(items, param, ty)?,
        SqlParam::Object(map) => match *ty {
            Type::JSON | Type::JSONB => Box::new(Value::Object(map.clone())),
            _ if is_text(ty) => Box::new(Value::Object(map.clone()).to_string()),
            _ => return Err(unsupported(param, ty)),
        },
    };
    Ok(bound)
}

/// Strings are parsed into the column type when it is not textual.
fn bind_text(s: &str, param: &SqlParam, ty: &Type) -> DbResult<Box<dyn ToSql + Sync + Send>> {
    let invalid = || unsupported(param, ty);
    let bound: Box<dyn ToSql + Sync + Send> = match *ty {
        Type::BOOL => Box::new(bool::from_str(s).map_err(|_| invalid())?),
        Type::INT2 => Box::new(s.parse::<i16>().map_err(|_| invalid())?),
        Type::INT4 => Box::new(s.parse::<i32>().map_err(|_| invalid())?),
        Type::INT8 => Box::new(s.parse::<i64>().map_err(|_| invalid())?),
        Type::FLOAT4 => Box::new(s.parse::<f32>().map_err(|_| invalid())?),
        Type::FLOAT8 => Box::new(s.parse::<f64>().map_err(|_| invalid())?),
        Type::NUMERIC => Box::new(Decimal::from_str(s).map_err(|_| invalid())?),
        Type::TIMESTAMPTZ => Box::new(
            DateTime::parse_from_rfc3339(s)
                .map_err(|_| invalid())?
                .with_timezone(&Utc),
        ),
        Type::TIMESTAMP => Box::new(
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map_err(|_| invalid())?,
        ),
        Type::DATE => Box::new(NaiveDate::from_str(s).map_err(|_| invalid())?),
        Type::JSON | Type::JSONB => {
            Box::new(serde_json::from_str::<Value>(s).unwrap_or_else(|_| Value::from(s)))
        }
        _ if is_text(ty) => Box::new(s.to_string()),
        // uuid, inet, interval, enums and the like: the server parses the text.
        _ => Box::new(TextLiteral(s.to_string())),
    };
    Ok(bound)
}

fn bind_array(
    items: &[SqlParam],
    param: &SqlParam,
    ty: &Type,
) -> DbResult<Box<dyn ToSql + Sync + Send>> {
    if matches!(*ty, Type::JSON | Type::JSONB) {
        let json = serde_json::to_value(items).map_err(|_| unsupported(param, ty))?;
        return Ok(Box::new(json));
    }
    let Kind::Array(element) = ty.kind() else {
        return Err(unsupported(param, ty));
    };

    let bound: Box<dyn ToSql + Sync + Send> = match *element {
        Type::INT4 => Box::new(
            items
                .iter()
                .map(|item| match item {
                    SqlParam::Int(n) => i32::try_from(*n).ok(),
                    _ => None,
                })
                .collect::<Option<Vec<i32>>>()
                .ok_or_else(|| unsupported(param, ty))?,
        ),
        Type::INT8 => Box::new(
            items
                .iter()
                .map(|item| match item {
                    SqlParam::Int(n) => Some(*n),
                    _ => None,
                })
                .collect::<Option<Vec<i64>>>()
                .ok_or_else(|| unsupported(param, ty))?,
        ),
        Type::FLOAT8 => Box::new(
            items
                .iter()
                .map(|item| match item {
                    SqlParam::Float(f) => Some(*f),
                    SqlParam::Int(n) => Some(*n as f64),
                    _ => None,
                })
                .collect::<Option<Vec<f64>>>()
                .ok_or_else(|| unsupported(param, ty))?,
        ),
        Type::BOOL => Box::new(
            items
                .iter()
                .map(|item| match item {
                    SqlParam::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Option<Vec<bool>>>()
                .ok_or_else(|| unsupported(param, ty))?,
        ),
        ref element if is_text(element) => Box::new(
            items
                .iter()
                .map(|item| match item {
                    SqlParam::Text(s) => Some(s.clone()),
                    _ => None,
                })
                .collect::<Option<Vec<String>>>()
                .ok_or_else(|| unsupported(param, ty))?,
        ),
        _ => return Err(unsupported(param, ty)),
    };
    Ok(bound)
}

fn pg_error(e: tokio_postgres::Error) -> DatabaseError {
    if e.is_closed() {
        warn!("PostgreSQL connection closed: {}", e);
        return DatabaseError::ConnectionFailed(e.to_string());
    }
    match e.as_db_error() {
        Some(db) => DatabaseError::Postgres(format!("{} ({})", db.message(), db.code().code())),
        None => DatabaseError::QueryFailed(e.to_string()),
    }
}
