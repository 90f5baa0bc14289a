//! Stored connection descriptors and the store they are resolved from.

use crate::error::{ConfigError, DatabaseError, DbResult};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Which backend a descriptor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// MongoDB.
    #[serde(alias = "mongodb", alias = "mongo")]
    Document,
    /// PostgreSQL.
    #[serde(alias = "postgres", alias = "postgresql", alias = "pg")]
    Relational,
}

impl BackendKind {
    /// Accepts the kind names and common product aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "document" | "mongodb" | "mongo" => Some(Self::Document),
            "relational" | "postgres" | "postgresql" | "pg" => Some(Self::Relational),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Relational => "relational",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for BackendKind {
    type Error = ConfigError;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        Self::parse(s).ok_or_else(|| ConfigError::InvalidValue {
            field: "backend_kind".into(),
            message: format!(
                "Unknown backend kind: '{}'. Valid kinds: document, mongodb, relational, postgres",
                s
            )
            .into(),
        })
    }
}

/// Optional pool-size bounds; unset bounds fall back to the builder defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBounds {
    #[serde(default)]
    pub max_size: Option<u32>,
    #[serde(default)]
    pub min_size: Option<u32>,
}

/// One configured backend target, as stored by the configuration store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "type", alias = "kind")]
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Overrides every discrete endpoint field when present.
    #[serde(default, skip_serializing)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub tls: bool,
    /// DNS seed-list discovery (`mongodb+srv`); document store only.
    #[serde(default)]
    pub srv: bool,
    #[serde(default)]
    pub auth_source: Option<String>,
    #[serde(default)]
    pub auth_mechanism: Option<String>,
    #[serde(default)]
    pub pool: PoolBounds,
}

impl ConnectionDescriptor {
    pub fn new(id: impl Into<String>, backend_kind: BackendKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            backend_kind,
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            connection_string: None,
            tls: false,
            srv: false,
            auth_source: None,
            auth_mechanism: None,
            pool: PoolBounds::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn srv(mut self, srv: bool) -> Self {
        self.srv = srv;
        self
    }

    pub fn auth_source(mut self, source: impl Into<String>) -> Self {
        self.auth_source = Some(source.into());
        self
    }

    pub fn pool_bounds(mut self, min_size: u32, max_size: u32) -> Self {
        self.pool = PoolBounds {
            max_size: Some(max_size),
            min_size: Some(min_size),
        };
        self
    }

    /// The connection string, if one is set and non-blank.
    pub fn explicit_connection_string(&self) -> Option<&str> {
        self.connection_string
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }
}

// Secrets stay out of logs.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("id", &self.id)
            .field("backend_kind", &self.backend_kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "***"),
            )
            .field("tls", &self.tls)
            .field("srv", &self.srv)
            .field("pool", &self.pool)
            .finish()
    }
}

/// User-scoped lookup of connection descriptors.
///
/// Implementations are responsible for ownership checks: a descriptor that
/// exists but belongs to another user must be reported as not found.
#[async_trait]
pub trait DescriptorStore: Send + Sync {
    async fn get_descriptor(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> DbResult<ConnectionDescriptor>;
}

/// Descriptor store held in memory, keyed by `(user_id, connection_id)`.
///
/// A connection id belongs to exactly one user: pools are cached per id, so
/// two users sharing an id would share a pool.
#[derive(Default)]
pub struct InMemoryDescriptorStore {
    entries: DashMap<(String, String), ConnectionDescriptor>,
    owners: DashMap<String, String>,
}

impl InMemoryDescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a descriptor. Fails when the id belongs to another user.
    pub fn insert(
        &self,
        user_id: impl Into<String>,
        descriptor: ConnectionDescriptor,
    ) -> Result<(), ConfigError> {
        let user_id = user_id.into();
        match self.owners.entry(descriptor.id.clone()) {
            Entry::Occupied(owner) if *owner.get() != user_id => {
                return Err(ConfigError::InvalidValue {
                    field: "connections".into(),
                    message: format!(
                        "connection id '{}' is already registered to another user",
                        descriptor.id
                    )
                    .into(),
                });
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(vacant) => {
                vacant.insert(user_id.clone());
            }
        }

        debug!("Registering connection descriptor {}", descriptor.id);
        self.entries
            .insert((user_id, descriptor.id.clone()), descriptor);
        Ok(())
    }

    pub fn remove(&self, user_id: &str, connection_id: &str) -> Option<ConnectionDescriptor> {
        let (_, descriptor) = self
            .entries
            .remove(&(user_id.to_string(), connection_id.to_string()))?;
        self.owners
            .remove_if(connection_id, |_, owner| owner == user_id);
        Some(descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse `{"<user_id>": [descriptor, ...], ...}`.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let by_user: HashMap<String, Vec<ConnectionDescriptor>> = serde_json::from_str(json)
            .map_err(|e| ConfigError::InvalidValue {
                field: "connections".into(),
                message: e.to_string().into(),
            })?;

        let store = Self::new();
        for (user_id, descriptors) in by_user {
            for descriptor in descriptors {
                store.insert(user_id.clone(), descriptor)?;
            }
        }
        Ok(store)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
            field: "connections_file".into(),
            message: format!("{}: {}", path.display(), e).into(),
        })?;
        let store = Self::from_json(&json)?;
        info!(
            "Loaded {} connection descriptors from {}",
            store.len(),
            path.display()
        );
        Ok(store)
    }
}

#[async_trait]
impl DescriptorStore for InMemoryDescriptorStore {
    async fn get_descriptor(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> DbResult<ConnectionDescriptor> {
        self.entries
            .get(&(user_id.to_string(), connection_id.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DatabaseError::not_found("connection", connection_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(BackendKind::parse("MongoDB"), Some(BackendKind::Document));
        assert_eq!(BackendKind::parse("postgresql"), Some(BackendKind::Relational));
        assert_eq!(BackendKind::parse("redis"), None);
        assert!(BackendKind::try_from("mssql").is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let descriptor = ConnectionDescriptor::new("c1", BackendKind::Relational)
            .credentials("admin", "hunter2")
            .connection_string("postgresql://admin:hunter2@db/app");
        let debug = format!("{:?}", descriptor);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("admin"));
    }

    #[test]
    fn test_explicit_connection_string_ignores_blank() {
        let descriptor =
            ConnectionDescriptor::new("c1", BackendKind::Document).connection_string("   ");
        assert!(descriptor.explicit_connection_string().is_none());
    }

    #[tokio::test]
    async fn test_store_is_user_scoped() {
        let store = InMemoryDescriptorStore::new();
        store
            .insert("alice", ConnectionDescriptor::new("c1", BackendKind::Document))
            .unwrap();

        assert!(store.get_descriptor("alice", "c1").await.is_ok());
        let err = store.get_descriptor("bob", "c1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_connection_id_has_single_owner() {
        let store = InMemoryDescriptorStore::new();
        store
            .insert("alice", ConnectionDescriptor::new("c1", BackendKind::Document).host("a"))
            .unwrap();

        let err = store
            .insert("bob", ConnectionDescriptor::new("c1", BackendKind::Relational).host("b"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(store.get_descriptor("bob", "c1").await.is_err());

        // The owner may replace their own descriptor.
        store
            .insert("alice", ConnectionDescriptor::new("c1", BackendKind::Document).host("a2"))
            .unwrap();
        let descriptor = store.get_descriptor("alice", "c1").await.unwrap();
        assert_eq!(descriptor.host.as_deref(), Some("a2"));
        assert_eq!(store.len(), 1);

        // Once released, the id can be claimed by someone else.
        assert!(store.remove("bob", "c1").is_none());
        assert!(store.remove("alice", "c1").is_some());
        store
            .insert("bob", ConnectionDescriptor::new("c1", BackendKind::Relational))
            .unwrap();
    }

    #[test]
    fn test_store_from_json_rejects_shared_id() {
        let json = r#"{
            "alice": [{"id": "shared", "type": "mongodb", "host": "a"}],
            "bob": [{"id": "shared", "type": "postgres", "host": "b"}]
        }"#;
        assert!(InMemoryDescriptorStore::from_json(json).is_err());
    }

    #[test]
    fn test_store_from_json() {
        let json = r#"{
            "alice": [
                {"id": "mongo-1", "type": "mongodb", "host": "localhost", "srv": false},
                {"id": "pg-1", "backend_kind": "relational", "connection_string": "postgres://u:p@h/db"}
            ]
        }"#;
        let store = InMemoryDescriptorStore::from_json(json).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_serialization_skips_secrets() {
        let descriptor = ConnectionDescriptor::new("c1", BackendKind::Relational)
            .credentials("admin", "hunter2");
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
