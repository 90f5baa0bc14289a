//! Turns a stored descriptor into a backend connection target.
//!
//! An explicit connection string always wins over the discrete fields:
//! - Document store: `mongodb://` or `mongodb+srv://` URI, synthesized when absent
//! - Relational store: `postgres://` URL or `key=value` string, otherwise discrete parameters

use crate::database::descriptor::{BackendKind, ConnectionDescriptor};
use crate::database::pool::PoolSettings;
use crate::error::ConfigError;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::fmt;

pub type BuildResult<T> = Result<T, ConfigError>;

/// Characters left unescaped in URI user-info (RFC 3986 unreserved).
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const DEFAULT_DOCUMENT_PORT: u16 = 27017;
const DEFAULT_RELATIONAL_PORT: u16 = 5432;
const DEFAULT_AUTH_SOURCE: &str = "admin";

/// Backend-specific connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    Document(DocumentTarget),
    Relational(RelationalTarget),
}

impl ConnectionTarget {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Document(_) => BackendKind::Document,
            Self::Relational(_) => BackendKind::Relational,
        }
    }

    pub fn pool(&self) -> &PoolSettings {
        match self {
            Self::Document(t) => &t.pool,
            Self::Relational(t) => &t.pool,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DocumentTarget {
    pub uri: String,
    pub pool: PoolSettings,
}

impl DocumentTarget {
    /// Host portion of the URI, safe to log.
    pub fn endpoint(&self) -> &str {
        endpoint_of(&self.uri)
    }
}

impl fmt::Debug for DocumentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentTarget")
            .field("endpoint", &self.endpoint())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Where a relational pool connects to.
#[derive(Clone, PartialEq, Eq)]
pub enum RelationalEndpoint {
    /// URL or `key=value` connection string, handed to the driver as is.
    ConnectionString(String),
    Discrete {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: Option<String>,
    },
}

impl fmt::Debug for RelationalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionString(s) => f
                .debug_tuple("ConnectionString")
                .field(&endpoint_of(s))
                .finish(),
            Self::Discrete {
                host,
                port,
                database,
                user,
                ..
            } => f
                .debug_struct("Discrete")
                .field("host", host)
                .field("port", port)
                .field("database", database)
                .field("user", user)
                .finish_non_exhaustive(),
        }
    }
}

/// TLS behaviour for relational pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Disabled,
    /// Encrypt but skip peer-certificate and hostname verification.
    AcceptInvalidCerts,
    /// Full verification, requested by `sslmode=verify-ca` or `verify-full`.
    Verified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationalTarget {
    pub endpoint: RelationalEndpoint,
    pub tls: TlsMode,
    pub pool: PoolSettings,
}

impl RelationalTarget {
    pub fn endpoint_label(&self) -> String {
        match &self.endpoint {
            RelationalEndpoint::ConnectionString(s) => endpoint_of(s).to_string(),
            RelationalEndpoint::Discrete {
                host,
                port,
                database,
                ..
            } => format!("{}:{}/{}", host, port, database),
        }
    }
}

/// Pure descriptor-to-target translation; performs no I/O.
pub struct ConnectionBuilder;

impl ConnectionBuilder {
    pub fn build(descriptor: &ConnectionDescriptor) -> BuildResult<ConnectionTarget> {
        let pool = PoolSettings::from_bounds(&descriptor.pool)?;
        match descriptor.backend_kind {
            BackendKind::Document => Self::document(descriptor, pool).map(ConnectionTarget::Document),
            BackendKind::Relational => {
                Self::relational(descriptor, pool).map(ConnectionTarget::Relational)
            }
        }
    }

    fn document(descriptor: &ConnectionDescriptor, pool: PoolSettings) -> BuildResult<DocumentTarget> {
        if let Some(uri) = descriptor.explicit_connection_string() {
            if !(uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://")) {
                return Err(ConfigError::InvalidConnectionString(
                    "expected a mongodb:// or mongodb+srv:// URI".into(),
                ));
            }
            return Ok(DocumentTarget {
                uri: uri.to_string(),
                pool,
            });
        }

        let host = required(descriptor.host.as_deref(), "host")?;

        let credentials = if descriptor.has_credentials() {
            format!(
                "{}:{}@",
                encode_userinfo(descriptor.username.as_deref().unwrap_or_default()),
                encode_userinfo(descriptor.password.as_deref().unwrap_or_default())
            )
        } else {
            String::new()
        };

        // SRV records carry the port.
        let mut uri = if descriptor.srv {
            format!("mongodb+srv://{}{}/", credentials, host)
        } else {
            let port = descriptor.port.unwrap_or(DEFAULT_DOCUMENT_PORT);
            format!("mongodb://{}{}:{}/", credentials, host, port)
        };

        let mut options = Vec::new();
        if descriptor.has_credentials() {
            let source = descriptor
                .auth_source
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_AUTH_SOURCE);
            options.push(format!("authSource={}", encode_userinfo(source)));
            if let Some(mechanism) = descriptor.auth_mechanism.as_deref().filter(|s| !s.is_empty()) {
                options.push(format!("authMechanism={}", encode_userinfo(mechanism)));
            }
        }
        if descriptor.tls {
            options.push("tls=true".to_string());
        }
        if !options.is_empty() {
            uri.push('?');
            uri.push_str(&options.join("&"));
        }

        Ok(DocumentTarget { uri, pool })
    }

    fn relational(
        descriptor: &ConnectionDescriptor,
        pool: PoolSettings,
    ) -> BuildResult<RelationalTarget> {
        if let Some(connection_string) = descriptor.explicit_connection_string() {
            let is_url = connection_string.contains("://");
            if is_url
                && !(connection_string.starts_with("postgres://")
                    || connection_string.starts_with("postgresql://"))
            {
                return Err(ConfigError::InvalidConnectionString(
                    "expected a postgres:// or postgresql:// URL".into(),
                ));
            }

            let (normalized, tls) = match ssl_mode(connection_string) {
                Some(mode) => Self::normalize_ssl_mode(connection_string, &mode, descriptor.tls),
                None => (
                    connection_string.to_string(),
                    if descriptor.tls {
                        TlsMode::AcceptInvalidCerts
                    } else {
                        TlsMode::Disabled
                    },
                ),
            };

            return Ok(RelationalTarget {
                endpoint: RelationalEndpoint::ConnectionString(normalized),
                tls,
                pool,
            });
        }

        let host = required(descriptor.host.as_deref(), "host")?;
        let user = required(descriptor.username.as_deref(), "username")?;

        Ok(RelationalTarget {
            endpoint: RelationalEndpoint::Discrete {
                host: host.to_string(),
                port: descriptor.port.unwrap_or(DEFAULT_RELATIONAL_PORT),
                database: descriptor
                    .database
                    .clone()
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| "postgres".to_string()),
                user: user.to_string(),
                password: descriptor.password.clone(),
            },
            tls: if descriptor.tls {
                TlsMode::AcceptInvalidCerts
            } else {
                TlsMode::Disabled
            },
            pool,
        })
    }

    /// The driver only understands `disable`, `prefer` and `require`; stricter
    /// modes are rewritten to `require` and enforced through [`TlsMode::Verified`].
    fn normalize_ssl_mode(connection_string: &str, mode: &str, tls_flag: bool) -> (String, TlsMode) {
        let (replacement, tls) = match mode {
            "verify-ca" | "verify-full" => ("require", TlsMode::Verified),
            "require" | "prefer" => (mode, TlsMode::AcceptInvalidCerts),
            "allow" => ("prefer", TlsMode::AcceptInvalidCerts),
            "disable" => ("disable", TlsMode::Disabled),
            _ if tls_flag => (mode, TlsMode::AcceptInvalidCerts),
            _ => (mode, TlsMode::Disabled),
        };
        if replacement == mode {
            return (connection_string.to_string(), tls);
        }
        let normalized = connection_string.replacen(
            &format!("sslmode={}", mode),
            &format!("sslmode={}", replacement),
            1,
        );
        (normalized, tls)
    }
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> BuildResult<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingField(field.into()))
}

fn encode_userinfo(s: &str) -> String {
    utf8_percent_encode(s, USERINFO).to_string()
}

/// Extract `sslmode` from a URL query or a `key=value` string.
fn ssl_mode(connection_string: &str) -> Option<String> {
    let start = connection_string.find("sslmode=")? + "sslmode=".len();
    let rest = &connection_string[start..];
    let end = rest
        .find(|c: char| c == '&' || c == ';' || c.is_whitespace())
        .unwrap_or(rest.len());
    Some(rest[..end].to_lowercase())
}

/// Strip scheme, credentials, path and query from a URI for logging.
fn endpoint_of(uri: &str) -> &str {
    let Some((_, rest)) = uri.split_once("://") else {
        return "<connection string>";
    };
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    rest.split(['/', '?']).next().unwrap_or(rest)
}
