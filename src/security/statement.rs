//! SQL statement guard.
//!
//! Lexical injection defense for raw SQL: length bound, stacked statements,
//! dangerous function patterns, mutation keywords, and the leading statement
//! class. Parameterized statements additionally get parameter type and
//! placeholder count checks.

use crate::error::{RejectionKind, SanitizationError, SanitizeResult};
use crate::security::document::type_name;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

/// Keywords that mutate data, change schema, or reach server administration.
static DANGEROUS_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "DROP",
        "DELETE",
        "INSERT",
        "UPDATE",
        "CREATE",
        "ALTER",
        "TRUNCATE",
        "GRANT",
        "REVOKE",
        "EXEC",
        "EXECUTE",
        "COPY",
        "MERGE",
        "CALL",
        "VACUUM",
        "REINDEX",
        "REFRESH",
        "LISTEN",
        "NOTIFY",
    ]
    .into_iter()
    .collect()
});

/// Statement classes allowed to lead a read-only statement.
static READ_STATEMENTS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "SELECT", "WITH", "EXPLAIN", "SHOW", "BEGIN", "COMMIT", "ROLLBACK", "SET", "DECLARE",
        "FETCH", "CLOSE",
    ]
    .into_iter()
    .collect()
});

/// Patterns rejected regardless of write permission.
/// All patterns are compile-time constants, so expect() is safe here.
static DANGEROUS_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "stacked query",
            Regex::new(
                r"(?i);\s*(DROP|DELETE|UPDATE|INSERT|TRUNCATE|ALTER|CREATE|GRANT|REVOKE|EXEC|EXECUTE|COPY|SHUTDOWN)\b",
            )
            .expect("Invalid regex: stacked query pattern"),
        ),
        (
            "time delay",
            Regex::new(r"(?i)\bpg_sleep(_for|_until)?\s*\(")
                .expect("Invalid regex: pg_sleep pattern"),
        ),
        (
            "time delay",
            Regex::new(r"(?i)\bsleep\s*\(").expect("Invalid regex: SLEEP pattern"),
        ),
        (
            "time delay",
            Regex::new(r"(?i)\bbenchmark\s*\(").expect("Invalid regex: BENCHMARK pattern"),
        ),
        (
            "time delay",
            Regex::new(r"(?i)\bwaitfor\s+delay\b").expect("Invalid regex: WAITFOR DELAY pattern"),
        ),
        (
            "file access",
            Regex::new(r"(?i)\bpg_(read_file|read_binary_file|ls_dir|stat_file)\s*\(")
                .expect("Invalid regex: pg file function pattern"),
        ),
        (
            "file access",
            Regex::new(r"(?i)\blo_(import|export)\s*\(")
                .expect("Invalid regex: large object pattern"),
        ),
        (
            "file access",
            Regex::new(r"(?i)\bload_file\s*\(").expect("Invalid regex: LOAD_FILE pattern"),
        ),
        (
            "file access",
            Regex::new(r"(?i)\binto\s+(out|dump)file\b")
                .expect("Invalid regex: INTO OUTFILE pattern"),
        ),
        (
            "command execution",
            Regex::new(r"(?i)\b(to|from)\s+program\b").expect("Invalid regex: PROGRAM pattern"),
        ),
        (
            "command execution",
            Regex::new(r"(?i)\bxp_cmdshell\b").expect("Invalid regex: xp_cmdshell pattern"),
        ),
        (
            "command execution",
            Regex::new(r"(?i)\bdblink(_exec|_connect)?\s*\(")
                .expect("Invalid regex: dblink pattern"),
        ),
    ]
});

/// Positional placeholder (`$1`, `$2`, ...).
static PLACEHOLDER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(\d+)").expect("Invalid regex: placeholder pattern"));

/// Statement guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatementPolicy {
    pub allow_write: bool,
    pub allow_multiple_statements: bool,
    pub max_length: usize,
    pub max_params: usize,
}

impl Default for StatementPolicy {
    fn default() -> Self {
        Self {
            allow_write: false,
            allow_multiple_statements: false,
            max_length: 100_000,
            max_params: 100,
        }
    }
}

/// A bound-ready parameter that passed type validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
    Array(Vec<SqlParam>),
    Object(Map<String, Value>),
}

impl SqlParam {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "string",
            Self::Timestamp(_) => "date",
            Self::Bytes(_) => "binary",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }
}

/// SQL and parameters after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// SQL statement validator.
#[derive(Debug, Clone, Default)]
pub struct StatementGuard {
    policy: StatementPolicy,
}

impl StatementGuard {
    pub fn new(policy: StatementPolicy) -> Self {
        Self { policy }
    }

    pub fn allow_write(mut self, allow: bool) -> Self {
        self.policy.allow_write = allow;
        self
    }

    pub fn allow_multiple_statements(mut self, allow: bool) -> Self {
        self.policy.allow_multiple_statements = allow;
        self
    }

    pub fn max_length(mut self, length: usize) -> Self {
        self.policy.max_length = length;
        self
    }

    pub fn max_params(mut self, count: usize) -> Self {
        self.policy.max_params = count;
        self
    }

    pub fn policy(&self) -> &StatementPolicy {
        &self.policy
    }

    /// Validate a statement and return its sanitized form.
    ///
    /// The sanitized form is trimmed with a single trailing semicolon removed.
    pub fn validate_statement(&self, sql: &str) -> SanitizeResult<String> {
        debug!("Validating statement: {}", truncate(sql, 100));

        self.check_length(sql)
            .and_then(|_| self.check_multiple_statements(sql))
            .and_then(|_| self.check_dangerous_patterns(sql))
            .and_then(|_| self.check_dangerous_keywords(sql))
            .and_then(|_| self.check_statement_class(sql))
            .inspect_err(|e| warn!(kind = ?e.kind, token = %e.token, "SQL statement rejected"))?;

        Ok(sanitize(sql))
    }

    /// Validate a statement together with its positional parameters.
    pub fn validate_parameterized_statement(
        &self,
        sql: &str,
        params: &[Value],
    ) -> SanitizeResult<ValidatedStatement> {
        let sql = self.validate_statement(sql)?;

        let params = self
            .check_params(params)
            .and_then(|params| {
                check_placeholders(&sql, params.len())?;
                Ok(params)
            })
            .inspect_err(|e| warn!(kind = ?e.kind, token = %e.token, "SQL parameters rejected"))?;

        debug!("Statement accepted with {} parameters", params.len());
        Ok(ValidatedStatement { sql, params })
    }

    fn check_length(&self, sql: &str) -> SanitizeResult<()> {
        let length = sql.chars().count();
        if length > self.policy.max_length {
            return Err(SanitizationError::new(
                RejectionKind::LengthExceeded,
                length.to_string(),
                format!(
                    "statement exceeds maximum length of {} characters",
                    self.policy.max_length
                ),
            ));
        }
        Ok(())
    }

    fn check_multiple_statements(&self, sql: &str) -> SanitizeResult<()> {
        if self.policy.allow_multiple_statements {
            return Ok(());
        }
        let trimmed = sql.trim();
        let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
        if body.contains(';') {
            return Err(SanitizationError::new(
                RejectionKind::MultipleStatements,
                ";",
                "multiple statements are not allowed",
            ));
        }
        Ok(())
    }

    fn check_dangerous_patterns(&self, sql: &str) -> SanitizeResult<()> {
        for (name, pattern) in DANGEROUS_PATTERNS.iter() {
            if let Some(found) = pattern.find(sql) {
                return Err(SanitizationError::new(
                    RejectionKind::DangerousPattern,
                    found.as_str().trim(),
                    format!("{} pattern detected", name),
                ));
            }
        }
        Ok(())
    }

    fn check_dangerous_keywords(&self, sql: &str) -> SanitizeResult<()> {
        if self.policy.allow_write {
            return Ok(());
        }
        for word in words(sql) {
            let upper = word.to_uppercase();
            if DANGEROUS_KEYWORDS.contains(upper.as_str()) {
                return Err(SanitizationError::new(
                    RejectionKind::DangerousKeyword,
                    upper,
                    "keyword requires write permission",
                ));
            }
        }
        Ok(())
    }

    fn check_statement_class(&self, sql: &str) -> SanitizeResult<()> {
        if self.policy.allow_write {
            return Ok(());
        }
        let leading = words(sql.trim_start_matches(|c: char| c.is_whitespace() || c == '('))
            .next()
            .map(str::to_uppercase)
            .unwrap_or_default();
        if !READ_STATEMENTS.contains(leading.as_str()) {
            return Err(SanitizationError::new(
                RejectionKind::StatementNotAllowed,
                if leading.is_empty() { "<empty>".to_string() } else { leading },
                "only SELECT, WITH, EXPLAIN, SHOW and transaction control statements are allowed",
            ));
        }
        Ok(())
    }

    fn check_params(&self, params: &[Value]) -> SanitizeResult<Vec<SqlParam>> {
        if params.len() > self.policy.max_params {
            return Err(SanitizationError::new(
                RejectionKind::TooManyParams,
                params.len().to_string(),
                format!("at most {} parameters are allowed", self.policy.max_params),
            ));
        }
        params
            .iter()
            .enumerate()
            .map(|(index, value)| convert_param(index, value))
            .collect()
    }
}

/// Convert one untrusted JSON parameter into a typed parameter.
fn convert_param(index: usize, value: &Value) -> SanitizeResult<SqlParam> {
    match value {
        Value::Null => Ok(SqlParam::Null),
        Value::Bool(b) => Ok(SqlParam::Bool(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(SqlParam::Int(i)),
            None => n
                .as_f64()
                .filter(|f| f.is_finite())
                .map(SqlParam::Float)
                .ok_or_else(|| invalid_param(index, "number", "number is out of range")),
        },
        Value::String(s) => Ok(SqlParam::Text(s.clone())),
        Value::Array(items) => items
            .iter()
            .map(|item| convert_param(index, item))
            .collect::<SanitizeResult<Vec<_>>>()
            .map(SqlParam::Array),
        Value::Object(map) => convert_object(index, map),
    }
}

/// Plain objects pass through as JSON; `$date` and `$binary` wrappers become
/// typed values; any other `$`-tagged object is rejected.
fn convert_object(index: usize, map: &Map<String, Value>) -> SanitizeResult<SqlParam> {
    let Some(tag) = map.keys().find(|k| k.starts_with('$')) else {
        return Ok(SqlParam::Object(map.clone()));
    };
    if map.len() != 1 {
        return Err(invalid_param(index, tag, "typed wrapper must have exactly one key"));
    }

    match (tag.as_str(), &map[tag]) {
        ("$date", Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|d| SqlParam::Timestamp(d.with_timezone(&Utc)))
            .map_err(|_| invalid_param(index, "$date", "date is not RFC 3339")),
        ("$date", Value::Number(n)) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .map(SqlParam::Timestamp)
            .ok_or_else(|| invalid_param(index, "$date", "date is out of range")),
        ("$binary", Value::String(s)) => BASE64
            .decode(s)
            .map(SqlParam::Bytes)
            .map_err(|_| invalid_param(index, "$binary", "binary is not valid base64")),
        ("$binary", Value::Object(inner)) => inner
            .get("base64")
            .and_then(Value::as_str)
            .and_then(|s| BASE64.decode(s).ok())
            .map(SqlParam::Bytes)
            .ok_or_else(|| invalid_param(index, "$binary", "binary is not valid base64")),
        (tag, inner) => Err(invalid_param(
            index,
            tag,
            format!("unsupported typed object carrying {}", type_name(inner)),
        )),
    }
}

fn invalid_param(index: usize, kind: &str, detail: impl Into<String>) -> SanitizationError {
    SanitizationError::new(
        RejectionKind::ParamTypeInvalid,
        format!("params[{}]", index),
        format!("{}: {}", kind, detail.into()),
    )
}

/// Require the distinct placeholders to be exactly `$1..=$count`.
fn check_placeholders(sql: &str, count: usize) -> SanitizeResult<()> {
    let found = placeholders(sql);
    let highest = found.iter().next_back().copied().unwrap_or(0);
    if found.len() != count || highest != count {
        return Err(SanitizationError::new(
            RejectionKind::PlaceholderMismatch,
            format!("{} placeholders", found.len()),
            format!(
                "statement references {} placeholders (highest ${}) but {} parameters were supplied",
                found.len(),
                highest,
                count
            ),
        ));
    }
    Ok(())
}

/// Distinct placeholder indices outside single-quoted literals.
fn placeholders(sql: &str) -> BTreeSet<usize> {
    let mut outside = String::with_capacity(sql.len());
    let mut in_literal = false;
    for c in sql.chars() {
        if c == '\'' {
            in_literal = !in_literal;
            outside.push(' ');
        } else if in_literal {
            outside.push(' ');
        } else {
            outside.push(c);
        }
    }

    PLACEHOLDER_REGEX
        .captures_iter(&outside)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect()
}

fn words(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| !s.is_empty())
}

fn sanitize(sql: &str) -> String {
    let trimmed = sql.trim();
    trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end().to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard() -> StatementGuard {
        StatementGuard::default()
    }

    #[test]
    fn test_valid_select() {
        assert!(guard().validate_statement("SELECT * FROM users").is_ok());
        assert!(
            guard()
                .validate_statement("SELECT id, name FROM users WHERE id = 1")
                .is_ok()
        );
        assert!(
            guard()
                .validate_statement("WITH cte AS (SELECT 1) SELECT * FROM cte")
                .is_ok()
        );
        assert!(guard().validate_statement("  explain select 1").is_ok());
    }

    #[test]
    fn test_trailing_semicolon() {
        assert_eq!(guard().validate_statement("SELECT 1;").unwrap(), "SELECT 1");
        assert_eq!(
            guard().validate_statement("  SELECT 1 ;  ").unwrap(),
            "SELECT 1"
        );
    }

    #[test]
    fn test_stacked_statement_rejected() {
        let err = guard()
            .validate_statement("SELECT 1; DROP TABLE x")
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::MultipleStatements);

        let err = guard().validate_statement("SELECT 1;;").unwrap_err();
        assert_eq!(err.kind, RejectionKind::MultipleStatements);
    }

    #[test]
    fn test_stacked_pattern_when_multiple_allowed() {
        let err = guard()
            .allow_multiple_statements(true)
            .allow_write(true)
            .validate_statement("SELECT 1; DROP TABLE x")
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::DangerousPattern);
        assert_eq!(err.token, "; DROP");
    }

    #[test]
    fn test_dangerous_patterns_ignore_write_permission() {
        let writer = guard().allow_write(true);
        for sql in [
            "SELECT pg_sleep(10)",
            "SELECT * FROM t WHERE id = 1 AND SLEEP (5)",
            "SELECT pg_read_file('/etc/passwd')",
            "COPY t FROM PROGRAM 'rm -rf /'",
            "SELECT lo_import('/etc/shadow')",
            "SELECT * INTO OUTFILE '/tmp/x' FROM t",
        ] {
            let err = writer.validate_statement(sql).unwrap_err();
            assert_eq!(err.kind, RejectionKind::DangerousPattern, "{}", sql);
        }
    }

    #[test]
    fn test_dangerous_keywords() {
        for (sql, keyword) in [
            ("DROP TABLE users", "DROP"),
            ("DELETE FROM users", "DELETE"),
            ("INSERT INTO users VALUES (1)", "INSERT"),
            ("update users set name = 'x'", "UPDATE"),
            ("SELECT * FROM t FOR UPDATE", "UPDATE"),
        ] {
            let err = guard().validate_statement(sql).unwrap_err();
            assert_eq!(err.kind, RejectionKind::DangerousKeyword);
            assert_eq!(err.token, keyword);
        }
    }

    #[test]
    fn test_keyword_word_boundary() {
        assert!(
            guard()
                .validate_statement("SELECT updated_at, created_by FROM dropped_items")
                .is_ok()
        );
    }

    #[test]
    fn test_common_column_names_accepted() {
        for sql in [
            "SELECT owner, security, lock FROM pets",
            "SELECT load, cluster FROM servers WHERE do_not_contact = false",
        ] {
            assert!(guard().validate_statement(sql).is_ok(), "{}", sql);
        }

        // Administrative statements are still refused by their leading keyword.
        for (sql, leading) in [
            ("LOCK TABLE pets", "LOCK"),
            ("CLUSTER pets", "CLUSTER"),
            ("LOAD 'auto_explain'", "LOAD"),
            ("DO $$ BEGIN END $$", "DO"),
        ] {
            let err = guard().validate_statement(sql).unwrap_err();
            assert_eq!(err.kind, RejectionKind::StatementNotAllowed, "{}", sql);
            assert_eq!(err.token, leading);
        }
    }

    #[test]
    fn test_write_allowed() {
        let writer = guard().allow_write(true);
        assert!(writer.validate_statement("INSERT INTO t VALUES (1)").is_ok());
        assert!(writer.validate_statement("DELETE FROM t WHERE id = 2").is_ok());
    }

    #[test]
    fn test_statement_class() {
        let err = guard().validate_statement("VALUES (1)").unwrap_err();
        assert_eq!(err.kind, RejectionKind::StatementNotAllowed);
        assert_eq!(err.token, "VALUES");

        for sql in ["BEGIN", "COMMIT;", "ROLLBACK", "SHOW search_path", "SET search_path TO public"] {
            assert!(guard().validate_statement(sql).is_ok(), "{}", sql);
        }
        assert!(guard().validate_statement("(SELECT 1)").is_ok());
        assert!(guard().validate_statement("   ").is_err());
    }

    #[test]
    fn test_length_bound() {
        let err = guard()
            .max_length(20)
            .validate_statement("SELECT * FROM users WHERE name = 'long'")
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::LengthExceeded);
    }

    #[test]
    fn test_length_checked_first() {
        let err = guard()
            .max_length(5)
            .validate_statement("SELECT 1; DROP TABLE x")
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::LengthExceeded);
    }

    #[test]
    fn test_placeholder_mismatch() {
        let err = guard()
            .validate_parameterized_statement("SELECT * FROM t WHERE id = $1", &[json!(1), json!(2)])
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::PlaceholderMismatch);

        let err = guard()
            .validate_parameterized_statement("SELECT * FROM t WHERE id = $1 AND b = $2", &[json!(1)])
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::PlaceholderMismatch);

        let err = guard()
            .validate_parameterized_statement("SELECT $1, $3", &[json!(1), json!(2)])
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::PlaceholderMismatch);
    }

    #[test]
    fn test_placeholders_counted_distinct_outside_literals() {
        let statement = guard()
            .validate_parameterized_statement(
                "SELECT * FROM t WHERE a = $1 OR b = $1 OR c = '$2'",
                &[json!("x")],
            )
            .unwrap();
        assert_eq!(statement.params, vec![SqlParam::Text("x".into())]);
    }

    #[test]
    fn test_param_types() {
        let statement = guard()
            .validate_parameterized_statement(
                "SELECT $1, $2, $3, $4, $5, $6, $7, $8",
                &[
                    json!(null),
                    json!(true),
                    json!(42),
                    json!(1.5),
                    json!({"$date": "2024-05-01T10:00:00Z"}),
                    json!({"$binary": "aGVsbG8="}),
                    json!([1, 2, 3]),
                    json!({"plain": {"nested": 1}}),
                ],
            )
            .unwrap();
        let kinds: Vec<_> = statement.params.iter().map(SqlParam::kind).collect();
        assert_eq!(
            kinds,
            vec!["null", "boolean", "integer", "float", "date", "binary", "array", "object"]
        );
        assert_eq!(statement.params[5], SqlParam::Bytes(b"hello".to_vec()));
    }

    #[test]
    fn test_param_type_rejected_with_index() {
        let err = guard()
            .validate_parameterized_statement("SELECT $1, $2", &[json!(1), json!({"$function": "x"})])
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::ParamTypeInvalid);
        assert_eq!(err.token, "params[1]");
        assert!(err.message.contains("$function"));

        let err = guard()
            .validate_parameterized_statement("SELECT $1", &[json!({"$date": "yesterday"})])
            .unwrap_err();
        assert_eq!(err.token, "params[0]");
    }

    #[test]
    fn test_too_many_params() {
        let params: Vec<Value> = (0..3).map(|i| json!(i)).collect();
        let err = guard()
            .max_params(2)
            .validate_parameterized_statement("SELECT $1, $2, $3", &params)
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::TooManyParams);
    }
}
