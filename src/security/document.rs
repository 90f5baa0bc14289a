//! Document-store query sanitizer.
//!
//! Walks untrusted filter documents, aggregation pipelines and write payloads
//! and rejects any operator outside the policy vocabulary. The walk is
//! all-or-nothing: either the whole value is accepted and returned, or the
//! first violation is reported.

use crate::error::{RejectionKind, SanitizationError, SanitizeResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Prefix that marks a key as an operator rather than a field name.
pub const OPERATOR_SIGIL: char = '$';

/// Query operators accepted inside filters.
const QUERY_OPERATORS: &[&str] = &[
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin",
    "$and", "$or", "$nor", "$not",
    "$exists", "$type",
    "$regex", "$options",
    "$all", "$elemMatch", "$size",
    "$mod",
    "$text", "$search", "$language", "$caseSensitive", "$diacriticSensitive",
    "$geoWithin", "$geoIntersects", "$near", "$nearSphere", "$geometry",
    "$maxDistance", "$minDistance", "$box", "$center", "$centerSphere", "$polygon",
    "$bitsAllSet", "$bitsAnySet", "$bitsAllClear", "$bitsAnyClear",
    "$comment",
];

/// Extended JSON type wrappers, needed to express ObjectIds, dates and other
/// typed literals through a JSON payload.
const TYPE_WRAPPERS: &[&str] = &[
    "$oid", "$date", "$numberInt", "$numberLong", "$numberDouble", "$numberDecimal",
    "$binary", "$uuid", "$regularExpression", "$timestamp", "$minKey", "$maxKey",
];

/// Operators that evaluate server-side code or arbitrary expressions.
const DENIED_OPERATORS: &[&str] = &["$where", "$expr", "$function", "$accumulator"];

const PIPELINE_STAGES: &[&str] = &[
    "$match", "$project", "$group", "$sort", "$limit", "$skip", "$unwind",
    "$lookup", "$count", "$addFields", "$set", "$unset", "$facet",
    "$bucket", "$bucketAuto", "$sortByCount", "$replaceRoot", "$replaceWith",
    "$sample", "$densify", "$fill", "$setWindowFields", "$unionWith",
];

/// Stages that write data or expose server internals.
const DENIED_STAGES: &[&str] = &[
    "$out", "$merge", "$currentOp", "$listSessions", "$listLocalSessions",
    "$planCacheStats", "$function", "$accumulator", "$where",
];

const UPDATE_OPERATORS: &[&str] = &[
    "$set", "$unset", "$inc", "$mul", "$rename", "$min", "$max",
    "$currentDate", "$setOnInsert", "$push", "$pull", "$pullAll", "$addToSet", "$pop",
];

/// Modifiers valid inside `$push` / `$addToSet` bodies.
const UPDATE_MODIFIERS: &[&str] = &["$each", "$position", "$slice", "$sort"];

fn to_set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Immutable operator vocabulary for the document backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentPolicy {
    pub allowed_operators: HashSet<String>,
    pub denied_operators: HashSet<String>,
    pub allowed_stages: HashSet<String>,
    pub denied_stages: HashSet<String>,
    pub update_operators: HashSet<String>,
    pub max_depth: usize,
    pub max_limit: i64,
    pub default_limit: i64,
}

impl Default for DocumentPolicy {
    fn default() -> Self {
        let mut allowed_operators = to_set(QUERY_OPERATORS);
        allowed_operators.extend(to_set(TYPE_WRAPPERS));
        Self {
            allowed_operators,
            denied_operators: to_set(DENIED_OPERATORS),
            allowed_stages: to_set(PIPELINE_STAGES),
            denied_stages: to_set(DENIED_STAGES),
            update_operators: to_set(UPDATE_OPERATORS),
            max_depth: 10,
            max_limit: 1000,
            default_limit: 50,
        }
    }
}

impl DocumentPolicy {
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn max_limit(mut self, limit: i64) -> Self {
        self.max_limit = limit;
        self
    }

    pub fn deny_operator(mut self, operator: impl Into<String>) -> Self {
        let operator = operator.into();
        self.allowed_operators.remove(&operator);
        self.denied_operators.insert(operator);
        self
    }
}

/// Which `$`-keys a walk accepts below the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Vocabulary {
    /// Filter documents: the query operator allow-list.
    Query,
    /// Stored documents: type wrappers only.
    Data,
    /// Bodies of update operators: type wrappers plus array modifiers.
    UpdateBody,
}

/// Filter, sort, projection and paging after sanitization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SanitizedQuery {
    pub filter: Map<String, Value>,
    pub sort: Map<String, Value>,
    pub projection: Map<String, Value>,
    pub skip: u64,
    pub limit: i64,
}

impl SanitizedQuery {
    /// One-based page number implied by `skip` and `limit`.
    pub fn page(&self) -> u64 {
        if self.limit <= 0 {
            return 1;
        }
        self.skip / self.limit as u64 + 1
    }
}

/// Stateless sanitizer bound to one policy.
#[derive(Debug, Clone, Default)]
pub struct DocumentQuerySanitizer {
    policy: DocumentPolicy,
}

impl DocumentQuerySanitizer {
    pub fn new(policy: DocumentPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DocumentPolicy {
        &self.policy
    }

    /// Validate a filter value, returning an equivalent value on success.
    pub fn sanitize_filter(&self, value: &Value) -> SanitizeResult<Value> {
        self.walk(value, 1, Vocabulary::Query).inspect_err(log_rejection)
    }

    /// Validate the top-level stage names of an aggregation pipeline.
    ///
    /// Stage bodies are passed through untouched.
    pub fn sanitize_pipeline(&self, stages: &Value) -> SanitizeResult<Vec<Value>> {
        let Value::Array(stages) = stages else {
            return Err(log_and_return(SanitizationError::new(
                RejectionKind::InvalidShape,
                type_name(stages),
                "pipeline must be an array of stages",
            )));
        };

        let mut sanitized = Vec::with_capacity(stages.len());
        for (index, stage) in stages.iter().enumerate() {
            let name = match stage {
                Value::Object(map) if map.len() == 1 => map.keys().next().cloned().unwrap_or_default(),
                _ => {
                    return Err(log_and_return(SanitizationError::new(
                        RejectionKind::InvalidShape,
                        format!("stage[{}]", index),
                        "each stage must be an object with exactly one operator key",
                    )));
                }
            };

            if self.policy.denied_stages.contains(&name) {
                return Err(log_and_return(SanitizationError::new(
                    RejectionKind::DisallowedStage,
                    name,
                    "pipeline stage is denied",
                )));
            }
            if !self.policy.allowed_stages.contains(&name) {
                return Err(log_and_return(SanitizationError::new(
                    RejectionKind::DisallowedStage,
                    name,
                    "pipeline stage is not in the allow-list",
                )));
            }
            sanitized.push(stage.clone());
        }

        debug!("Pipeline accepted with {} stages", sanitized.len());
        Ok(sanitized)
    }

    /// Sanitize find parameters: the filter is walked, paging is clamped.
    pub fn sanitize_query_params(&self, params: &Value) -> SanitizeResult<SanitizedQuery> {
        let empty = Map::new();
        let params = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(log_and_return(SanitizationError::new(
                    RejectionKind::InvalidShape,
                    type_name(other),
                    "query parameters must be an object",
                )));
            }
        };

        let filter = match params.get("filter") {
            None | Some(Value::Null) => Map::new(),
            Some(value @ Value::Object(_)) => match self.sanitize_filter(value)? {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            Some(other) => {
                return Err(log_and_return(SanitizationError::new(
                    RejectionKind::InvalidShape,
                    type_name(other),
                    "filter must be an object",
                )));
            }
        };

        let sort = object_or_empty(params.get("sort"), "sort")?;
        let projection = object_or_empty(params.get("projection"), "projection")?;

        let skip = params
            .get("skip")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0) as u64;

        let limit = match params.get("limit").and_then(Value::as_i64) {
            Some(limit) if limit > 0 => limit.min(self.policy.max_limit),
            _ => self.policy.default_limit.min(self.policy.max_limit),
        };

        Ok(SanitizedQuery {
            filter,
            sort,
            projection,
            skip,
            limit,
        })
    }

    /// Validate a document about to be stored: no operators, only type wrappers.
    pub fn sanitize_document(&self, value: &Value) -> SanitizeResult<Map<String, Value>> {
        match value {
            Value::Object(_) => match self.walk(value, 1, Vocabulary::Data) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Ok(Map::new()),
                Err(e) => Err(log_and_return(e)),
            },
            other => Err(log_and_return(SanitizationError::new(
                RejectionKind::InvalidShape,
                type_name(other),
                "document must be an object",
            ))),
        }
    }

    /// Validate an update specification: top-level keys must be update operators.
    pub fn sanitize_update(&self, value: &Value) -> SanitizeResult<Map<String, Value>> {
        let Value::Object(update) = value else {
            return Err(log_and_return(SanitizationError::new(
                RejectionKind::InvalidShape,
                type_name(value),
                "update must be an object",
            )));
        };
        if update.is_empty() {
            return Err(log_and_return(SanitizationError::new(
                RejectionKind::InvalidShape,
                "{}",
                "update must contain at least one operator",
            )));
        }

        let mut sanitized = Map::with_capacity(update.len());
        for (operator, body) in update {
            if !self.policy.update_operators.contains(operator)
                || self.policy.denied_operators.contains(operator)
            {
                return Err(log_and_return(SanitizationError::new(
                    RejectionKind::DisallowedOperator,
                    operator.clone(),
                    "update operator is not allowed",
                )));
            }
            if !body.is_object() {
                return Err(log_and_return(SanitizationError::new(
                    RejectionKind::InvalidShape,
                    operator.clone(),
                    "update operator body must be an object",
                )));
            }
            let body = self
                .walk(body, 2, Vocabulary::UpdateBody)
                .inspect_err(log_rejection)?;
            sanitized.insert(operator.clone(), body);
        }
        Ok(sanitized)
    }

    fn walk(&self, value: &Value, depth: usize, vocabulary: Vocabulary) -> SanitizeResult<Value> {
        match value {
            Value::Object(map) => {
                self.check_depth(depth)?;
                let mut out = Map::with_capacity(map.len());
                for (key, child) in map {
                    if key.starts_with(OPERATOR_SIGIL) {
                        self.check_operator(key, vocabulary)?;
                    }
                    out.insert(key.clone(), self.walk(child, depth + 1, vocabulary)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                self.check_depth(depth)?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Object(_) | Value::Array(_) => {
                            out.push(self.walk(item, depth + 1, vocabulary)?)
                        }
                        leaf => out.push(leaf.clone()),
                    }
                }
                Ok(Value::Array(out))
            }
            leaf => Ok(leaf.clone()),
        }
    }

    fn check_depth(&self, depth: usize) -> SanitizeResult<()> {
        if depth > self.policy.max_depth {
            return Err(SanitizationError::new(
                RejectionKind::DepthExceeded,
                depth.to_string(),
                format!("nesting exceeds maximum depth of {}", self.policy.max_depth),
            ));
        }
        Ok(())
    }

    fn check_operator(&self, key: &str, vocabulary: Vocabulary) -> SanitizeResult<()> {
        if self.policy.denied_operators.contains(key) {
            return Err(SanitizationError::new(
                RejectionKind::DisallowedOperator,
                key,
                "operator is denied",
            ));
        }

        let permitted = match vocabulary {
            Vocabulary::Query => self.policy.allowed_operators.contains(key),
            Vocabulary::Data => TYPE_WRAPPERS.contains(&key),
            Vocabulary::UpdateBody => TYPE_WRAPPERS.contains(&key) || UPDATE_MODIFIERS.contains(&key),
        };
        if !permitted {
            return Err(SanitizationError::new(
                RejectionKind::DisallowedOperator,
                key,
                match vocabulary {
                    Vocabulary::Query => "operator is not in the allow-list",
                    Vocabulary::Data => "operators are not permitted in stored documents",
                    Vocabulary::UpdateBody => "operator is not permitted inside an update",
                },
            ));
        }
        Ok(())
    }
}

fn object_or_empty(value: Option<&Value>, field: &'static str) -> SanitizeResult<Map<String, Value>> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => Err(log_and_return(SanitizationError::new(
            RejectionKind::InvalidShape,
            type_name(other),
            format!("{} must be an object", field),
        ))),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn log_rejection(err: &SanitizationError) {
    warn!(kind = ?err.kind, token = %err.token, "Document payload rejected");
}

fn log_and_return(err: SanitizationError) -> SanitizationError {
    log_rejection(&err);
    err
}
