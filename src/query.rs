//! Statement parsing for the document engines
//!
//! Engines accept a deliberately small statement language, enough for
//! point lookups and keyed deletes:
//!
//! ```text
//! SELECT FROM <class> [WHERE <field> = ?|IN ?] [LIMIT <n>]
//! DELETE FROM <class> [WHERE <field> = ?|IN ?]
//! ```
//!
//! Anything else is rejected with [`DbError::QueryParsing`], which is the
//! malformed-query signal the database manager reacts to.

use regex::Regex;
use std::sync::LazyLock;

use crate::document::Document;
use crate::error::DbError;

static SELECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*SELECT\s+FROM\s+([A-Za-z_][A-Za-z0-9_]*)(?:\s+WHERE\s+([A-Za-z_][A-Za-z0-9_]*)\s*(=|IN)\s*\?)?(?:\s+LIMIT\s+(\d+))?\s*;?\s*$",
    )
    .expect("select pattern is valid")
});

static DELETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*DELETE\s+FROM\s+([A-Za-z_][A-Za-z0-9_]*)(?:\s+WHERE\s+([A-Za-z_][A-Za-z0-9_]*)\s*(=|IN)\s*\?)?\s*;?\s*$",
    )
    .expect("delete pattern is valid")
});

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

/// Check that a class or field name is a plain identifier
pub fn is_identifier(name: &str) -> bool {
    IDENT_RE.is_match(name)
}

/// Positional statement parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Param {
    Text(String),
    List(Vec<String>),
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Text(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Text(value)
    }
}

impl From<Vec<String>> for Param {
    fn from(values: Vec<String>) -> Self {
        Param::List(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    In,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Select { limit: Option<usize> },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: String,
    pub op: Operator,
}

/// A parsed statement, not yet bound to parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub kind: StatementKind,
    pub class: String,
    pub filter: Option<Filter>,
}

/// A filter bound to its parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Equals { field: String, value: String },
    AnyOf { field: String, values: Vec<String> },
}

impl Predicate {
    pub fn field(&self) -> &str {
        match self {
            Predicate::Equals { field, .. } | Predicate::AnyOf { field, .. } => field,
        }
    }

    /// Only string-typed fields ever match a parameter
    pub fn matches(&self, document: &Document) -> bool {
        let Some(actual) = document.value(self.field()).and_then(|v| v.as_str()) else {
            return false;
        };
        match self {
            Predicate::Equals { value, .. } => actual == value,
            Predicate::AnyOf { values, .. } => values.iter().any(|v| v == actual),
        }
    }
}

impl Statement {
    pub fn parse(sql: &str) -> Result<Self, DbError> {
        if let Some(caps) = SELECT_RE.captures(sql) {
            let limit = match caps.get(4) {
                Some(m) => Some(
                    m.as_str()
                        .parse::<usize>()
                        .map_err(|e| DbError::query_parsing(sql, format!("invalid LIMIT: {}", e)))?,
                ),
                None => None,
            };
            return Ok(Self {
                kind: StatementKind::Select { limit },
                class: caps[1].to_string(),
                filter: Self::filter(caps.get(2), caps.get(3)),
            });
        }

        if let Some(caps) = DELETE_RE.captures(sql) {
            return Ok(Self {
                kind: StatementKind::Delete,
                class: caps[1].to_string(),
                filter: Self::filter(caps.get(2), caps.get(3)),
            });
        }

        let head = sql.split_whitespace().next().unwrap_or_default().to_ascii_uppercase();
        let reason = match head.as_str() {
            "SELECT" | "DELETE" => format!("malformed {} statement", head),
            "" => "empty statement".to_string(),
            _ => format!("unsupported statement `{}`", head),
        };
        Err(DbError::query_parsing(sql, reason))
    }

    fn filter(field: Option<regex::Match<'_>>, op: Option<regex::Match<'_>>) -> Option<Filter> {
        let (field, op) = (field?, op?);
        let op = if op.as_str() == "=" { Operator::Eq } else { Operator::In };
        Some(Filter {
            field: field.as_str().to_string(),
            op,
        })
    }

    pub fn limit(&self) -> Option<usize> {
        match self.kind {
            StatementKind::Select { limit } => limit,
            StatementKind::Delete => None,
        }
    }

    /// Bind positional parameters; `sql` is only used for error reporting
    pub fn bind(&self, sql: &str, params: &[Param]) -> Result<Option<Predicate>, DbError> {
        let Some(filter) = &self.filter else {
            if !params.is_empty() {
                return Err(DbError::query_parsing(
                    sql,
                    format!("expected no parameters, got {}", params.len()),
                ));
            }
            return Ok(None);
        };

        let [param] = params else {
            return Err(DbError::query_parsing(
                sql,
                format!("expected 1 parameter, got {}", params.len()),
            ));
        };

        let field = filter.field.clone();
        match (filter.op, param) {
            (Operator::Eq, Param::Text(value)) => Ok(Some(Predicate::Equals {
                field,
                value: value.clone(),
            })),
            (Operator::In, Param::List(values)) => Ok(Some(Predicate::AnyOf {
                field,
                values: values.clone(),
            })),
            (Operator::Eq, Param::List(_)) => Err(DbError::query_parsing(
                sql,
                "`=` requires a single value parameter",
            )),
            (Operator::In, Param::Text(_)) => Err(DbError::query_parsing(
                sql,
                "`IN` requires a list parameter",
            )),
        }
    }
}
