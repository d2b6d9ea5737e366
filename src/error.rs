use thiserror::Error;

use crate::db::PoolError;

pub type Result<T> = std::result::Result<T, KvError>;

/// Conditions signalled by a backing store engine.
///
/// Two of these carry protocol meaning for the pool: a concurrent
/// modification becomes an optimistic locking failure, and a query parsing
/// error is swallowed on the object-mode path.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Record {record} in class {class} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrentModification {
        class: String,
        record: String,
        expected: u64,
        actual: u64,
    },

    #[error("Unable to parse query `{query}`: {reason}")]
    QueryParsing { query: String, reason: String },

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Database already exists: {0}")]
    DatabaseExists(String),

    #[error("Schema class not found: {0}")]
    ClassNotFound(String),

    #[error("Authentication failed for user {0}")]
    Authentication(String),

    #[error("Store unreachable: {0}")]
    Unreachable(String),

    #[error("No engine registered for scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Neo4j error: {0}")]
    Neo4j(#[from] neo4rs::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl DbError {
    pub fn query_parsing(query: &str, reason: impl Into<String>) -> Self {
        DbError::QueryParsing {
            query: query.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, DbError::ConcurrentModification { .. })
    }

    pub fn is_query_parsing(&self) -> bool {
        matches!(self, DbError::QueryParsing { .. })
    }
}

/// Outcomes surfaced to callers of the store and the database manager.
#[derive(Error, Debug)]
pub enum KvError {
    /// A session could not be obtained; fatal for the call, never retried.
    #[error("{message}")]
    Connectivity {
        message: String,
        #[source]
        source: PoolError,
    },

    /// A write lost against a concurrent modification of the same record.
    /// Callers may retry their own read-modify-write sequence.
    #[error("{message}")]
    OptimisticLockingFailure {
        message: String,
        #[source]
        source: DbError,
    },

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// `setup()` or `shutdown()` called in the wrong lifecycle state
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[source] PoolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KvError {
    pub(crate) fn connectivity(source: PoolError) -> Self {
        KvError::Connectivity {
            message: "Unable to establish a connection to the document store. \
                      Check to make sure the store is available."
                .to_string(),
            source,
        }
    }

    pub(crate) fn optimistic_locking(source: DbError) -> Self {
        KvError::OptimisticLockingFailure {
            message: "Object version is different than expected".to_string(),
            source,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, KvError::Connectivity { .. })
    }

    pub fn is_optimistic_locking_failure(&self) -> bool {
        matches!(self, KvError::OptimisticLockingFailure { .. })
    }
}

impl From<PoolError> for KvError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Configuration(msg) => KvError::Configuration(msg),
            PoolError::AlreadySetUp => KvError::Lifecycle(PoolError::AlreadySetUp),
            other => KvError::connectivity(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_optimistic_locking_keeps_cause() {
        let err = KvError::optimistic_locking(DbError::ConcurrentModification {
            class: "keyValue".to_string(),
            record: "#1".to_string(),
            expected: 1,
            actual: 2,
        });

        assert!(err.is_optimistic_locking_failure());
        let cause = err.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(cause.contains("modified concurrently"));
    }

    #[test]
    fn test_pool_errors_become_connectivity() {
        let err: KvError = PoolError::Timeout.into();
        assert!(err.is_connectivity());

        let err: KvError = PoolError::Configuration("bad".to_string()).into();
        assert!(matches!(err, KvError::Configuration(_)));

        let err: KvError = PoolError::AlreadySetUp.into();
        assert!(matches!(err, KvError::Lifecycle(PoolError::AlreadySetUp)));
    }

    #[test]
    fn test_db_error_predicates() {
        let parse = DbError::query_parsing("SELEC", "unknown statement");
        assert!(parse.is_query_parsing());
        assert!(!parse.is_concurrent_modification());
        assert!(parse.to_string().contains("SELEC"));
    }
}
