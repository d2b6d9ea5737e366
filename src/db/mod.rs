//! Session pooling module
//!
//! This module provides the two session pools of a store, built on the
//! bb8 connection pool library, and the manager that owns them.

pub mod connection_manager;
pub mod manager;
pub mod pool;

pub use connection_manager::{
    DocumentMode, DocumentSessionManager, ObjectMode, ObjectSessionManager, SessionManager,
    SessionMode,
};
pub use manager::{
    DatabaseManager, DatabaseManagerBuilder, LifecycleState, ManagerStats, DEFAULT_COLLECTION,
};
pub use pool::{ConnectionPool, PoolError, PoolStats, SessionLease};
