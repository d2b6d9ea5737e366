pub mod backend;
pub mod client;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod logging;
pub mod query;
pub mod store;
pub mod transport;

pub use backend::{MemoryEngine, Neo4jEngine};
pub use client::{Credentials, StoreUrl};
pub use config::{Config, LoggingConfig, PoolConfig, StoreConfig};
pub use db::{DatabaseManager, LifecycleState, PoolError};
pub use document::{Document, FieldType};
pub use error::{DbError, KvError, Result};
pub use store::{DocumentStore, KeyValueStore};
