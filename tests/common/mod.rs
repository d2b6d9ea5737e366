//! Shared helpers for integration tests

#![allow(dead_code)]

use docstore::backend::{MemoryDatabase, MemoryEngine};
use docstore::transport::TransportRegistry;
use docstore::{DatabaseManager, DocumentStore, PoolConfig};
use std::sync::Arc;

pub struct TestStore {
    pub engine: Arc<MemoryEngine>,
    pub manager: Arc<DatabaseManager>,
    pub store: DocumentStore,
}

impl TestStore {
    pub fn database(&self) -> Arc<MemoryDatabase> {
        self.engine
            .database(self.manager.url().path())
            .expect("database is created during setup")
    }
}

/// Manager for a fresh embedded database with its own engine, not yet set up
pub fn manager(name: &str) -> (Arc<MemoryEngine>, Arc<DatabaseManager>) {
    let engine = Arc::new(MemoryEngine::new());
    let registry = Arc::new(TransportRegistry::new().with_engine(engine.clone()));
    let manager = DatabaseManager::builder()
        .url(format!("memory:{}", name))
        .pool_config(PoolConfig {
            min_size: 1,
            max_size: 4,
            connection_timeout_secs: 1,
            ..PoolConfig::default()
        })
        .registry(registry)
        .build()
        .expect("valid manager settings");
    (engine, Arc::new(manager))
}

/// Set-up store over a fresh embedded database
pub async fn store(name: &str) -> TestStore {
    let (engine, manager) = manager(name);
    manager.setup().await.expect("setup succeeds");
    let store = DocumentStore::new(Arc::clone(&manager));
    TestStore {
        engine,
        manager,
        store,
    }
}
