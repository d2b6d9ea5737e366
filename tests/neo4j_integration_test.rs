//! Integration tests against a live Neo4j server
//!
//! Run with: NEO4J_URI=bolt://localhost:7687 cargo test --test neo4j_integration_test -- --ignored

use docstore::transport::TransportRegistry;
use docstore::{DatabaseManager, DocumentStore, KeyValueStore};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn manager_from_env(collection: &str) -> Option<DatabaseManager> {
    let Ok(uri) = std::env::var("NEO4J_URI") else {
        println!("Skipping integration test - NEO4J_URI not set");
        return None;
    };
    let user = std::env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string());
    let password = std::env::var("NEO4J_PASSWORD").unwrap_or_else(|_| "password".to_string());

    let manager = DatabaseManager::builder()
        .url(uri)
        .username(user)
        .password(password)
        .collection(collection)
        .pool_min_size(1)
        .pool_max_size(4)
        .registry(Arc::new(TransportRegistry::with_defaults()))
        .build()
        .unwrap();
    Some(manager)
}

#[tokio::test]
#[ignore] // Run only with --ignored when Neo4j is available
async fn test_store_operations_on_neo4j() {
    let Some(manager) = manager_from_env("docstoreIntegration") else {
        return;
    };
    manager.setup().await.unwrap();
    let manager = Arc::new(manager);
    let store = DocumentStore::new(Arc::clone(&manager));

    store.put("alpha", json!({"n": 1})).await.unwrap();
    store.put("alpha", json!("updated")).await.unwrap();
    assert_eq!(store.get("alpha").await.unwrap(), Some(json!("updated")));

    store
        .put_all(HashMap::from([
            ("beta".to_string(), json!(2)),
            ("gamma".to_string(), json!([3])),
        ]))
        .await
        .unwrap();
    assert_eq!(store.get("gamma").await.unwrap(), Some(json!([3])));

    let keys: HashSet<String> = ["alpha", "beta"].iter().map(|k| k.to_string()).collect();
    store.remove_all(&keys).await.unwrap();
    assert_eq!(store.get("alpha").await.unwrap(), None);

    store.remove("gamma").await.unwrap();
    assert_eq!(store.get("gamma").await.unwrap(), None);

    assert!(manager.health_check().await);
    manager.shutdown().await.unwrap();
}
