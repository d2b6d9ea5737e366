//! Key-value store on top of the document pool
//!
//! Every entry is one document of the store's collection with a string
//! `key` field and a typed `value` field. The backing engines have no
//! native upsert, so `put` reads the entry first and then inserts or
//! updates it; two writers racing on a key that does not exist yet can both
//! insert.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::client::{Connection, DocumentConnection};
use crate::db::DatabaseManager;
use crate::document::{Document, Field};
use crate::error::{DbError, Result};
use crate::query::Param;

pub const KEY_FIELD: &str = "key";
pub const VALUE_FIELD: &str = "value";

/// Key-value contract of a store
#[allow(async_fn_in_trait)]
pub trait KeyValueStore<V> {
    async fn put(&self, key: &str, value: V) -> Result<()>;

    /// Put every entry within one database call. Entries written before a
    /// failure stay written.
    async fn put_all(&self, entries: HashMap<String, V>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<V>>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove all given keys with a single bulk delete
    async fn remove_all(&self, keys: &HashSet<String>) -> Result<()>;
}

/// [`KeyValueStore`] over JSON values, kept in the collection of a
/// [`DatabaseManager`]
#[derive(Debug, Clone)]
pub struct DocumentStore {
    db: Arc<DatabaseManager>,
    collection: String,
    select_sql: String,
    delete_sql: String,
    delete_all_sql: String,
}

impl DocumentStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        let collection = db.collection().to_string();
        Self {
            select_sql: format!("SELECT FROM {} WHERE {} = ? LIMIT 1", collection, KEY_FIELD),
            delete_sql: format!("DELETE FROM {} WHERE {} = ?", collection, KEY_FIELD),
            delete_all_sql: format!("DELETE FROM {} WHERE {} IN ?", collection, KEY_FIELD),
            collection,
            db,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn manager(&self) -> &Arc<DatabaseManager> {
        &self.db
    }

    /// Serialize `value` and put it under `key`
    pub async fn put_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put(key, serde_json::to_value(value)?).await
    }

    /// Get the value under `key` deserialized as `T`
    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn find_entry<C>(&self, session: &mut C, key: &str) -> std::result::Result<Option<Document>, DbError>
    where
        C: Connection + ?Sized,
    {
        let found = session.query(&self.select_sql, &[Param::from(key)]).await?;
        Ok(found.into_iter().next())
    }

    async fn upsert(
        &self,
        session: &mut dyn DocumentConnection,
        key: &str,
        value: Value,
    ) -> std::result::Result<(), DbError> {
        let mut entry = match self.find_entry(session, key).await? {
            Some(existing) => existing,
            None => {
                let mut entry = Document::new(self.collection.as_str());
                entry.set_field(KEY_FIELD, Value::String(key.to_string()));
                entry
            }
        };
        entry.set_field(VALUE_FIELD, value);
        session.save(&mut entry).await
    }
}

impl KeyValueStore<Value> for DocumentStore {
    #[instrument(skip(self, value))]
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.db
            .execute_doc_call(async move |session| self.upsert(session, key, value).await)
            .await
    }

    #[instrument(skip(self, entries), fields(count = entries.len()))]
    async fn put_all(&self, entries: HashMap<String, Value>) -> Result<()> {
        self.db
            .execute_doc_call(async move |session| {
                for (key, value) in entries {
                    self.upsert(session, &key, value).await?;
                }
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.db
            .execute_doc_call(async |session| {
                let entry = self.find_entry(session, key).await?;
                Ok(entry
                    .and_then(|mut doc| doc.take_field(VALUE_FIELD))
                    .map(Field::into_value))
            })
            .await
    }

    #[instrument(skip(self))]
    async fn remove(&self, key: &str) -> Result<()> {
        let removed = self
            .db
            .execute_doc_call(async |session| {
                session.command(&self.delete_sql, &[Param::from(key)]).await
            })
            .await?;
        debug!("Removed {} entries for key {}", removed, key);
        Ok(())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn remove_all(&self, keys: &HashSet<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = keys.iter().cloned().collect();
        let removed = self
            .db
            .execute_doc_call(async move |session| {
                session.command(&self.delete_all_sql, &[Param::from(keys)]).await
            })
            .await?;
        debug!("Removed {} entries", removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryEngine;
    use crate::transport::TransportRegistry;
    use serde::Deserialize;
    use serde_json::json;

    async fn store(name: &str) -> (Arc<MemoryEngine>, DocumentStore) {
        let engine = Arc::new(MemoryEngine::new());
        let registry = Arc::new(TransportRegistry::new().with_engine(engine.clone()));
        let manager = DatabaseManager::builder()
            .url(format!("memory:{}", name))
            .registry(registry)
            .build()
            .unwrap();
        manager.setup().await.unwrap();
        (engine, DocumentStore::new(Arc::new(manager)))
    }

    #[test]
    fn test_statements_target_collection() {
        let manager = DatabaseManager::builder()
            .collection("settings")
            .build()
            .unwrap();
        let store = DocumentStore::new(Arc::new(manager));

        assert_eq!(store.collection(), "settings");
        assert_eq!(store.select_sql, "SELECT FROM settings WHERE key = ? LIMIT 1");
        assert_eq!(store.delete_all_sql, "DELETE FROM settings WHERE key IN ?");
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_, store) = store("store_round_trip").await;

        store.put("answer", json!(42)).await.unwrap();
        store.put("nested", json!({"a": [1, 2, {"b": null}]})).await.unwrap();

        assert_eq!(store.get("answer").await.unwrap(), Some(json!(42)));
        assert_eq!(
            store.get("nested").await.unwrap(),
            Some(json!({"a": [1, 2, {"b": null}]}))
        );
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_updates_in_place() {
        let (engine, store) = store("store_update").await;

        store.put("k", json!("first")).await.unwrap();
        store.put("k", json!(2.5)).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(json!(2.5)));
        let records = engine.database("store_update").unwrap().records("keyValue");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version(), 2);
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Limits {
            max: u32,
            label: String,
        }

        let (_, store) = store("store_typed").await;
        let limits = Limits {
            max: 5,
            label: "burst".to_string(),
        };

        store.put_typed("limits", &limits).await.unwrap();
        let loaded: Option<Limits> = store.get_typed("limits").await.unwrap();
        assert_eq!(loaded, Some(limits));
    }

    #[tokio::test]
    async fn test_remove_all_of_nothing_is_a_no_op() {
        let (engine, store) = store("store_remove_none").await;
        let db = engine.database("store_remove_none").unwrap();
        let released = db.stats().released;

        store.remove_all(&HashSet::new()).await.unwrap();
        assert_eq!(db.stats().released, released);
    }
}
