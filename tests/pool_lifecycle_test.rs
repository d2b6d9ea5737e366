//! Pool lifecycle and call-execution protocol of the database manager

mod common;

use docstore::backend::{Fault, FaultPoint};
use docstore::client::{Connection, DocumentConnection};
use docstore::query::Param;
use docstore::transport::{self, TransportRegistry};
use docstore::{DbError, KeyValueStore, KvError, LifecycleState};
use serde_json::json;
use std::sync::Arc;

const SELECT: &str = "SELECT FROM keyValue WHERE key = ? LIMIT 1";

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_operations_before_setup_fail() {
    let (_, manager) = common::manager("lifecycle_before");
    let store = docstore::DocumentStore::new(Arc::clone(&manager));

    let err = store.get("k").await.unwrap_err();
    assert!(err.is_connectivity());
    let err = store.put("k", json!(1)).await.unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(manager.lifecycle_state(), LifecycleState::Uninitialized);
}

#[tokio::test]
async fn test_shutdown_closes_every_session() {
    let t = common::store("lifecycle_shutdown").await;
    t.store.put("k", json!(1)).await.unwrap();
    assert_eq!(t.store.get("k").await.unwrap(), Some(json!(1)));

    t.manager.shutdown().await.unwrap();
    settle().await;

    assert_eq!(t.manager.lifecycle_state(), LifecycleState::TornDown);
    assert_eq!(t.database().stats().open, 0);

    let err = t.store.get("k").await.unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(t.database().stats().open, 0);
}

#[tokio::test]
async fn test_setup_is_not_repeatable() {
    let t = common::store("lifecycle_repeat").await;
    let opened = t.database().stats().opened;

    let err = t.manager.setup().await.unwrap_err();
    assert!(matches!(err, KvError::Lifecycle(_)));
    // No second set of pools was built
    assert_eq!(t.database().stats().opened, opened);
}

#[tokio::test]
async fn test_unreachable_store_is_a_connectivity_failure() {
    let t = common::store("lifecycle_unreachable").await;
    t.database().set_unreachable(true);

    let err = t.store.get("k").await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(!t.manager.health_check().await);

    t.database().set_unreachable(false);
    assert_eq!(t.store.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_injected_conflict_rolls_back_and_translates() {
    let t = common::store("conflict_injected").await;
    let before = t.database().stats();

    t.database()
        .inject_fault(FaultPoint::Save, Fault::ConcurrentModification);
    let err = t.store.put("k", json!(1)).await.unwrap_err();

    assert!(err.is_optimistic_locking_failure());
    let after = t.database().stats();
    assert_eq!(after.rollbacks, before.rollbacks + 1);
    assert_eq!(after.released, before.released + 1);
    assert_eq!(t.store.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_stale_write_loses_to_concurrent_update() {
    let t = common::store("conflict_stale").await;
    t.store.put("k", json!("original")).await.unwrap();

    let err = t
        .manager
        .execute_doc_call(async |session| {
            let mut stale = session
                .query(SELECT, &[Param::from("k")])
                .await?
                .remove(0);

            // Another caller updates the entry on its own session meanwhile
            t.store
                .put("k", json!("winner"))
                .await
                .map_err(|e| DbError::Backend(e.to_string()))?;

            stale.set_field("value", json!("loser"));
            session.save(&mut stale).await
        })
        .await
        .unwrap_err();

    assert!(err.is_optimistic_locking_failure());
    assert_eq!(t.store.get("k").await.unwrap(), Some(json!("winner")));
}

#[tokio::test]
async fn test_conflict_discards_pending_transaction() {
    let t = common::store("conflict_transaction").await;
    t.store.put("k", json!(1)).await.unwrap();

    let err = t
        .manager
        .execute_doc_call(async |session| {
            session.begin().await?;
            session
                .command("DELETE FROM keyValue WHERE key = ?", &[Param::from("k")])
                .await?;
            let mut current = session.query(SELECT, &[Param::from("k")]).await?.remove(0);
            let mut stale = current.clone();

            current.set_field("value", json!(2));
            session.save(&mut current).await?;
            stale.set_field("value", json!(3));
            session.save(&mut stale).await?;
            session.commit().await
        })
        .await
        .unwrap_err();

    assert!(err.is_optimistic_locking_failure());
    // The staged delete was rolled back with the rest of the transaction
    assert_eq!(t.store.get("k").await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn test_other_errors_are_not_translated() {
    let t = common::store("errors_generic").await;

    t.database().inject_fault(FaultPoint::Command, Fault::Backend);
    let err = t.store.remove("k").await.unwrap_err();
    assert!(matches!(err, KvError::Database(DbError::Backend(_))));
    assert!(!err.is_optimistic_locking_failure());
}

#[tokio::test]
async fn test_malformed_query_asymmetry() {
    let t = common::store("malformed").await;
    t.manager.register_object_type("keyValue", false).await.unwrap();

    t.database().inject_fault(FaultPoint::Query, Fault::QueryParsing);
    let absent = t
        .manager
        .execute_obj_call(async |session| session.query(SELECT, &[Param::from("k")]).await)
        .await
        .unwrap();
    assert!(absent.is_none());

    t.database().inject_fault(FaultPoint::Query, Fault::QueryParsing);
    let err = t.store.get("k").await.unwrap_err();
    assert!(matches!(err, KvError::Database(ref e) if e.is_query_parsing()));
}

#[tokio::test]
async fn test_session_released_exactly_once_per_call() {
    let t = common::store("release_accounting").await;
    let db = t.database();
    let mut expected = db.stats().released;

    t.store.put("k", json!(1)).await.unwrap();
    expected += 1;
    assert_eq!(db.stats().released, expected);

    db.inject_fault(FaultPoint::Save, Fault::ConcurrentModification);
    assert!(t.store.put("k", json!(2)).await.is_err());
    expected += 1;
    assert_eq!(db.stats().released, expected);

    db.inject_fault(FaultPoint::Query, Fault::Backend);
    assert!(t.store.get("k").await.is_err());
    expected += 1;
    assert_eq!(db.stats().released, expected);

    db.inject_fault(FaultPoint::Query, Fault::QueryParsing);
    let absent = t
        .manager
        .execute_obj_call(async |session| session.query(SELECT, &[Param::from("k")]).await)
        .await
        .unwrap();
    assert!(absent.is_none());
    expected += 1;
    assert_eq!(db.stats().released, expected);

    let stats = t.manager.pool_stats().unwrap();
    assert_eq!(stats.document.active_connections, 0);
    assert_eq!(stats.object.active_connections, 0);
}

#[tokio::test]
async fn test_acquisition_restores_callers_context() {
    let t = common::store("context_restore").await;
    let outer = Arc::new(TransportRegistry::new());

    let schemes = transport::with_acquisition_context(Arc::clone(&outer), async {
        t.store.put("k", json!(1)).await.unwrap();
        t.database().set_unreachable(true);
        assert!(t.store.get("k").await.is_err());
        t.database().set_unreachable(false);

        transport::current_context().map(|registry| registry.schemes())
    })
    .await;

    // Still the caller's (empty) registry after both a successful and a
    // failed acquisition
    assert_eq!(schemes, Some(Vec::new()));
    assert!(transport::current_context().is_none());
}

#[tokio::test]
async fn test_unit_of_work_runs_outside_acquisition_context() {
    let t = common::store("context_scope").await;

    let seen = t
        .manager
        .execute_doc_call(async |session: &mut dyn DocumentConnection| {
            session.ping().await?;
            Ok(transport::current_context().is_some())
        })
        .await
        .unwrap();
    assert!(!seen);
}
