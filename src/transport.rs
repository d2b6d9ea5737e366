//! Engine transports and the acquisition lookup context
//!
//! Engines are looked up by URL scheme in a [`TransportRegistry`]. While a
//! session is being acquired from a pool, the registry that should serve
//! the lookup is installed as a task-local context with
//! [`with_acquisition_context`]; the previous context is restored as soon as
//! the acquisition future completes, whatever its outcome.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::backend::MemoryEngine;
use crate::client::{Engine, StoreUrl};
use crate::error::DbError;

tokio::task_local! {
    static ACQUISITION_CONTEXT: Arc<TransportRegistry>;
}

static GLOBAL: LazyLock<Arc<TransportRegistry>> =
    LazyLock::new(|| Arc::new(TransportRegistry::with_defaults()));

/// Process-wide registry, pre-populated with the embedded memory engine
pub fn global() -> Arc<TransportRegistry> {
    Arc::clone(&GLOBAL)
}

/// Run `acquire` with `registry` installed as the lookup context
pub async fn with_acquisition_context<F>(registry: Arc<TransportRegistry>, acquire: F) -> F::Output
where
    F: Future,
{
    ACQUISITION_CONTEXT.scope(registry, acquire).await
}

/// Registry installed by the innermost enclosing acquisition, if any
pub fn current_context() -> Option<Arc<TransportRegistry>> {
    ACQUISITION_CONTEXT.try_with(Arc::clone).ok()
}

/// Maps URL schemes to engines
#[derive(Default)]
pub struct TransportRegistry {
    engines: RwLock<HashMap<String, Arc<dyn Engine>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        Self::new().with_engine(Arc::new(MemoryEngine::new()))
    }

    pub fn with_engine(self, engine: Arc<dyn Engine>) -> Self {
        self.register(engine);
        self
    }

    /// Register an engine for each of its schemes. Schemes that already
    /// have an engine keep it, so registering twice is harmless. Returns
    /// whether any scheme was newly bound.
    pub fn register(&self, engine: Arc<dyn Engine>) -> bool {
        let mut engines = self.engines.write();
        let mut added = false;
        for scheme in engine.schemes() {
            if !engines.contains_key(*scheme) {
                debug!("Registering {} engine for scheme {}", engine.name(), scheme);
                engines.insert(scheme.to_string(), Arc::clone(&engine));
                added = true;
            }
        }
        added
    }

    pub fn resolve(&self, url: &StoreUrl) -> Result<Arc<dyn Engine>, DbError> {
        self.engines
            .read()
            .get(url.scheme())
            .cloned()
            .ok_or_else(|| DbError::UnsupportedScheme(url.scheme().to_string()))
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.engines.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Neo4jEngine;

    #[test]
    fn test_defaults_serve_memory_scheme() {
        let registry = TransportRegistry::with_defaults();
        let url = StoreUrl::parse("memory:test").unwrap();
        assert_eq!(registry.resolve(&url).unwrap().name(), "memory");
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = TransportRegistry::new();
        assert!(registry.register(Arc::new(Neo4jEngine::new())));
        assert!(!registry.register(Arc::new(Neo4jEngine::new())));
        assert_eq!(registry.schemes(), vec!["bolt".to_string(), "neo4j".to_string()]);
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = TransportRegistry::new();
        let url = StoreUrl::parse("remote://host/db").unwrap();
        assert!(matches!(
            registry.resolve(&url),
            Err(DbError::UnsupportedScheme(s)) if s == "remote"
        ));
    }

    #[tokio::test]
    async fn test_context_is_scoped_to_acquisition() {
        assert!(current_context().is_none());

        let registry = Arc::new(TransportRegistry::new());
        let seen = with_acquisition_context(Arc::clone(&registry), async {
            current_context().is_some()
        })
        .await;

        assert!(seen);
        assert!(current_context().is_none());
    }

    #[tokio::test]
    async fn test_context_restored_after_failure() {
        let outer = Arc::new(TransportRegistry::with_defaults());
        let inner = Arc::new(TransportRegistry::new());

        let result: Result<(), DbError> = with_acquisition_context(Arc::clone(&outer), async {
            let failed: Result<(), DbError> = with_acquisition_context(inner, async {
                Err(DbError::Unreachable("down".to_string()))
            })
            .await;
            assert!(failed.is_err());

            // Back to the outer registry once the inner acquisition failed
            let restored = current_context().map(|r| r.schemes());
            assert_eq!(restored, Some(vec!["memory".to_string()]));
            Ok(())
        })
        .await;

        assert!(result.is_ok());
        assert!(current_context().is_none());
    }
}
