//! Database manager: pool lifecycle and the call-execution protocol
//!
//! A [`DatabaseManager`] owns one object-mode and one document-mode pool
//! for a store. It moves through `Uninitialized -> SetUp -> TornDown`
//! exactly once; `setup()` and `shutdown()` are serialized with each other
//! but not with calls in flight.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::Neo4jEngine;
use crate::client::{self, Connection, Credentials, DocumentConnection, ObjectConnection, StoreUrl};
use crate::config::{Config, PoolConfig};
use crate::db::connection_manager::{
    DocumentMode, DocumentSessionManager, ObjectMode, ObjectSessionManager,
};
use crate::db::pool::{ConnectionPool, PoolError, PoolStats};
use crate::error::{DbError, KvError, Result};
use crate::query::is_identifier;
use crate::transport::{self, TransportRegistry};

pub const DEFAULT_COLLECTION: &str = "keyValue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    SetUp,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::SetUp => "set up",
            LifecycleState::TornDown => "torn down",
        })
    }
}

#[derive(Clone)]
struct Pools {
    object: ConnectionPool<ObjectMode>,
    document: ConnectionPool<DocumentMode>,
}

enum PoolState {
    Uninitialized,
    SetUp(Pools),
    TornDown,
}

impl PoolState {
    fn lifecycle(&self) -> LifecycleState {
        match self {
            PoolState::Uninitialized => LifecycleState::Uninitialized,
            PoolState::SetUp(_) => LifecycleState::SetUp,
            PoolState::TornDown => LifecycleState::TornDown,
        }
    }
}

/// Statistics of both pools of a set-up manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    pub object: PoolStats,
    pub document: PoolStats,
}

/// Check-then-create of a schema class. Returns whether it was created.
async fn ensure_class<C>(session: &mut C, class: &str) -> std::result::Result<bool, DbError>
where
    C: Connection + ?Sized,
{
    if session.class_exists(class).await? {
        return Ok(false);
    }
    session.create_class(class).await?;
    Ok(true)
}

fn startup_failure(err: DbError) -> KvError {
    KvError::connectivity(PoolError::PoolCreation(err))
}

pub struct DatabaseManager {
    url: StoreUrl,
    credentials: Credentials,
    pool_config: PoolConfig,
    collection: String,
    object_classes: Vec<String>,
    registry: Arc<TransportRegistry>,
    state: RwLock<PoolState>,
    lifecycle: Mutex<()>,
}

impl DatabaseManager {
    pub fn builder() -> DatabaseManagerBuilder {
        DatabaseManagerBuilder::default()
    }

    /// Manager for the store described by a loaded configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::builder()
            .url(&config.store.url)
            .username(&config.store.username)
            .password(&config.store.password)
            .collection(&config.store.collection)
            .object_classes(config.store.object_classes.iter().cloned())
            .pool_config(config.pool.clone())
            .build()
    }

    pub fn url(&self) -> &StoreUrl {
        &self.url
    }

    /// Schema class holding the key-value entries
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool_config
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    /// Whether the URL resolves to an in-process engine whose data ends with
    /// the process
    pub fn is_embedded(&self) -> bool {
        self.registry
            .resolve(&self.url)
            .map(|engine| engine.is_embedded())
            .unwrap_or(false)
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.state.read().lifecycle()
    }

    fn pools(&self) -> std::result::Result<Pools, PoolError> {
        match &*self.state.read() {
            PoolState::SetUp(pools) => Ok(pools.clone()),
            other => Err(PoolError::PoolUnavailable(other.lifecycle())),
        }
    }

    /// Create the pools and bootstrap the store
    ///
    /// Turns client caching off, makes the remote engine available, creates
    /// an embedded database if it does not exist yet, builds both pools,
    /// registers the configured object classes and makes sure the entry
    /// collection exists. Any failure leaves the manager uninitialized.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn setup(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        match self.lifecycle_state() {
            LifecycleState::Uninitialized => {}
            LifecycleState::SetUp => return Err(PoolError::AlreadySetUp.into()),
            state => return Err(KvError::Lifecycle(PoolError::PoolUnavailable(state))),
        }
        self.pool_config.validate()?;

        info!(
            "Setting up database pools for {} (min_size: {}, max_size: {})",
            self.url, self.pool_config.min_size, self.pool_config.max_size
        );

        client::settings().disable_caches();
        if self.registry.register(Arc::new(Neo4jEngine::new())) {
            debug!("Registered remote engine transport");
        }

        let engine = self.registry.resolve(&self.url).map_err(startup_failure)?;
        if engine.is_embedded() {
            let exists = engine
                .exists(&self.url, &self.credentials)
                .await
                .map_err(startup_failure)?;
            if !exists {
                info!("Creating embedded database {}", self.url);
                engine
                    .create(&self.url, &self.credentials)
                    .await
                    .map_err(startup_failure)?;
            }
        }

        let object = ConnectionPool::new(
            ObjectSessionManager::new(
                self.url.clone(),
                self.credentials.clone(),
                Arc::clone(&self.registry),
            ),
            &self.pool_config,
        )
        .await?;
        let document = ConnectionPool::new(
            DocumentSessionManager::new(
                self.url.clone(),
                self.credentials.clone(),
                Arc::clone(&self.registry),
            ),
            &self.pool_config,
        )
        .await?;
        *self.state.write() = PoolState::SetUp(Pools { object, document });

        if let Err(err) = self.bootstrap().await {
            error!("Store bootstrap failed: {}", err);
            *self.state.write() = PoolState::Uninitialized;
            return Err(err);
        }

        info!("Database pools are set up");
        Ok(())
    }

    async fn bootstrap(&self) -> Result<()> {
        for class in &self.object_classes {
            self.register_object_type(class, true).await?;
        }
        self.create_db_document_type(&self.collection).await
    }

    /// Close both pools. Calls still holding a session finish normally and
    /// their sessions close as they come back.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let previous = {
            let mut state = self.state.write();
            if !matches!(*state, PoolState::SetUp(_)) {
                return Err(KvError::Lifecycle(PoolError::PoolUnavailable(
                    state.lifecycle(),
                )));
            }
            std::mem::replace(&mut *state, PoolState::TornDown)
        };

        if let PoolState::SetUp(pools) = previous {
            pools.object.close();
            pools.document.close();
        }
        info!("Database pools are shut down");
        Ok(())
    }

    /// Run a unit of work on a document-mode session
    ///
    /// A concurrent modification rolls back the session's pending
    /// transaction and surfaces as [`KvError::OptimisticLockingFailure`].
    /// Every other store error surfaces as [`KvError::Database`].
    pub async fn execute_doc_call<T, F>(&self, work: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut dyn DocumentConnection) -> std::result::Result<T, DbError>,
    {
        let pool = self.pools().map_err(KvError::connectivity)?.document;
        let mut lease = pool.acquire().await.map_err(KvError::connectivity)?;

        match work(&mut *lease).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_concurrent_modification() => {
                debug!("Concurrent modification on document session: {}", err);
                if let Err(rollback_err) = lease.rollback().await {
                    warn!("Rollback after concurrent modification failed: {}", rollback_err);
                }
                Err(KvError::optimistic_locking(err))
            }
            Err(err) => Err(KvError::Database(err)),
        }
    }

    /// Run a unit of work on an object-mode session
    ///
    /// A malformed query is logged and yields `Ok(None)`. A concurrent
    /// modification surfaces as [`KvError::OptimisticLockingFailure`]
    /// without any rollback.
    pub async fn execute_obj_call<T, F>(&self, work: F) -> Result<Option<T>>
    where
        F: AsyncFnOnce(&mut dyn ObjectConnection) -> std::result::Result<T, DbError>,
    {
        let pool = self.pools().map_err(KvError::connectivity)?.object;
        let mut lease = pool.acquire().await.map_err(KvError::connectivity)?;

        match work(&mut *lease).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_concurrent_modification() => Err(KvError::optimistic_locking(err)),
            Err(err) if err.is_query_parsing() => {
                warn!("Ignoring malformed query on object session: {}", err);
                Ok(None)
            }
            Err(err) => Err(KvError::Database(err)),
        }
    }

    /// Make an entity class usable by object-mode sessions, creating its
    /// schema class first when `create_class` is set
    #[instrument(skip(self))]
    pub async fn register_object_type(&self, class: &str, create_class: bool) -> Result<()> {
        if !is_identifier(class) {
            return Err(KvError::Configuration(format!(
                "`{}` is not a valid class name",
                class
            )));
        }

        let created = self
            .execute_obj_call(async |session| {
                session.register_entity_class(class).await?;
                if create_class {
                    ensure_class(session, class).await
                } else {
                    Ok(false)
                }
            })
            .await?;

        match created {
            Some(true) => info!("Created object class {}", class),
            Some(false) if create_class => info!("Verified that object class {} exists", class),
            _ => debug!("Registered object class {}", class),
        }
        Ok(())
    }

    /// Make sure the document schema class `class` exists
    #[instrument(skip(self))]
    pub async fn create_db_document_type(&self, class: &str) -> Result<()> {
        if !is_identifier(class) {
            return Err(KvError::Configuration(format!(
                "`{}` is not a valid class name",
                class
            )));
        }

        let created = self
            .execute_doc_call(async |session| ensure_class(session, class).await)
            .await?;

        if created {
            info!("Created DB Document Class {}", class);
        } else {
            info!("Verified that DB Document Class {} exists", class);
        }
        Ok(())
    }

    pub fn pool_stats(&self) -> Option<ManagerStats> {
        self.pools().ok().map(|pools| ManagerStats {
            object: pools.object.stats(),
            document: pools.document.stats(),
        })
    }

    /// Lease a document session and ping the store
    pub async fn health_check(&self) -> bool {
        match self.pools() {
            Ok(pools) => pools.document.health_check().await,
            Err(e) => {
                warn!("Health check on unavailable manager: {}", e);
                false
            }
        }
    }
}

impl fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("url", &self.url)
            .field("credentials", &self.credentials)
            .field("collection", &self.collection)
            .field("state", &self.lifecycle_state())
            .finish()
    }
}

/// Builder for [`DatabaseManager`]; pool sizing must be set here, before
/// `setup()`
pub struct DatabaseManagerBuilder {
    url: String,
    username: String,
    password: String,
    pool: PoolConfig,
    collection: String,
    object_classes: Vec<String>,
    registry: Option<Arc<TransportRegistry>>,
}

impl Default for DatabaseManagerBuilder {
    fn default() -> Self {
        let store = crate::config::StoreConfig::default();
        Self {
            url: store.url,
            username: store.username,
            password: store.password,
            pool: PoolConfig::default(),
            collection: store.collection,
            object_classes: Vec::new(),
            registry: None,
        }
    }
}

impl DatabaseManagerBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn pool_min_size(mut self, size: u32) -> Self {
        self.pool.min_size = size;
        self
    }

    pub fn pool_max_size(mut self, size: u32) -> Self {
        self.pool.max_size = size;
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn object_class(mut self, class: impl Into<String>) -> Self {
        self.object_classes.push(class.into());
        self
    }

    pub fn object_classes(mut self, classes: impl IntoIterator<Item = String>) -> Self {
        self.object_classes.extend(classes);
        self
    }

    /// Engine registry to use instead of the process-wide one
    pub fn registry(mut self, registry: Arc<TransportRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<DatabaseManager> {
        let url = StoreUrl::parse(&self.url).map_err(|e| KvError::Configuration(e.to_string()))?;
        self.pool.validate()?;

        Ok(DatabaseManager {
            url,
            credentials: Credentials::new(self.username, self.password),
            pool_config: self.pool,
            collection: self.collection,
            object_classes: self.object_classes,
            registry: self.registry.unwrap_or_else(transport::global),
            state: RwLock::new(PoolState::Uninitialized),
            lifecycle: Mutex::new(()),
        })
    }
}
