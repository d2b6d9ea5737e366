//! Embedded in-process engine (`memory:` scheme)
//!
//! Databases live for as long as their engine. Records are versioned and
//! every update is checked against the version it was read at, so two
//! sessions racing on the same record produce a concurrent modification
//! error exactly as a remote store would. Document sessions can buffer
//! writes in an explicit transaction.
//!
//! The engine also exposes what tests need to observe the pool from the
//! outside: session accounting per database and one-shot fault injection.

use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::client::{
    settings, Connection, Credentials, DocumentConnection, Engine, ObjectConnection, StoreUrl,
};
use crate::document::{Document, RecordId};
use crate::error::DbError;
use crate::query::{Param, Predicate, Statement, StatementKind};

const SHARED_CACHE_CAPACITY: u64 = 10_000;

type CacheKey = (String, Vec<Param>);
type CachedResult = (u64, Arc<Vec<Document>>);

/// Engine holding any number of named in-memory databases
#[derive(Default)]
pub struct MemoryEngine {
    databases: RwLock<HashMap<String, Arc<MemoryDatabase>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on an existing database, for inspection
    pub fn database(&self, name: &str) -> Option<Arc<MemoryDatabase>> {
        self.databases.read().get(name).cloned()
    }

    fn lookup(&self, url: &StoreUrl) -> Result<Arc<MemoryDatabase>, DbError> {
        self.database(url.path())
            .ok_or_else(|| DbError::DatabaseNotFound(url.to_string()))
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn schemes(&self) -> &[&'static str] {
        &["memory"]
    }

    fn is_embedded(&self) -> bool {
        true
    }

    async fn exists(&self, url: &StoreUrl, _credentials: &Credentials) -> Result<bool, DbError> {
        Ok(self.databases.read().contains_key(url.path()))
    }

    async fn create(&self, url: &StoreUrl, credentials: &Credentials) -> Result<(), DbError> {
        let mut databases = self.databases.write();
        if databases.contains_key(url.path()) {
            return Err(DbError::DatabaseExists(url.to_string()));
        }
        debug!("Creating in-memory database {}", url.path());
        databases.insert(
            url.path().to_string(),
            Arc::new(MemoryDatabase::new(url.path(), credentials.clone())),
        );
        Ok(())
    }

    async fn open_document(
        &self,
        url: &StoreUrl,
        credentials: &Credentials,
    ) -> Result<Box<dyn DocumentConnection>, DbError> {
        let db = self.lookup(url)?;
        db.authenticate(credentials)?;
        Ok(Box::new(MemorySession::open(db, Flavor::Document)))
    }

    async fn open_object(
        &self,
        url: &StoreUrl,
        credentials: &Credentials,
    ) -> Result<Box<dyn ObjectConnection>, DbError> {
        let db = self.lookup(url)?;
        db.authenticate(credentials)?;
        Ok(Box::new(MemorySession::open(db, Flavor::Object)))
    }
}

/// Where an injected fault fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Query,
    Command,
    Save,
}

/// A one-shot failure to raise at the next matching operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    ConcurrentModification,
    QueryParsing,
    Backend,
}

impl Fault {
    fn into_error(self, context: &str) -> DbError {
        match self {
            Fault::ConcurrentModification => DbError::ConcurrentModification {
                class: context.to_string(),
                record: "injected".to_string(),
                expected: 0,
                actual: 1,
            },
            Fault::QueryParsing => DbError::query_parsing(context, "injected parse failure"),
            Fault::Backend => DbError::Backend(format!("injected failure in {}", context)),
        }
    }
}

/// Session accounting of one database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Sessions ever opened
    pub opened: u64,
    /// Sessions opened and not yet dropped
    pub open: u64,
    /// Times a session went back to its pool
    pub released: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    closed: AtomicU64,
    released: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

#[derive(Debug, Default)]
struct DatabaseState {
    classes: HashMap<String, BTreeMap<RecordId, Document>>,
    entity_classes: HashSet<String>,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Save {
        document: Document,
        expected: Option<u64>,
    },
    Delete {
        class: String,
        ids: Vec<RecordId>,
    },
}

pub struct MemoryDatabase {
    name: String,
    owner: Credentials,
    state: RwLock<DatabaseState>,
    generation: AtomicU64,
    shared_cache: Cache<CacheKey, CachedResult>,
    counters: Counters,
    faults: Mutex<Vec<(FaultPoint, Fault)>>,
    unreachable: AtomicBool,
}

impl MemoryDatabase {
    fn new(name: &str, owner: Credentials) -> Self {
        Self {
            name: name.to_string(),
            owner,
            state: RwLock::new(DatabaseState::default()),
            generation: AtomicU64::new(0),
            shared_cache: Cache::new(SHARED_CACHE_CAPACITY),
            counters: Counters::default(),
            faults: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> SessionStats {
        let opened = self.counters.opened.load(Ordering::Acquire);
        let closed = self.counters.closed.load(Ordering::Acquire);
        SessionStats {
            opened,
            open: opened.saturating_sub(closed),
            released: self.counters.released.load(Ordering::Acquire),
            commits: self.counters.commits.load(Ordering::Acquire),
            rollbacks: self.counters.rollbacks.load(Ordering::Acquire),
        }
    }

    /// Snapshot of the committed records of a class
    pub fn records(&self, class: &str) -> Vec<Document> {
        self.state
            .read()
            .classes
            .get(class)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.state.read().classes.contains_key(class)
    }

    /// Fail the next operation at `point` with `fault`
    pub fn inject_fault(&self, point: FaultPoint, fault: Fault) {
        self.faults.lock().push((point, fault));
    }

    /// Make new sessions and health checks fail as if the store were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    fn take_fault(&self, point: FaultPoint) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let idx = faults.iter().position(|(p, _)| *p == point)?;
        Some(faults.remove(idx).1)
    }

    fn check_reachable(&self) -> Result<(), DbError> {
        if self.unreachable.load(Ordering::Acquire) {
            return Err(DbError::Unreachable(format!("memory:{}", self.name)));
        }
        Ok(())
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<(), DbError> {
        self.check_reachable()?;
        if *credentials != self.owner {
            return Err(DbError::Authentication(credentials.username().to_string()));
        }
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn create_class(&self, class: &str) -> Result<(), DbError> {
        let mut state = self.state.write();
        if state.classes.contains_key(class) {
            return Err(DbError::Backend(format!("class {} already exists", class)));
        }
        state.classes.insert(class.to_string(), BTreeMap::new());
        Ok(())
    }

    fn register_entity_class(&self, class: &str) {
        self.state.write().entity_classes.insert(class.to_string());
    }

    fn is_entity_class(&self, class: &str) -> bool {
        self.state.read().entity_classes.contains(class)
    }

    fn select(
        &self,
        statement: &Statement,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<Document>, DbError> {
        let state = self.state.read();
        let records = state
            .classes
            .get(&statement.class)
            .ok_or_else(|| DbError::ClassNotFound(statement.class.clone()))?;

        let matching = records
            .values()
            .filter(|doc| predicate.is_none_or(|p| p.matches(doc)))
            .cloned();
        Ok(match statement.limit() {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    fn matching_ids(
        &self,
        statement: &Statement,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<RecordId>, DbError> {
        let state = self.state.read();
        let records = state
            .classes
            .get(&statement.class)
            .ok_or_else(|| DbError::ClassNotFound(statement.class.clone()))?;
        Ok(records
            .iter()
            .filter(|(_, doc)| predicate.is_none_or(|p| p.matches(doc)))
            .map(|(rid, _)| rid.clone())
            .collect())
    }

    /// Stamp a document with its next identity and return the version the
    /// stored record must still have for the write to apply.
    fn stage(&self, document: &mut Document) -> Result<Option<u64>, DbError> {
        let state = self.state.read();
        let records = state
            .classes
            .get(document.class())
            .ok_or_else(|| DbError::ClassNotFound(document.class().to_string()))?;

        match document.rid().cloned() {
            None => {
                let rid = RecordId::new(Uuid::new_v4().simple().to_string());
                document.assign(rid, 1);
                Ok(None)
            }
            Some(rid) => {
                let actual = records.get(&rid).map(Document::version).unwrap_or(0);
                if actual != document.version() {
                    return Err(DbError::ConcurrentModification {
                        class: document.class().to_string(),
                        record: rid.to_string(),
                        expected: document.version(),
                        actual,
                    });
                }
                document.assign(rid, actual + 1);
                Ok(Some(actual))
            }
        }
    }

    /// Apply writes atomically, re-checking every expected version first
    fn apply(&self, writes: Vec<PendingWrite>) -> Result<u64, DbError> {
        if writes.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.write();

        for write in &writes {
            if let PendingWrite::Save {
                document,
                expected: Some(expected),
            } = write
            {
                let actual = document
                    .rid()
                    .and_then(|rid| state.classes.get(document.class())?.get(rid))
                    .map(Document::version)
                    .unwrap_or(0);
                if actual != *expected {
                    return Err(DbError::ConcurrentModification {
                        class: document.class().to_string(),
                        record: document.rid().map(ToString::to_string).unwrap_or_default(),
                        expected: *expected,
                        actual,
                    });
                }
            }
        }

        let mut affected = 0;
        for write in writes {
            match write {
                PendingWrite::Save { document, .. } => {
                    let records = state
                        .classes
                        .get_mut(document.class())
                        .ok_or_else(|| DbError::ClassNotFound(document.class().to_string()))?;
                    if let Some(rid) = document.rid().cloned() {
                        records.insert(rid, document);
                        affected += 1;
                    }
                }
                PendingWrite::Delete { class, ids } => {
                    if let Some(records) = state.classes.get_mut(&class) {
                        for rid in ids {
                            if records.remove(&rid).is_some() {
                                affected += 1;
                            }
                        }
                    }
                }
            }
        }
        drop(state);

        self.bump_generation();
        Ok(affected)
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Document,
    Object,
}

/// A session on a [`MemoryDatabase`], usable in either mode
struct MemorySession {
    db: Arc<MemoryDatabase>,
    flavor: Flavor,
    pending: Option<Vec<PendingWrite>>,
    cache: HashMap<CacheKey, CachedResult>,
}

impl MemorySession {
    fn open(db: Arc<MemoryDatabase>, flavor: Flavor) -> Self {
        db.counters.opened.fetch_add(1, Ordering::AcqRel);
        trace!("Opened {:?} session on memory:{}", flavor, db.name);
        Self {
            db,
            flavor,
            pending: None,
            cache: HashMap::new(),
        }
    }

    fn check_entity(&self, class: &str) -> Result<(), DbError> {
        if self.flavor == Flavor::Object && !self.db.is_entity_class(class) {
            return Err(DbError::Backend(format!(
                "entity class {} is not registered",
                class
            )));
        }
        Ok(())
    }

    /// Cached result for `key` if no write committed since it was computed
    async fn cached(&self, key: &CacheKey, generation: u64) -> Option<Vec<Document>> {
        let config = settings();
        if config.session_cache_enabled() {
            if let Some((seen, docs)) = self.cache.get(key) {
                if *seen == generation {
                    return Some(docs.as_ref().clone());
                }
            }
        }
        if config.shared_cache_enabled() {
            if let Some((seen, docs)) = self.db.shared_cache.get(key).await {
                if seen == generation {
                    return Some(docs.as_ref().clone());
                }
            }
        }
        None
    }

    async fn remember(&mut self, key: CacheKey, generation: u64, docs: &[Document]) {
        let config = settings();
        if !config.session_cache_enabled() && !config.shared_cache_enabled() {
            return;
        }
        let entry = (generation, Arc::new(docs.to_vec()));
        if config.session_cache_enabled() {
            self.cache.insert(key.clone(), entry.clone());
        }
        if config.shared_cache_enabled() {
            self.db.shared_cache.insert(key, entry).await;
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.db.counters.closed.fetch_add(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl Connection for MemorySession {
    async fn ping(&mut self) -> Result<(), DbError> {
        self.db.check_reachable()
    }

    async fn class_exists(&mut self, class: &str) -> Result<bool, DbError> {
        Ok(self.db.has_class(class))
    }

    async fn create_class(&mut self, class: &str) -> Result<(), DbError> {
        self.db.create_class(class)
    }

    async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Document>, DbError> {
        if let Some(fault) = self.db.take_fault(FaultPoint::Query) {
            return Err(fault.into_error(sql));
        }
        let statement = Statement::parse(sql)?;
        if statement.kind == StatementKind::Delete {
            return Err(DbError::query_parsing(sql, "query expects a SELECT statement"));
        }
        let predicate = statement.bind(sql, params)?;
        self.check_entity(&statement.class)?;

        let key = (sql.to_string(), params.to_vec());
        let generation = self.db.generation();
        if let Some(docs) = self.cached(&key, generation).await {
            return Ok(docs);
        }

        let docs = self.db.select(&statement, predicate.as_ref())?;
        self.remember(key, generation, &docs).await;
        Ok(docs)
    }

    async fn command(&mut self, sql: &str, params: &[Param]) -> Result<u64, DbError> {
        if let Some(fault) = self.db.take_fault(FaultPoint::Command) {
            return Err(fault.into_error(sql));
        }
        let statement = Statement::parse(sql)?;
        if statement.kind != StatementKind::Delete {
            return Err(DbError::query_parsing(sql, "command expects a DELETE statement"));
        }
        let predicate = statement.bind(sql, params)?;
        self.check_entity(&statement.class)?;

        let ids = self.db.matching_ids(&statement, predicate.as_ref())?;
        let write = PendingWrite::Delete {
            class: statement.class,
            ids,
        };
        match self.pending.as_mut() {
            Some(pending) => {
                let count = match &write {
                    PendingWrite::Delete { ids, .. } => ids.len() as u64,
                    PendingWrite::Save { .. } => 0,
                };
                pending.push(write);
                Ok(count)
            }
            None => self.db.apply(vec![write]),
        }
    }

    async fn save(&mut self, document: &mut Document) -> Result<(), DbError> {
        if let Some(fault) = self.db.take_fault(FaultPoint::Save) {
            return Err(fault.into_error(document.class()));
        }
        self.check_entity(document.class())?;

        // A record already saved in this transaction is checked against its
        // staged copy rather than the committed one.
        if let (Some(pending), Some(rid)) = (self.pending.as_mut(), document.rid().cloned()) {
            let staged = pending.iter_mut().find_map(|write| match write {
                PendingWrite::Save { document: staged, .. } if staged.rid() == Some(&rid) => {
                    Some(staged)
                }
                _ => None,
            });
            if let Some(staged) = staged {
                if staged.version() != document.version() {
                    return Err(DbError::ConcurrentModification {
                        class: document.class().to_string(),
                        record: rid.to_string(),
                        expected: document.version(),
                        actual: staged.version(),
                    });
                }
                document.assign(rid, staged.version() + 1);
                *staged = document.clone();
                return Ok(());
            }
        }

        let expected = self.db.stage(document)?;
        let write = PendingWrite::Save {
            document: document.clone(),
            expected,
        };
        match self.pending.as_mut() {
            Some(pending) => pending.push(write),
            None => {
                self.db.apply(vec![write])?;
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(pending) = self.pending.take() {
            trace!("Discarding {} uncommitted writes on release", pending.len());
        }
        self.cache.clear();
        self.db.counters.released.fetch_add(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl DocumentConnection for MemorySession {
    async fn begin(&mut self) -> Result<(), DbError> {
        if self.pending.is_some() {
            return Err(DbError::Backend("transaction already active".to_string()));
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let writes = self
            .pending
            .take()
            .ok_or_else(|| DbError::Backend("no active transaction".to_string()))?;
        match self.db.apply(writes.clone()) {
            Ok(_) => {
                self.db.counters.commits.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(err) => {
                // Keep the writes staged so the caller can roll back
                self.pending = Some(writes);
                Err(err)
            }
        }
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        if let Some(pending) = self.pending.take() {
            debug!("Rolling back {} pending writes", pending.len());
        }
        self.db.counters.rollbacks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }
}

#[async_trait]
impl ObjectConnection for MemorySession {
    async fn register_entity_class(&mut self, class: &str) -> Result<(), DbError> {
        self.db.register_entity_class(class);
        Ok(())
    }

    fn is_registered(&self, class: &str) -> bool {
        self.db.is_entity_class(class)
    }
}
