//! Session manager for bb8 pools
//!
//! Implements the bb8::ManageConnection trait once for both session modes.
//! A [`SessionMode`] says which kind of session an engine should open; the
//! engine itself is looked up by URL scheme when a connection is made.

use async_trait::async_trait;
use bb8::ManageConnection;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::client::{
    BoxFuture, Connection, Credentials, DocumentConnection, Engine, ObjectConnection, StoreUrl,
};
use crate::error::DbError;
use crate::transport::{self, TransportRegistry};

/// The flavour of session a pool hands out
pub trait SessionMode: Send + Sync + 'static {
    type Session: ?Sized + Connection + 'static;

    const NAME: &'static str;

    fn open<'a>(
        engine: &'a dyn Engine,
        url: &'a StoreUrl,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Box<Self::Session>, DbError>>;
}

/// Transactional sessions working on raw documents
#[derive(Debug, Clone, Copy)]
pub struct DocumentMode;

/// Sessions working on registered entity classes
#[derive(Debug, Clone, Copy)]
pub struct ObjectMode;

impl SessionMode for DocumentMode {
    type Session = dyn DocumentConnection;

    const NAME: &'static str = "document";

    fn open<'a>(
        engine: &'a dyn Engine,
        url: &'a StoreUrl,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Box<Self::Session>, DbError>> {
        engine.open_document(url, credentials)
    }
}

impl SessionMode for ObjectMode {
    type Session = dyn ObjectConnection;

    const NAME: &'static str = "object";

    fn open<'a>(
        engine: &'a dyn Engine,
        url: &'a StoreUrl,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Box<Self::Session>, DbError>> {
        engine.open_object(url, credentials)
    }
}

/// Opens, validates and discards sessions of mode `M` for one store
pub struct SessionManager<M> {
    url: StoreUrl,
    credentials: Credentials,
    registry: Arc<TransportRegistry>,
    _mode: PhantomData<fn() -> M>,
}

pub type DocumentSessionManager = SessionManager<DocumentMode>;
pub type ObjectSessionManager = SessionManager<ObjectMode>;

impl<M: SessionMode> SessionManager<M> {
    /// `registry` serves lookups made outside any acquisition context,
    /// such as background replenishment of idle sessions.
    pub fn new(url: StoreUrl, credentials: Credentials, registry: Arc<TransportRegistry>) -> Self {
        debug!("Creating {} session manager for {}", M::NAME, url);
        Self {
            url,
            credentials,
            registry,
            _mode: PhantomData,
        }
    }

    pub fn url(&self) -> &StoreUrl {
        &self.url
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    fn engine(&self) -> Result<Arc<dyn Engine>, DbError> {
        let registry = transport::current_context().unwrap_or_else(|| Arc::clone(&self.registry));
        registry.resolve(&self.url)
    }
}

#[async_trait]
impl<M: SessionMode> ManageConnection for SessionManager<M> {
    type Connection = Box<M::Session>;
    type Error = DbError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        debug!("Opening new {} session", M::NAME);
        let engine = self.engine()?;

        let session = M::open(engine.as_ref(), &self.url, &self.credentials)
            .await
            .map_err(|e| {
                error!("Failed to open {} session on {}: {}", M::NAME, self.url, e);
                e
            })?;

        debug!("Opened {} session on {} via {}", M::NAME, self.url, engine.name());
        Ok(session)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.ping().await.map_err(|e| {
            warn!("{} session failed validation: {}", M::NAME, e);
            e
        })
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_broken()
    }
}

impl<M> fmt::Debug for SessionManager<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("url", &self.url)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl<M: SessionMode> fmt::Display for SessionManager<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionManager(mode={}, url={})", M::NAME, self.url)
    }
}
