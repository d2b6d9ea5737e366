//! Contract with the backing store client
//!
//! The pool and the store only ever talk to a database through these
//! traits. An [`Engine`] opens sessions for a URL scheme; sessions come in
//! two flavours sharing the [`Connection`] operations: document-mode
//! sessions add explicit transactions, object-mode sessions add entity
//! class registration.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::document::Document;
use crate::error::DbError;
use crate::query::Param;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Connection string of a store: `<scheme>:<location>`
///
/// `memory:orders` names an embedded database, `bolt://db.internal:7687/neo4j`
/// a remote one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreUrl {
    raw: String,
    scheme: String,
    location: String,
}

impl StoreUrl {
    pub fn parse(url: &str) -> Result<Self, DbError> {
        let url = url.trim();
        let (scheme, location) = url
            .split_once(':')
            .ok_or_else(|| DbError::InvalidUrl(format!("missing scheme in `{}`", url)))?;

        let valid_scheme = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-');
        if !valid_scheme {
            return Err(DbError::InvalidUrl(format!("bad scheme in `{}`", url)));
        }
        if location.trim_start_matches('/').is_empty() {
            return Err(DbError::InvalidUrl(format!("missing location in `{}`", url)));
        }

        Ok(Self {
            raw: url.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            location: location.to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Everything after the scheme separator
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Location without the leading `//` authority marker
    pub fn path(&self) -> &str {
        self.location.trim_start_matches("//")
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for StoreUrl {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A database engine reachable through one or more URL schemes
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn schemes(&self) -> &[&'static str];

    /// Embedded engines run in-process and may need their database created
    /// before sessions can be opened.
    fn is_embedded(&self) -> bool;

    async fn exists(&self, url: &StoreUrl, credentials: &Credentials) -> Result<bool, DbError>;

    async fn create(&self, url: &StoreUrl, credentials: &Credentials) -> Result<(), DbError>;

    async fn open_document(
        &self,
        url: &StoreUrl,
        credentials: &Credentials,
    ) -> Result<Box<dyn DocumentConnection>, DbError>;

    async fn open_object(
        &self,
        url: &StoreUrl,
        credentials: &Credentials,
    ) -> Result<Box<dyn ObjectConnection>, DbError>;
}

/// Operations shared by both session modes
#[async_trait]
pub trait Connection: Send {
    async fn ping(&mut self) -> Result<(), DbError>;

    async fn class_exists(&mut self, class: &str) -> Result<bool, DbError>;

    async fn create_class(&mut self, class: &str) -> Result<(), DbError>;

    /// Run a `SELECT` statement with positional parameters
    async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Document>, DbError>;

    /// Run a mutating statement, returning the number of affected records
    async fn command(&mut self, sql: &str, params: &[Param]) -> Result<u64, DbError>;

    /// Insert a new document or update an existing one. Updates are checked
    /// against the version the document was read at.
    async fn save(&mut self, document: &mut Document) -> Result<(), DbError>;

    /// Reset per-lease state. Called exactly once each time the session
    /// goes back to its pool.
    fn release(&mut self);

    fn is_broken(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait DocumentConnection: Connection {
    async fn begin(&mut self) -> Result<(), DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    /// Discard pending writes; a no-op without an open transaction
    async fn rollback(&mut self) -> Result<(), DbError>;

    fn in_transaction(&self) -> bool;
}

#[async_trait]
pub trait ObjectConnection: Connection {
    async fn register_entity_class(&mut self, class: &str) -> Result<(), DbError>;

    fn is_registered(&self, class: &str) -> bool;
}

/// Process-wide client switches
#[derive(Debug)]
pub struct ClientSettings {
    session_cache: AtomicBool,
    shared_cache: AtomicBool,
}

static SETTINGS: ClientSettings = ClientSettings {
    session_cache: AtomicBool::new(true),
    shared_cache: AtomicBool::new(true),
};

pub fn settings() -> &'static ClientSettings {
    &SETTINGS
}

impl ClientSettings {
    /// Per-session result cache
    pub fn session_cache_enabled(&self) -> bool {
        self.session_cache.load(Ordering::Acquire)
    }

    /// Result cache shared by all sessions of a database
    pub fn shared_cache_enabled(&self) -> bool {
        self.shared_cache.load(Ordering::Acquire)
    }

    pub fn set_session_cache(&self, enabled: bool) {
        self.session_cache.store(enabled, Ordering::Release);
    }

    pub fn set_shared_cache(&self, enabled: bool) {
        self.shared_cache.store(enabled, Ordering::Release);
    }

    pub fn disable_caches(&self) {
        self.set_session_cache(false);
        self.set_shared_cache(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_embedded_url() {
        let url = StoreUrl::parse("memory:orders").unwrap();
        assert_eq!(url.scheme(), "memory");
        assert_eq!(url.location(), "orders");
        assert_eq!(url.path(), "orders");
    }

    #[test]
    fn test_parse_remote_url() {
        let url: StoreUrl = "BOLT://db.internal:7687/neo4j".parse().unwrap();
        assert_eq!(url.scheme(), "bolt");
        assert_eq!(url.path(), "db.internal:7687/neo4j");
        assert_eq!(url.to_string(), "BOLT://db.internal:7687/neo4j");
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        for raw in ["no-scheme", ":orders", "memory:", "bolt://", "me mory:x"] {
            assert!(StoreUrl::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("admin", "s3cret");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("s3cret"));
    }
}
