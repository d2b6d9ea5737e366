//! Connection pool wrapper for store sessions
//!
//! Provides a small interface over bb8 pools with pool statistics, health
//! checks and a lease type that resets its session exactly once when it
//! goes back to the pool.

use bb8::{Pool, PooledConnection};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::client::Connection;
use crate::config::PoolConfig;
use crate::db::connection_manager::{SessionManager, SessionMode};
use crate::db::manager::LifecycleState;
use crate::error::DbError;
use crate::transport::{self, TransportRegistry};

/// Errors that can occur with the connection pools
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to create connection pool: {0}")]
    PoolCreation(#[source] DbError),

    #[error("Failed to get connection from pool: {0}")]
    GetConnection(#[source] DbError),

    #[error("Timeout waiting for connection")]
    Timeout,

    #[error("Connection pool is not available (manager is {0})")]
    PoolUnavailable(LifecycleState),

    #[error("Connection pools are already set up")]
    AlreadySetUp,

    #[error("Pool configuration error: {0}")]
    Configuration(String),
}

/// Connection pool statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Current number of sessions in pool
    pub size: u32,
    pub idle_connections: u32,
    pub active_connections: u32,
    pub min_size: u32,
    pub max_size: u32,
}

/// A bb8 pool of sessions of one mode
pub struct ConnectionPool<M: SessionMode> {
    pool: Pool<SessionManager<M>>,
    registry: Arc<TransportRegistry>,
    config: PoolConfig,
}

impl<M: SessionMode> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        }
    }
}

impl<M: SessionMode> ConnectionPool<M> {
    /// Build the pool and open its minimum number of sessions. Fails if
    /// those first sessions cannot be opened.
    #[instrument(skip(manager, config), fields(mode = M::NAME, url = %manager.url()))]
    pub async fn new(manager: SessionManager<M>, config: &PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        info!(
            "Creating {} pool with max_size: {}, min_size: {}",
            M::NAME,
            config.max_size,
            config.min_size
        );

        let registry = Arc::clone(manager.registry());
        let pool = transport::with_acquisition_context(
            Arc::clone(&registry),
            Pool::builder()
                .max_size(config.max_size)
                .min_idle(Some(config.min_size))
                .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
                .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
                .max_lifetime(Some(Duration::from_secs(config.max_lifetime_secs)))
                .retry_connection(config.retry_connection)
                .test_on_check_out(true)
                .build(manager),
        )
        .await
        .map_err(|e| {
            error!("Failed to create {} pool: {}", M::NAME, e);
            PoolError::PoolCreation(e)
        })?;

        info!("Successfully created {} pool", M::NAME);
        Ok(Self {
            pool,
            registry,
            config: config.clone(),
        })
    }

    /// Lease a session from the pool
    ///
    /// Engine lookups made while acquiring go through this pool's registry;
    /// the caller's own lookup context is back in place once this returns.
    #[instrument(skip(self), fields(mode = M::NAME))]
    pub async fn acquire(&self) -> Result<SessionLease<M>, PoolError> {
        debug!("Acquiring session from pool");

        let acquired =
            transport::with_acquisition_context(Arc::clone(&self.registry), self.pool.get_owned())
                .await;

        match acquired {
            Ok(conn) => {
                debug!("Successfully acquired session from pool");
                Ok(SessionLease { conn })
            }
            Err(bb8::RunError::User(e)) => {
                error!("Session manager error: {}", e);
                Err(PoolError::GetConnection(e))
            }
            Err(bb8::RunError::TimedOut) => {
                warn!("Connection pool timeout - consider increasing pool size or timeout");
                Err(PoolError::Timeout)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.pool.state();

        PoolStats {
            size: state.connections,
            idle_connections: state.idle_connections,
            active_connections: state.connections - state.idle_connections,
            min_size: self.config.min_size,
            max_size: self.config.max_size,
        }
    }

    /// Check that a session can be leased and answers a ping
    #[instrument(skip(self), fields(mode = M::NAME))]
    pub async fn health_check(&self) -> bool {
        match self.acquire().await {
            Ok(mut lease) => match lease.ping().await {
                Ok(()) => {
                    debug!("Connection pool health check passed");
                    true
                }
                Err(e) => {
                    warn!("Connection pool health check failed: {}", e);
                    false
                }
            },
            Err(e) => {
                error!("Could not acquire session for health check: {}", e);
                false
            }
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Drop the pool. Idle sessions close now; leased ones close as they
    /// come back.
    pub fn close(self) {
        info!("Shutting down {} pool", M::NAME);
        drop(self.pool);
    }
}

impl<M: SessionMode> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("mode", &M::NAME)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A session leased from a [`ConnectionPool`]
///
/// Dropping the lease releases the session and hands it back to the pool,
/// on every exit path of the code holding it.
pub struct SessionLease<M: SessionMode> {
    conn: PooledConnection<'static, SessionManager<M>>,
}

impl<M: SessionMode> Deref for SessionLease<M> {
    type Target = M::Session;

    fn deref(&self) -> &Self::Target {
        &**self.conn
    }
}

impl<M: SessionMode> DerefMut for SessionLease<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.conn
    }
}

impl<M: SessionMode> Drop for SessionLease<M> {
    fn drop(&mut self) {
        self.conn.release();
    }
}
