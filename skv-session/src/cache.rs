//! # Pool Cache
//!
//! Purpose: Hold exactly one connection pool per backend instance for the life
//! of the process, created lazily on first use.
//!
//! ## Design Principles
//! 1. **Compute If Absent**: Creation runs under the map entry lock, so
//!    concurrent first calls for one key build a single pool. Opening
//!    connections (warm-up) happens after the entry is published and the
//!    lock released.
//! 2. **No Negative Caching**: A failed creation leaves nothing behind; the
//!    next call retries from scratch (including re-reading the CA file).
//! 3. **Pluggable Construction**: `PoolFactory` builds pools; tests swap it.
//! 4. **Explicit Shutdown**: `close_all` closes every pool and refuses new ones.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use skv_client::{ClientError, ClientResult, ConnectionPool, PoolConfig, TlsContext};
use tracing::{debug, info, warn};

use crate::config::TransportSecurity;
use crate::error::{SessionError, SessionResult};
use crate::instance::{InstanceDescriptor, InstanceName, InstanceResolver};

const DEFAULT_MAX_TOTAL: usize = 128;
const DEFAULT_MAX_IDLE: usize = 128;
const DEFAULT_MIN_IDLE: usize = 16;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

static GLOBAL: OnceCell<Arc<PoolCache>> = OnceCell::new();

/// Sizing and timeouts applied to every pool the cache builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolTuning {
    pub max_total: usize,
    pub max_idle: usize,
    pub min_idle: usize,
    /// Connect timeout; borrows wait at most as long.
    pub connect_timeout_ms: u64,
    /// Open `min_idle` connections when the pool is created.
    pub prefill_min_idle: bool,
}

impl Default for PoolTuning {
    fn default() -> Self {
        PoolTuning {
            max_total: DEFAULT_MAX_TOTAL,
            max_idle: DEFAULT_MAX_IDLE,
            min_idle: DEFAULT_MIN_IDLE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            prefill_min_idle: false,
        }
    }
}

impl PoolTuning {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Client pool configuration for one instance.
    pub fn pool_config(&self, instance: &InstanceDescriptor, tls: Option<TlsContext>) -> PoolConfig {
        let mut config = PoolConfig::new(instance.host(), instance.port());
        config.max_total = self.max_total;
        config.max_idle = self.max_idle;
        config.min_idle = self.min_idle;
        config.connect_timeout = self.connect_timeout();
        config.borrow_timeout = self.connect_timeout();
        config.tls = tls;
        config
    }
}

/// Builds the pool for an instance the cache has not seen yet.
pub trait PoolFactory: Send + Sync {
    /// Constructs the pool. Runs under the cache's entry lock, so it should
    /// not touch the network.
    fn build(&self, instance: &InstanceDescriptor) -> ClientResult<ConnectionPool>;

    /// Prepares a freshly published pool, outside any cache lock. A failure
    /// withdraws the pool again.
    fn warm_up(&self, _pool: &ConnectionPool) -> ClientResult<()> {
        Ok(())
    }
}

/// Default factory: TLS context per the security policy, then a pool.
#[derive(Debug, Clone)]
pub struct TlsPoolFactory {
    tuning: PoolTuning,
    security: TransportSecurity,
}

impl TlsPoolFactory {
    pub fn new(tuning: PoolTuning, security: TransportSecurity) -> Self {
        TlsPoolFactory { tuning, security }
    }
}

impl PoolFactory for TlsPoolFactory {
    fn build(&self, instance: &InstanceDescriptor) -> ClientResult<ConnectionPool> {
        let tls = self.security.tls_context()?;
        ConnectionPool::new(self.tuning.pool_config(instance, tls))
    }

    fn warm_up(&self, pool: &ConnectionPool) -> ClientResult<()> {
        if self.tuning.prefill_min_idle {
            let opened = pool.warm_up()?;
            debug!(host = %pool.config().host, opened, "Prefilled connection pool");
        }
        Ok(())
    }
}

/// Process-wide map from instance key to its connection pool.
pub struct PoolCache {
    pools: DashMap<String, ConnectionPool>,
    factory: Arc<dyn PoolFactory>,
    closed: AtomicBool,
}

impl PoolCache {
    /// Cache building TLS pools with the given tuning and security policy.
    pub fn new(tuning: PoolTuning, security: TransportSecurity) -> Self {
        Self::with_factory(Arc::new(TlsPoolFactory::new(tuning, security)))
    }

    pub fn with_factory(factory: Arc<dyn PoolFactory>) -> Self {
        PoolCache {
            pools: DashMap::new(),
            factory,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the pool for `instance`, building it on first use.
    ///
    /// Every caller with the same key gets a handle to the same pool. A build
    /// failure is `SessionError::PoolCreation` and is not remembered.
    pub fn get_or_create_pool(&self, instance: &InstanceDescriptor) -> SessionResult<ConnectionPool> {
        self.ensure_open()?;
        if let Some(pool) = self.pools.get(instance.key()) {
            return Ok(pool.value().clone());
        }

        let pool = match self.pools.entry(instance.key().to_string()) {
            Entry::Occupied(entry) => return Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                // Re-check under the entry lock; close_all may have run.
                self.ensure_open()?;
                let pool = self
                    .factory
                    .build(instance)
                    .map_err(|err| creation_failed(instance, err))?;
                entry.insert(pool).value().clone()
            }
        };

        if let Err(err) = self.factory.warm_up(&pool) {
            self.pools
                .remove_if(instance.key(), |_, cached| ConnectionPool::ptr_eq(cached, &pool));
            pool.close();
            return Err(creation_failed(instance, err));
        }
        info!(
            instance = %instance.key(),
            host = %instance.host(),
            port = instance.port(),
            "Created connection pool"
        );
        Ok(pool)
    }

    /// Resolves `name` and returns its pool.
    pub fn get_or_create_pool_for(
        &self,
        resolver: &dyn InstanceResolver,
        name: &InstanceName,
    ) -> SessionResult<ConnectionPool> {
        let descriptor = resolver.resolve(name)?;
        self.get_or_create_pool(&descriptor)
    }

    /// Closes every pool and refuses to build new ones. Idempotent.
    pub fn close_all(&self) {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        let keys: Vec<String> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, pool)) = self.pools.remove(&key) {
                pool.close();
            }
        }
        if first {
            info!("Closed all connection pools");
        } else {
            debug!("Pool cache already closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Whether a pool for `key` has been created.
    pub fn contains(&self, key: &str) -> bool {
        self.pools.contains_key(key)
    }

    /// Installs the process-wide cache. Fails if one is already installed.
    pub fn install_global(cache: PoolCache) -> SessionResult<Arc<PoolCache>> {
        let cache = Arc::new(cache);
        GLOBAL
            .set(cache.clone())
            .map_err(|_| SessionError::Config("global pool cache already installed".to_string()))?;
        Ok(cache)
    }

    /// The process-wide cache, if installed.
    pub fn global() -> Option<Arc<PoolCache>> {
        GLOBAL.get().cloned()
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::StoreUnavailable {
                source: ClientError::PoolClosed,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for PoolCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCache")
            .field("pools", &self.pools.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn creation_failed(instance: &InstanceDescriptor, err: ClientError) -> SessionError {
    warn!(
        instance = %instance.key(),
        host = %instance.host(),
        port = instance.port(),
        error = %err,
        "Failed to create connection pool"
    );
    SessionError::PoolCreation {
        instance: instance.key().to_string(),
        source: err,
    }
}
