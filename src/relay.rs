//! Assembly of a ready-to-serve relay from [`RelayConfig`].

use crate::cache::{CacheManager, CacheStore, MemoryStore, NullStore, SqliteStore};
use crate::config::{CacheBackend, RelayConfig};
use crate::dispatch::Dispatcher;
use crate::mcp::McpServer;
use crate::resilience::RateLimiter;
use crate::tools::{ApiIntegrationTool, CacheStatusTool, DatabaseQueryTool, ToolRegistry};
use crate::transport::{HttpTransport, Transport};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Relay {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ToolRegistry>,
    sqlite: Option<Arc<SqliteStore>>,
    prune_interval: Duration,
}

impl Relay {
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.http)?);
        Self::with_transport(config, transport)
    }

    /// Same as [`from_config`](Self::from_config) with a caller-supplied transport.
    pub fn with_transport(config: &RelayConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let (store, sqlite): (Arc<dyn CacheStore>, Option<Arc<SqliteStore>>) =
            match config.cache.backend {
                CacheBackend::Sqlite => {
                    let store = Arc::new(SqliteStore::open(&config.cache.db_path)?);
                    (store.clone(), Some(store))
                }
                CacheBackend::Memory => {
                    (Arc::new(MemoryStore::new(config.cache.memory_capacity)), None)
                }
                CacheBackend::None => (Arc::new(NullStore::new()), None),
            };

        let cache = Arc::new(CacheManager::new(config.cache_config(), store));
        let limiter = Arc::new(RateLimiter::new(config.limiter_config()));
        let dispatcher = Arc::new(
            Dispatcher::builder()
                .cache(cache)
                .limiter(limiter)
                .transport(transport)
                .backoff(config.backoff_policy())
                .single_flight(config.single_flight)
                .build()?,
        );

        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(ApiIntegrationTool::new(Arc::clone(&dispatcher))))
            .register(Arc::new(CacheStatusTool::new(Arc::clone(&dispatcher))));
        if let Some(store) = &sqlite {
            registry.register(Arc::new(DatabaseQueryTool::new(Arc::clone(store))));
        }

        tracing::info!(
            backend = dispatcher.cache().backend_name(),
            tools = registry.len(),
            single_flight = config.single_flight,
            "relay assembled"
        );
        Ok(Self {
            dispatcher,
            registry: Arc::new(registry),
            sqlite,
            prune_interval: config.limiter_prune_interval(),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn sqlite(&self) -> Option<&Arc<SqliteStore>> {
        self.sqlite.as_ref()
    }

    /// Background expiry sweep; `None` when caching is off.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let cache = self.dispatcher.cache();
        cache.is_enabled().then(|| cache.spawn_sweeper())
    }

    /// Background removal of idle per-host limiter windows.
    pub fn spawn_limiter_pruner(&self) -> JoinHandle<()> {
        self.dispatcher.limiter().spawn_pruner(self.prune_interval)
    }

    pub fn server(&self) -> McpServer {
        McpServer::new(Arc::clone(&self.registry))
    }
}
