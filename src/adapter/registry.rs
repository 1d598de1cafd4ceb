use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{CollectionAdapter, MemoryAdapter, SqliteAdapter};
use crate::config::{CollectionConfig, ConfigError};
use crate::storage::Database;

// ============================================================================
// Adapter Registry
// ============================================================================

/// Collection name to adapter map, owned by the provider.
///
/// Iteration follows registration order so the service document lists
/// collections the way the configuration does.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn CollectionAdapter>>,
    order: Vec<String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter` under `name`, replacing any previous adapter of
    /// that name (its position in the order is kept).
    pub fn register(&mut self, name: impl Into<String>, adapter: Arc<dyn CollectionAdapter>) {
        let name = name.into();
        if self.adapters.insert(name.clone(), adapter).is_none() {
            self.order.push(name);
        }
    }

    pub fn with(mut self, name: impl Into<String>, adapter: Arc<dyn CollectionAdapter>) -> Self {
        self.register(name, adapter);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CollectionAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn CollectionAdapter>)> {
        self.order
            .iter()
            .filter_map(|n| self.adapters.get(n).map(|a| (n.as_str(), a)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("collections", &self.order)
            .finish()
    }
}

// ============================================================================
// Adapter Factories
// ============================================================================

pub type AdapterFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn CollectionAdapter>>> + Send>>;

/// Builds an adapter from its `[[collections]]` table.
pub type AdapterFactory = Box<dyn Fn(CollectionConfig) -> AdapterFuture + Send + Sync>;

/// Adapter constructors keyed by the `adapter` name used in configuration.
#[derive(Default)]
pub struct AdapterFactories {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterFactories {
    /// An empty table; see [`AdapterFactories::with_builtins`].
    pub fn new() -> Self {
        Self::default()
    }

    /// `memory` and `sqlite`. SQLite collections naming the same
    /// `database` share one connection pool.
    pub fn with_builtins() -> Self {
        let mut factories = Self::new();

        factories.register("memory", |config| async move {
            Ok(Arc::new(MemoryAdapter::from_config(&config)) as Arc<dyn CollectionAdapter>)
        });

        let pools: Arc<Mutex<HashMap<String, Database>>> = Arc::default();
        factories.register("sqlite", move |config| {
            let pools = Arc::clone(&pools);
            async move {
                let Some(path) = config.database.clone() else {
                    bail!(ConfigError::Invalid(format!(
                        "collection '{}' uses the sqlite adapter but sets no database",
                        config.name
                    )));
                };
                let db = {
                    let mut pools = pools.lock().await;
                    match pools.get(&path) {
                        Some(db) => db.clone(),
                        None => {
                            let db = Database::open(&path)
                                .await
                                .with_context(|| format!("Failed to open database {path}"))?;
                            pools.insert(path.clone(), db.clone());
                            db
                        }
                    }
                };
                Ok(Arc::new(SqliteAdapter::from_config(db, &config)) as Arc<dyn CollectionAdapter>)
            }
        });

        factories
    }

    pub fn register<F, Fut>(&mut self, key: &str, factory: F)
    where
        F: Fn(CollectionConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn CollectionAdapter>>> + Send + 'static,
    {
        let boxed: AdapterFactory = Box::new(move |config| Box::pin(factory(config)));
        self.factories.insert(key.to_string(), boxed);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub async fn build(&self, config: &CollectionConfig) -> Result<Arc<dyn CollectionAdapter>> {
        let Some(factory) = self.factories.get(&config.adapter) else {
            bail!(ConfigError::UnknownAdapter {
                collection: config.name.clone(),
                adapter: config.adapter.clone(),
            });
        };
        let adapter = factory(config.clone())
            .await
            .with_context(|| format!("Failed to build collection '{}'", config.name))?;
        tracing::info!(
            collection = %config.name,
            adapter = %config.adapter,
            "Collection ready"
        );
        Ok(adapter)
    }

    /// Builds every configured collection. Any unknown adapter key or
    /// duplicate name fails the whole startup.
    pub async fn build_registry(&self, collections: &[CollectionConfig]) -> Result<AdapterRegistry> {
        let mut registry = AdapterRegistry::new();
        for config in collections {
            if registry.get(&config.name).is_some() {
                bail!(ConfigError::Invalid(format!("duplicate collection '{}'", config.name)));
            }
            let adapter = self.build(config).await?;
            registry.register(config.name.clone(), adapter);
        }
        Ok(registry)
    }
}
