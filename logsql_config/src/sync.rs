//! The process wide config snapshot and the task that keeps it current.

use std::sync::Arc;

use futures::{StreamExt, stream::BoxStream};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::{Config, ValidationError},
    notify::ConfigEvent,
    store::{ConfigStore, Result},
};

/// Read access to the current config snapshot.
pub trait ConfigProvider: std::fmt::Debug + Send + Sync + 'static {
    fn snapshot(&self) -> Arc<Config>;
}

/// A [`ConfigProvider`] that never changes.
#[derive(Debug, Clone)]
pub struct StaticConfig(Arc<Config>);

impl StaticConfig {
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }
}

impl ConfigProvider for StaticConfig {
    fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&self.0)
    }
}

/// Holds the current [`Config`] and replaces it wholesale when the
/// descriptor changes.
///
/// Readers take a cheap [`Arc`] clone under the read lock and keep working
/// on that snapshot; a swap only holds the write lock for the pointer
/// exchange. All descriptor I/O happens outside the lock.
#[derive(Debug)]
pub struct ConfigSynchronizer {
    current: RwLock<Arc<Config>>,
    store: ConfigStore,
}

impl ConfigSynchronizer {
    /// Load the persisted config, creating it if this is the first boot.
    pub async fn initialize(store: ConfigStore) -> Result<Self> {
        let config = store.load_or_initialize().await?;
        info!(
            path = %store.path(),
            tables = config.tables.len(),
            datastores = config.datastores.len(),
            "config loaded"
        );
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
            store,
        })
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Validate `config` and make it the current snapshot, returning the
    /// previous one.
    pub fn replace(&self, config: Config) -> Result<Arc<Config>, ValidationError> {
        config.validate()?;
        Ok(self.swap(Arc::new(config)))
    }

    /// Persist `config` and make it the current snapshot.
    pub async fn persist(&self, config: Config) -> Result<()> {
        self.store.persist(&config).await?;
        self.swap(Arc::new(config));
        Ok(())
    }

    /// Replace the snapshot with an empty config.
    pub fn reset(&self) {
        self.swap(Arc::new(Config::default()));
    }

    /// Apply one descriptor change. On error the current snapshot is kept.
    pub async fn apply(&self, event: ConfigEvent) -> Result<()> {
        match event {
            ConfigEvent::Updated => match self.store.load().await? {
                Some(config) => {
                    info!(
                        tables = config.tables.len(),
                        datastores = config.datastores.len(),
                        "config reloaded"
                    );
                    self.swap(Arc::new(config));
                }
                None => {
                    info!("config descriptor vanished, resetting to empty config");
                    self.reset();
                }
            },
            ConfigEvent::Removed => {
                info!("config descriptor removed, resetting to empty config");
                self.reset();
            }
        }
        Ok(())
    }

    /// Apply events from `events` until the stream ends or `shutdown` is
    /// cancelled.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        mut events: BoxStream<'static, ConfigEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = this.apply(event).await {
                    warn!(error = %e, ?event, "rejected config change, keeping previous snapshot");
                }
            }
            info!("config watcher stopped");
        })
    }

    fn swap(&self, config: Arc<Config>) -> Arc<Config> {
        std::mem::replace(&mut *self.current.write(), config)
    }
}

impl ConfigProvider for ConfigSynchronizer {
    fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&self.current.read())
    }
}
