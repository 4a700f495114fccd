//! Persistence of the [`Config`] descriptor in object storage.

use std::sync::Arc;

use object_store::{ObjectStore, PutMode, PutPayload, path::Path as ObjPath};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, ValidationError};

/// Default location of the descriptor inside the metadata bucket.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("config descriptor at {path} is not valid UTF-8")]
    NotUtf8 { path: ObjPath },

    #[error("config descriptor at {path} could not be parsed: {source}")]
    Deserialize {
        path: ObjPath,
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("config descriptor at {path} is invalid: {source}")]
    Invalid {
        path: ObjPath,
        source: ValidationError,
    },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Reads and writes the TOML descriptor holding the deployment [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    object_store: Arc<dyn ObjectStore>,
    path: ObjPath,
}

impl ConfigStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, path: ObjPath) -> Self {
        Self { object_store, path }
    }

    pub fn path(&self) -> &ObjPath {
        &self.path
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.object_store)
    }

    /// Load and validate the descriptor. Returns `None` if it does not exist.
    pub async fn load(&self) -> Result<Option<Config>> {
        let bytes = match self.object_store.get(&self.path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.decode(&bytes).map(Some)
    }

    /// Overwrite the descriptor with `config`.
    pub async fn persist(&self, config: &Config) -> Result<()> {
        let payload = self.encode(config)?;
        self.object_store.put(&self.path, payload).await?;
        debug!(path = %self.path, "persisted config descriptor");
        Ok(())
    }

    /// Load the descriptor, creating an empty one if none exists.
    ///
    /// Creation is conditional so that instances starting at the same time
    /// all end up with the descriptor written by whichever of them won.
    pub async fn load_or_initialize(&self) -> Result<Config> {
        if let Some(config) = self.load().await? {
            return Ok(config);
        }
        self.initialize().await
    }

    /// Create an empty descriptor unless one already exists, returning the
    /// config that is in effect afterwards.
    pub async fn initialize(&self) -> Result<Config> {
        let config = Config::default();
        let payload = self.encode(&config)?;
        match self
            .object_store
            .put_opts(&self.path, payload, PutMode::Create.into())
            .await
        {
            Ok(_) => {
                info!(path = %self.path, "created empty config descriptor");
                Ok(config)
            }
            Err(object_store::Error::AlreadyExists { .. }) => {
                debug!(path = %self.path, "config descriptor created concurrently, loading it");
                Ok(self.load().await?.unwrap_or(config))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn encode(&self, config: &Config) -> Result<PutPayload> {
        config.validate().map_err(|source| StoreError::Invalid {
            path: self.path.clone(),
            source,
        })?;
        Ok(PutPayload::from(toml::to_string(config)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Config> {
        let text = std::str::from_utf8(bytes).map_err(|_| StoreError::NotUtf8 {
            path: self.path.clone(),
        })?;
        let config: Config = toml::from_str(text).map_err(|source| StoreError::Deserialize {
            path: self.path.clone(),
            source,
        })?;
        config.validate().map_err(|source| StoreError::Invalid {
            path: self.path.clone(),
            source,
        })?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatastoreInfo, TableInfo};
    use object_store::memory::InMemory;
    use pretty_assertions::assert_eq;

    fn store() -> ConfigStore {
        ConfigStore::new(Arc::new(InMemory::new()), ObjPath::from(DEFAULT_CONFIG_PATH))
    }

    fn weblog_config() -> Config {
        let mut config = Config::default();
        config.datastores.insert(
            "ds1".to_string(),
            DatastoreInfo {
                endpoint: "memory://".to_string(),
                access_key: String::new(),
                secret_key: String::new(),
                bucket: "logs".to_string(),
                prefix: "minsql".to_string(),
            },
        );
        config
            .tables
            .insert("weblog".to_string(), TableInfo::new(["ds1"]));
        config
    }

    #[tokio::test]
    async fn missing_descriptor_loads_as_none() {
        assert_eq!(store().load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn first_boot_persists_an_empty_config() {
        let store = store();
        let config = store.load_or_initialize().await.unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(store.load().await.unwrap(), Some(Config::default()));
    }

    #[tokio::test]
    async fn initialize_keeps_an_existing_descriptor() {
        let store = store();
        store.persist(&weblog_config()).await.unwrap();

        // another instance lost the creation race
        let config = store.initialize().await.unwrap();
        assert_eq!(config, weblog_config());
        assert_eq!(store.load_or_initialize().await.unwrap(), weblog_config());
    }

    #[tokio::test]
    async fn malformed_descriptor_is_an_error() {
        let store = store();
        store
            .object_store()
            .put(store.path(), PutPayload::from("[table.weblog\n"))
            .await
            .unwrap();
        assert!(matches!(
            store.load().await,
            Err(StoreError::Deserialize { .. })
        ));
    }

    #[tokio::test]
    async fn descriptor_with_dangling_datastore_is_an_error() {
        let store = store();
        store
            .object_store()
            .put(
                store.path(),
                PutPayload::from("[table.weblog]\ndatastores = [\"gone\"]\n"),
            )
            .await
            .unwrap();
        assert!(matches!(
            store.load().await,
            Err(StoreError::Invalid {
                source: ValidationError::UnknownDatastore { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn invalid_config_is_never_written() {
        let store = store();
        let mut config = weblog_config();
        config.datastores.clear();
        assert!(matches!(
            store.persist(&config).await,
            Err(StoreError::Invalid { .. })
        ));
        assert_eq!(store.load().await.unwrap(), None);
    }
}
