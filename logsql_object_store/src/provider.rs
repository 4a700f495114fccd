//! Connections from configured datastores to [`ObjectStore`] clients.

use std::{path::PathBuf, sync::Arc};

use dashmap::DashMap;
use logsql_config::DatastoreInfo;
use object_store::{
    ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory,
};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Region used to sign S3 requests when none is configured.
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Error)]
pub enum Error {
    #[error("datastore '{datastore}' has an invalid endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        datastore: String,
        endpoint: String,
        source: url::ParseError,
    },

    #[error("datastore '{datastore}' uses unsupported endpoint scheme '{scheme}'")]
    UnsupportedScheme { datastore: String, scheme: String },

    #[error("datastore '{datastore}' endpoint '{endpoint}' is not a local directory")]
    InvalidDirectory { datastore: String, endpoint: String },

    #[error("failed to create directory {path:?} for datastore '{datastore}': {source}")]
    CreateDirectory {
        datastore: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to connect to datastore '{datastore}': {source}")]
    Connect {
        datastore: String,
        source: object_store::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Hands out the object store backing a datastore.
pub trait ObjectStoreProvider: std::fmt::Debug + Send + Sync + 'static {
    fn object_store(&self, name: &str, datastore: &DatastoreInfo)
    -> Result<Arc<dyn ObjectStore>>;
}

/// Builds object stores from a datastore's endpoint scheme:
///
/// * `http://`, `https://`: an S3 compatible service, path style addressing
/// * `file:///dir`: the local directory `dir/<bucket>`
/// * `memory://`: a process local in-memory store, one per bucket
///
/// Clients are cached by their full connection parameters so a datastore
/// that is unchanged across config reloads keeps its client.
#[derive(Debug)]
pub struct DatastoreConnector {
    region: String,
    connections: DashMap<DatastoreInfo, Arc<dyn ObjectStore>>,
    memory: DashMap<String, Arc<InMemory>>,
}

impl Default for DatastoreConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REGION)
    }
}

impl DatastoreConnector {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            connections: DashMap::new(),
            memory: DashMap::new(),
        }
    }

    fn connect(&self, name: &str, datastore: &DatastoreInfo) -> Result<Arc<dyn ObjectStore>> {
        let url = Url::parse(&datastore.endpoint).map_err(|source| Error::InvalidEndpoint {
            datastore: name.to_string(),
            endpoint: datastore.endpoint.clone(),
            source,
        })?;

        match url.scheme() {
            scheme @ ("http" | "https") => {
                let mut builder = AmazonS3Builder::new()
                    .with_endpoint(datastore.endpoint.trim_end_matches('/'))
                    .with_bucket_name(&datastore.bucket)
                    .with_region(&self.region)
                    .with_allow_http(scheme == "http")
                    .with_virtual_hosted_style_request(false);
                builder = if datastore.access_key.is_empty() {
                    builder.with_skip_signature(true)
                } else {
                    builder
                        .with_access_key_id(&datastore.access_key)
                        .with_secret_access_key(&datastore.secret_key)
                };
                let store = builder.build().map_err(|source| Error::Connect {
                    datastore: name.to_string(),
                    source,
                })?;
                Ok(Arc::new(store))
            }
            "file" => {
                let root = url.to_file_path().map_err(|_| Error::InvalidDirectory {
                    datastore: name.to_string(),
                    endpoint: datastore.endpoint.clone(),
                })?;
                let path = root.join(&datastore.bucket);
                std::fs::create_dir_all(&path).map_err(|source| Error::CreateDirectory {
                    datastore: name.to_string(),
                    path: path.clone(),
                    source,
                })?;
                let store =
                    LocalFileSystem::new_with_prefix(&path).map_err(|source| Error::Connect {
                        datastore: name.to_string(),
                        source,
                    })?;
                Ok(Arc::new(store))
            }
            "memory" => {
                let store = self
                    .memory
                    .entry(datastore.bucket.clone())
                    .or_insert_with(|| Arc::new(InMemory::new()));
                let store: Arc<dyn ObjectStore> = Arc::<InMemory>::clone(store.value());
                Ok(store)
            }
            scheme => Err(Error::UnsupportedScheme {
                datastore: name.to_string(),
                scheme: scheme.to_string(),
            }),
        }
    }
}

impl ObjectStoreProvider for DatastoreConnector {
    fn object_store(
        &self,
        name: &str,
        datastore: &DatastoreInfo,
    ) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = self.connections.get(datastore) {
            return Ok(Arc::clone(store.value()));
        }
        let store = self.connect(name, datastore)?;
        debug!(datastore = name, endpoint = %datastore.endpoint, bucket = %datastore.bucket, "connected datastore");
        self.connections
            .insert(datastore.clone(), Arc::clone(&store));
        Ok(store)
    }
}
