//! CLI config for the object store holding the config descriptor.

use std::{path::PathBuf, sync::Arc};

use logsql_config::{DEFAULT_CONFIG_PATH, DatastoreInfo};
use logsql_object_store::{DatastoreConnector, ObjectStoreProvider};
use object_store::{ObjectStore, path::Path as ObjPath};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum MetaStoreError {
    #[error("--meta-store={store} requires {missing}")]
    MissingOption {
        store: MetaStoreType,
        missing: &'static str,
    },

    #[error("invalid meta store data directory {path:?}: {source}")]
    InvalidDataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("meta store data directory {0:?} cannot be expressed as a URL")]
    DataDirUrl(PathBuf),

    #[error(transparent)]
    Connect(#[from] logsql_object_store::Error),
}

/// Kind of storage holding the config descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum MetaStoreType {
    /// In-memory, lost on restart. Useful for local runs and tests.
    Memory,

    /// A local directory. Must also set `--meta-data-dir`.
    File,

    /// An S3 compatible service. Must also set `--meta-endpoint`.
    S3,
}

impl std::fmt::Display for MetaStoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::S3 => "s3",
        })
    }
}

/// CLI config for the metadata store.
#[derive(Debug, Clone, clap::Parser)]
pub struct MetaStoreConfig {
    /// Where the config descriptor lives.
    #[clap(
        value_enum,
        long = "meta-store",
        env = "LOGSQL_META_STORE",
        ignore_case = true,
        default_value = "memory",
        action
    )]
    pub store: MetaStoreType,

    /// Endpoint of the S3 compatible service, e.g. `http://minio:9000`.
    #[clap(long = "meta-endpoint", env = "LOGSQL_META_ENDPOINT", action)]
    pub endpoint: Option<String>,

    /// Access key for `--meta-endpoint`. Leave unset for anonymous access.
    #[clap(
        long = "meta-access-key",
        env = "LOGSQL_META_ACCESS_KEY",
        default_value = "",
        hide_env_values = true,
        action
    )]
    pub access_key: String,

    /// Secret key for `--meta-endpoint`.
    #[clap(
        long = "meta-secret-key",
        env = "LOGSQL_META_SECRET_KEY",
        default_value = "",
        hide_env_values = true,
        action
    )]
    pub secret_key: String,

    /// Bucket holding the descriptor.
    #[clap(
        long = "meta-bucket",
        env = "LOGSQL_META_BUCKET",
        default_value = "logsql-meta",
        action
    )]
    pub bucket: String,

    /// Region used to sign requests to `--meta-endpoint`, and to every
    /// datastore.
    #[clap(
        long = "meta-region",
        env = "LOGSQL_META_REGION",
        default_value = logsql_object_store::provider::DEFAULT_REGION,
        action
    )]
    pub region: String,

    /// Local directory for `--meta-store=file`.
    #[clap(long = "meta-data-dir", env = "LOGSQL_META_DATA_DIR", action)]
    pub data_dir: Option<PathBuf>,

    /// Key of the descriptor within the bucket.
    #[clap(
        long = "config-path",
        env = "LOGSQL_CONFIG_PATH",
        default_value = DEFAULT_CONFIG_PATH,
        action
    )]
    pub config_path: String,
}

impl MetaStoreConfig {
    /// The descriptor store as a datastore, so it is connected to the same
    /// way as any other.
    pub fn datastore(&self) -> Result<DatastoreInfo, MetaStoreError> {
        let endpoint = match self.store {
            MetaStoreType::Memory => "memory://".to_string(),
            MetaStoreType::File => {
                let dir = self.data_dir.as_ref().ok_or(MetaStoreError::MissingOption {
                    store: self.store,
                    missing: "--meta-data-dir",
                })?;
                std::fs::create_dir_all(dir).map_err(|source| MetaStoreError::InvalidDataDir {
                    path: dir.clone(),
                    source,
                })?;
                let dir = std::path::absolute(dir).map_err(|source| {
                    MetaStoreError::InvalidDataDir {
                        path: dir.clone(),
                        source,
                    }
                })?;
                Url::from_directory_path(&dir)
                    .map_err(|_| MetaStoreError::DataDirUrl(dir.clone()))?
                    .to_string()
            }
            MetaStoreType::S3 => self
                .endpoint
                .clone()
                .ok_or(MetaStoreError::MissingOption {
                    store: self.store,
                    missing: "--meta-endpoint",
                })?,
        };
        Ok(DatastoreInfo {
            endpoint,
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            bucket: self.bucket.clone(),
            prefix: String::new(),
        })
    }

    /// Connect to the descriptor store.
    pub fn object_store(
        &self,
        connector: &DatastoreConnector,
    ) -> Result<Arc<dyn ObjectStore>, MetaStoreError> {
        Ok(connector.object_store("meta", &self.datastore()?)?)
    }

    pub fn config_path(&self) -> ObjPath {
        ObjPath::from(self.config_path.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> MetaStoreConfig {
        MetaStoreConfig::try_parse_from(std::iter::once("logsql").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn memory_by_default() {
        let config = parse(&[]);
        assert_eq!(config.store, MetaStoreType::Memory);
        assert_eq!(config.datastore().unwrap().endpoint, "memory://");
        assert_eq!(config.config_path().as_ref(), DEFAULT_CONFIG_PATH);
        assert!(config.object_store(&DatastoreConnector::default()).is_ok());
    }

    #[test]
    fn s3_needs_an_endpoint() {
        let config = parse(&["--meta-store", "S3", "--meta-bucket", "meta"]);
        assert!(matches!(
            config.datastore(),
            Err(MetaStoreError::MissingOption {
                missing: "--meta-endpoint",
                ..
            })
        ));

        let config = parse(&[
            "--meta-store=s3",
            "--meta-endpoint=http://minio:9000",
            "--meta-access-key=minio",
            "--meta-secret-key=minio123",
        ]);
        let datastore = config.datastore().unwrap();
        assert_eq!(datastore.endpoint, "http://minio:9000");
        assert_eq!(datastore.access_key, "minio");
        assert_eq!(datastore.bucket, "logsql-meta");
    }

    #[test]
    fn file_needs_a_directory() {
        let config = parse(&["--meta-store=file"]);
        assert!(matches!(
            config.datastore(),
            Err(MetaStoreError::MissingOption {
                missing: "--meta-data-dir",
                ..
            })
        ));

        let dir = std::env::temp_dir().join(format!("logsql-meta-{}", std::process::id()));
        let config = parse(&["--meta-store=file", "--meta-data-dir", dir.to_str().unwrap()]);
        let datastore = config.datastore().unwrap();
        assert!(datastore.endpoint.starts_with("file:///"), "{}", datastore.endpoint);
        assert!(config.object_store(&DatastoreConnector::default()).is_ok());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
