//! Deployment configuration for the log search engine.
//!
//! The [`Config`] names the datastores (bucket/prefix pairs in object
//! storage), the tables spread across them and the tokens allowed to use
//! them. It lives in a TOML descriptor ([`ConfigStore`]) and is kept in
//! memory by the [`ConfigSynchronizer`], which every other component reads
//! through the [`ConfigProvider`] trait.

pub mod config;
pub mod notify;
pub mod store;
pub mod sync;

pub use config::{
    AuthGrant, Config, DEFAULT_RECORD_DELIMITER, DatastoreInfo, Scope, TableInfo,
    ValidationError, is_valid_table_name, validate_table_name,
};
pub use notify::{ChannelNotifier, ConfigEvent, ConfigNotifier, PollingNotifier};
pub use store::{ConfigStore, DEFAULT_CONFIG_PATH, StoreError};
pub use sync::{ConfigProvider, ConfigSynchronizer, StaticConfig};
