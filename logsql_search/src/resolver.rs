//! Mapping a table to the datastores holding its objects.

use logsql_config::{Config, DatastoreInfo};
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error("table '{table}' references datastore '{datastore}' which is not configured")]
    DatastoreNotFound { table: String, datastore: String },
}

/// A datastore together with the name it is configured under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDatastore {
    pub name: String,
    pub info: DatastoreInfo,
}

/// The datastores of `table`, in configured order.
pub fn resolve(config: &Config, table: &str) -> Result<Vec<ResolvedDatastore>, ResolveError> {
    let table_info = config
        .table(table)
        .ok_or_else(|| ResolveError::TableNotFound(table.to_string()))?;

    table_info
        .datastores
        .iter()
        .map(|name| {
            config
                .datastore(name)
                .map(|info| ResolvedDatastore {
                    name: name.clone(),
                    info: info.clone(),
                })
                .ok_or_else(|| ResolveError::DatastoreNotFound {
                    table: table.to_string(),
                    datastore: name.clone(),
                })
        })
        .collect()
}

/// The datastores of `table` in a fresh random order, spreading the read
/// load of concurrent searches across clusters.
pub fn resolve_shuffled(
    config: &Config,
    table: &str,
) -> Result<Vec<ResolvedDatastore>, ResolveError> {
    let mut datastores = resolve(config, table)?;
    datastores.shuffle(&mut rand::thread_rng());
    Ok(datastores)
}
