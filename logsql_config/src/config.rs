//! The deployment configuration: datastores, tables and the access grants
//! that scope tokens to tables.

use std::{collections::BTreeMap, sync::LazyLock, time::Duration};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version written into newly created descriptors.
pub const CONFIG_VERSION: &str = "1";

/// Record delimiter used for search output when a table does not set one.
pub const DEFAULT_RECORD_DELIMITER: &str = "\n";

static TABLE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^[A-Za-z][A-Za-z0-9_-]+$").expect("table name pattern is a valid regex")
});

/// Returns true if `name` is an acceptable table name.
pub fn is_valid_table_name(name: &str) -> bool {
    TABLE_NAME_REGEX.is_match(name)
}

/// Checks `name` against the table name grammar.
pub fn validate_table_name(name: &str) -> Result<(), ValidationError> {
    if is_valid_table_name(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidTableName(name.to_string()))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid table name '{0}', names must match ^[A-Za-z][A-Za-z0-9_-]+$")]
    InvalidTableName(String),

    #[error("table '{table}' references unknown datastore '{datastore}'")]
    UnknownDatastore { table: String, datastore: String },

    #[error("table '{table}' has invalid commit window '{value}': {reason}")]
    InvalidCommitWindow {
        table: String,
        value: String,
        reason: String,
    },
}

/// An immutable configuration snapshot.
///
/// Snapshots are never changed once they are shared; the synchronizer
/// replaces the whole value when the descriptor changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, rename = "datastore")]
    pub datastores: BTreeMap<String, DatastoreInfo>,

    #[serde(default, rename = "table")]
    pub tables: BTreeMap<String, TableInfo>,

    /// token -> table -> grant
    #[serde(default)]
    pub auth: BTreeMap<String, BTreeMap<String, AuthGrant>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            datastores: BTreeMap::new(),
            tables: BTreeMap::new(),
            auth: BTreeMap::new(),
        }
    }
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

impl Config {
    /// Check every table name, every table to datastore reference and every
    /// commit window.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, table) in &self.tables {
            validate_table_name(name)?;
            for datastore in &table.datastores {
                if !self.datastores.contains_key(datastore) {
                    return Err(ValidationError::UnknownDatastore {
                        table: name.clone(),
                        datastore: datastore.clone(),
                    });
                }
            }
            table
                .commit_window()
                .map_err(|e| ValidationError::InvalidCommitWindow {
                    table: name.clone(),
                    value: table.commit_window.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    pub fn datastore(&self, name: &str) -> Option<&DatastoreInfo> {
        self.datastores.get(name)
    }

    /// Table names in lexical order.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Returns the grant `token` holds on `table`, if any.
    pub fn grant(&self, token: &str, table: &str) -> Option<&AuthGrant> {
        self.auth.get(token).and_then(|grants| grants.get(table))
    }

    /// Returns true if `token` holds at least one grant.
    pub fn knows_token(&self, token: &str) -> bool {
        self.auth.get(token).is_some_and(|grants| !grants.is_empty())
    }
}

/// A pointer to one bucket and prefix in one object storage cluster.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatastoreInfo {
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
}

// Keep credentials out of logs.
impl std::fmt::Debug for DatastoreInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatastoreInfo")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// A logical namespace spanning one or more datastores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub datastores: Vec<String>,

    #[serde(default = "default_record_delimiter")]
    pub output_record_delimiter: String,

    /// Maximum age of an ingestion batch before it is flushed, as a human
    /// readable duration. `"0"` disables time based flushing.
    #[serde(default = "default_commit_window")]
    pub commit_window: String,
}

fn default_record_delimiter() -> String {
    DEFAULT_RECORD_DELIMITER.to_string()
}

fn default_commit_window() -> String {
    "0".to_string()
}

impl TableInfo {
    pub fn new<I, S>(datastores: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            datastores: datastores.into_iter().map(Into::into).collect(),
            output_record_delimiter: default_record_delimiter(),
            commit_window: default_commit_window(),
        }
    }

    pub fn with_commit_window(mut self, window: impl Into<String>) -> Self {
        self.commit_window = window.into();
        self
    }

    pub fn with_record_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.output_record_delimiter = delimiter.into();
        self
    }

    /// The parsed commit window, `None` when time based flushing is off.
    pub fn commit_window(&self) -> Result<Option<Duration>, humantime::DurationError> {
        let window = self.commit_window.trim();
        if window.is_empty() || window == "0" {
            return Ok(None);
        }
        let window = humantime::parse_duration(window)?;
        Ok((!window.is_zero()).then_some(window))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Search,
    Store,
    Admin,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Search => write!(f, "search"),
            Self::Store => write!(f, "store"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// A capability grant for one token on one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthGrant {
    pub token: String,

    #[serde(default)]
    pub scopes: Vec<Scope>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AuthGrant {
    pub fn new(token: impl Into<String>, scopes: impl IntoIterator<Item = Scope>) -> Self {
        Self {
            token: token.into(),
            scopes: scopes.into_iter().collect(),
            expiry: None,
            enabled: true,
        }
    }

    /// `admin` implies every other scope.
    pub fn allows(&self, scope: Scope) -> bool {
        self.scopes.iter().any(|s| *s == scope || *s == Scope::Admin)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expiry.is_none_or(|expiry| expiry > now)
    }
}
