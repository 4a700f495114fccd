//! Batching an ingestion request into objects.

use std::{fmt::Display, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use logsql_config::{Config, ConfigProvider, DatastoreInfo, validate_table_name};
use logsql_object_store::{ObjectFilePath, ObjectFormat, ObjectStoreProvider, into_lines};
use object_store::PutPayload;
use arrow_schema::SchemaRef;
use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    schema::infer_schema,
    serialize::{SerializeError, to_parquet, to_text},
};

/// Default bound on the records of one committed object.
pub const DEFAULT_MAX_RECORDS_PER_FILE: usize = 10_000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid table name '{0}'")]
    InvalidTableName(String),
}

#[derive(Debug, Error)]
enum FlushError {
    #[error("table has no reachable datastore")]
    NoDatastore,

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error(transparent)]
    Connect(#[from] logsql_object_store::Error),

    #[error("failed to write object: {0}")]
    Put(#[from] object_store::Error),
}

/// Counts for one ingestion request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    /// Records taken from the body.
    pub accepted: usize,
    /// Records committed to a datastore.
    pub persisted: usize,
    /// Records lost to parsing, serialization or storage failures.
    pub dropped: usize,
    /// Objects written.
    pub files: usize,
}

/// Opens ingestion sessions against the current config.
#[derive(Debug, Clone)]
pub struct Ingester {
    config: Arc<dyn ConfigProvider>,
    provider: Arc<dyn ObjectStoreProvider>,
    max_records_per_file: usize,
}

impl Ingester {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        provider: Arc<dyn ObjectStoreProvider>,
        max_records_per_file: usize,
    ) -> Self {
        Self {
            config,
            provider,
            max_records_per_file: max_records_per_file.max(1),
        }
    }

    /// Start ingesting into `table`.
    ///
    /// Returns `Ok(None)` for a well formed name that isn't configured; the
    /// caller is expected to accept and discard the body, since a table
    /// created moments ago may not have reached this instance yet.
    pub fn session(&self, table: &str) -> Result<Option<IngestSession>, Error> {
        validate_table_name(table).map_err(|_| Error::InvalidTableName(table.to_string()))?;
        let config = self.config.snapshot();
        let Some(table_info) = config.table(table) else {
            debug!(%table, "discarding ingestion for unknown table");
            return Ok(None);
        };

        let commit_window = table_info.commit_window().unwrap_or_else(|e| {
            warn!(%table, error = %e, "ignoring invalid commit window");
            None
        });
        let datastores = datastores(&config, table, &table_info.datastores);
        Ok(Some(IngestSession {
            table: table.to_string(),
            datastores,
            provider: Arc::clone(&self.provider),
            max_records_per_file: self.max_records_per_file,
            commit_window,
            mode: None,
            schema: None,
            batch: Batch::default(),
            summary: IngestSummary::default(),
        }))
    }
}

fn datastores(config: &Config, table: &str, names: &[String]) -> Vec<(String, DatastoreInfo)> {
    names
        .iter()
        .filter_map(|name| match config.datastore(name) {
            Some(info) => Some((name.clone(), info.clone())),
            None => {
                warn!(%table, datastore = %name, "table refers to an unknown datastore");
                None
            }
        })
        .collect()
}

/// How the records of a request are stored, decided by its first line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// JSON objects, committed as parquet.
    Json,
    /// Text lines, committed as is.
    Raw,
}

impl Mode {
    fn detect(line: &str) -> Self {
        let line = line.trim_start();
        let json = (line.starts_with('{') || line.starts_with('['))
            && serde_json::from_str::<Value>(line).is_ok_and(|v| v.is_object() || v.is_array());
        if json { Self::Json } else { Self::Raw }
    }

    fn format(self) -> ObjectFormat {
        match self {
            Self::Json => ObjectFormat::Json,
            Self::Raw => ObjectFormat::Raw,
        }
    }
}

#[derive(Debug, Default)]
struct Batch {
    records: Vec<Map<String, Value>>,
    lines: Vec<Bytes>,
    opened: Option<Instant>,
}

impl Batch {
    fn len(&self) -> usize {
        self.records.len() + self.lines.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One ingestion request for one table.
#[derive(Debug)]
pub struct IngestSession {
    table: String,
    datastores: Vec<(String, DatastoreInfo)>,
    provider: Arc<dyn ObjectStoreProvider>,
    max_records_per_file: usize,
    commit_window: Option<Duration>,
    mode: Option<Mode>,
    /// Columns of every parquet object of this request, taken from the
    /// first record with a storable field.
    schema: Option<SchemaRef>,
    batch: Batch,
    summary: IngestSummary,
}

impl IngestSession {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Consume `body`, committing a batch whenever it is full or its commit
    /// window elapses, and once more at the end of the body.
    ///
    /// A body error ends the request after committing what was read.
    pub async fn ingest<S, E>(mut self, body: S) -> IngestSummary
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let mut lines = into_lines(body);
        loop {
            let deadline = self.deadline();
            let next = tokio::select! {
                next = lines.next() => next,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush().await;
                    continue;
                }
            };
            match next {
                Some(Ok(line)) => {
                    self.push(line);
                    if self.batch.len() >= self.max_records_per_file {
                        self.flush().await;
                    }
                }
                Some(Err(e)) => {
                    warn!(table = %self.table, error = %e, "ingestion body failed");
                    break;
                }
                None => break,
            }
        }
        self.flush().await;

        info!(
            table = %self.table,
            accepted = self.summary.accepted,
            persisted = self.summary.persisted,
            dropped = self.summary.dropped,
            files = self.summary.files,
            "ingestion complete"
        );
        self.summary
    }

    fn deadline(&self) -> Option<Instant> {
        Some(self.batch.opened? + self.commit_window?)
    }

    fn push(&mut self, line: Bytes) {
        let Ok(text) = std::str::from_utf8(&line) else {
            self.summary.dropped += 1;
            return;
        };
        if text.trim().is_empty() {
            return;
        }

        let mode = *self.mode.get_or_insert_with(|| Mode::detect(text));
        let before = self.batch.len();
        match mode {
            Mode::Raw => {
                self.batch.lines.push(line);
                self.summary.accepted += 1;
            }
            Mode::Json => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(record)) => {
                    self.push_record(record);
                }
                Ok(Value::Array(items)) => {
                    for item in items {
                        if let Value::Object(record) = item {
                            self.push_record(record);
                        } else {
                            self.summary.dropped += 1;
                        }
                    }
                }
                Ok(_) | Err(_) => {
                    debug!(table = %self.table, "dropping line that is not a JSON record");
                    self.summary.dropped += 1;
                }
            },
        }
        if before == 0 && !self.batch.is_empty() {
            self.batch.opened = Some(Instant::now());
        }
    }

    fn push_record(&mut self, record: Map<String, Value>) {
        if self.schema.is_none() {
            let schema = infer_schema(&record);
            if !schema.fields().is_empty() {
                debug!(table = %self.table, columns = schema.fields().len(), "inferred schema");
                self.schema = Some(Arc::new(schema));
            }
        }
        self.batch.records.push(record);
        self.summary.accepted += 1;
    }

    /// Commit the open batch, if any. A failure loses this batch only.
    async fn flush(&mut self) {
        let batch = std::mem::take(&mut self.batch);
        let records = batch.len();
        if records == 0 {
            return;
        }
        match self.commit(&batch).await {
            Ok((datastore, location)) => {
                info!(table = %self.table, %datastore, location = %*location, records, "committed batch");
                self.summary.persisted += records;
                self.summary.files += 1;
            }
            Err(e) => {
                warn!(table = %self.table, records, error = %e, "dropping batch");
                self.summary.dropped += records;
            }
        }
    }

    async fn commit(&self, batch: &Batch) -> Result<(String, ObjectFilePath), FlushError> {
        let mode = self.mode.unwrap_or(Mode::Raw);
        let body = match mode {
            Mode::Raw => to_text(&batch.lines)?,
            Mode::Json => {
                let schema = self.schema.as_ref().ok_or(SerializeError::NoColumns)?;
                to_parquet(Arc::clone(schema), &batch.records)?
            }
        };

        let (name, info) = self
            .datastores
            .choose(&mut rand::thread_rng())
            .ok_or(FlushError::NoDatastore)?;
        let store = self.provider.object_store(name, info)?;
        let location = ObjectFilePath::new(
            &info.prefix,
            &self.table,
            mode.format(),
            Utc::now(),
            Uuid::new_v4(),
        );
        store.put(&location, PutPayload::from(body)).await?;
        Ok((name.clone(), location))
    }
}
