//! Selecting the matching records of a single object.
//!
//! Object storage offers no query pushdown here, so the object is streamed
//! and each record is run through the statement's [`RecordEvaluator`] as it
//! is decoded.

use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_json::LineDelimitedWriter;
use arrow_schema::ArrowError;
use bytes::Bytes;
use futures::{StreamExt, TryFutureExt, TryStreamExt, future, stream, stream::BoxStream};
use logsql_object_store::into_lines;
use logsql_query::{RecordEvaluator, SourceRecord};
use object_store::{ObjectMeta, ObjectStore, path::Path as ObjPath};
use parquet::{
    arrow::{ParquetRecordBatchStreamBuilder, async_reader::ParquetObjectReader},
    errors::ParquetError,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("failed to read parquet: {0}")]
    Parquet(#[from] ParquetError),

    #[error("failed to convert record batch: {0}")]
    Arrow(#[from] ArrowError),

    #[error("decoded record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One object to search, produced by listing and consumed by one worker.
#[derive(Debug, Clone)]
pub struct ObjectCandidate {
    /// Name of the datastore holding the object.
    pub datastore: Arc<str>,
    pub store: Arc<dyn ObjectStore>,
    pub location: ObjPath,
    pub size: usize,
}

impl ObjectCandidate {
    /// Metadata for ranged reads. Only location and size are known from
    /// listing.
    fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            location: self.location.clone(),
            last_modified: Default::default(),
            size: self.size,
            e_tag: None,
            version: None,
        }
    }
}

/// Runs a statement against a single object.
pub trait RecordSelector: std::fmt::Debug + Send + Sync + 'static {
    /// Every rendered record of `candidate` passing the statement, in
    /// object order. An error ends the stream.
    fn select(
        &self,
        candidate: &ObjectCandidate,
        evaluator: Arc<RecordEvaluator>,
    ) -> BoxStream<'static, Result<String, SelectError>>;
}

/// Decodes objects by suffix: `.parquet` holds JSON records as columns,
/// `.json` and `.ndjson` hold one JSON object per line, anything else is
/// raw text lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingSelector;

impl RecordSelector for StreamingSelector {
    fn select(
        &self,
        candidate: &ObjectCandidate,
        evaluator: Arc<RecordEvaluator>,
    ) -> BoxStream<'static, Result<String, SelectError>> {
        let line_format: Option<LineEvaluator> = match candidate.location.extension() {
            Some("parquet") => None,
            Some("json" | "ndjson") => Some(evaluate_json_line),
            _ => Some(evaluate_text_line),
        };
        let store = Arc::clone(&candidate.store);
        match line_format {
            None => select_parquet(store, candidate.meta(), evaluator),
            Some(evaluate) => {
                select_lines(store, candidate.location.clone(), evaluator, evaluate)
            }
        }
    }
}

type LineEvaluator = fn(&RecordEvaluator, &[u8]) -> Option<String>;

fn evaluate_text_line(evaluator: &RecordEvaluator, line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    evaluator.evaluate(SourceRecord::Text(&line))
}

fn evaluate_json_line(evaluator: &RecordEvaluator, line: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<Map<String, Value>>(text) {
        Ok(fields) => evaluator.evaluate(SourceRecord::Json {
            text,
            fields: &fields,
        }),
        Err(e) => {
            debug!(error = %e, "skipping line that is not a JSON object");
            None
        }
    }
}

fn select_lines(
    store: Arc<dyn ObjectStore>,
    location: ObjPath,
    evaluator: Arc<RecordEvaluator>,
    evaluate: LineEvaluator,
) -> BoxStream<'static, Result<String, SelectError>> {
    async move {
        let body = store.get(&location).await?.into_stream();
        let records = into_lines(body)
            .map_err(SelectError::from)
            .try_filter_map(move |line: Bytes| future::ready(Ok(evaluate(&evaluator, &line))));
        Ok::<_, SelectError>(records)
    }
    .try_flatten_stream()
    .boxed()
}

/// Row groups are fetched with ranged reads and decoded one batch at a
/// time, so a large object never sits in memory whole.
fn select_parquet(
    store: Arc<dyn ObjectStore>,
    meta: ObjectMeta,
    evaluator: Arc<RecordEvaluator>,
) -> BoxStream<'static, Result<String, SelectError>> {
    async move {
        let reader = ParquetObjectReader::new(store, meta);
        let batches = ParquetRecordBatchStreamBuilder::new(reader).await?.build()?;
        let records = batches
            .map_err(SelectError::from)
            .and_then(move |batch| future::ready(select_batch(&batch, &evaluator)))
            .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, SelectError>)))
            .try_flatten();
        Ok::<_, SelectError>(records)
    }
    .try_flatten_stream()
    .boxed()
}

/// The passing records of one decoded batch, in row order.
fn select_batch(
    batch: &RecordBatch,
    evaluator: &RecordEvaluator,
) -> Result<Vec<String>, SelectError> {
    let mut writer = LineDelimitedWriter::new(Vec::new());
    writer.write(batch)?;
    writer.finish()?;
    let encoded = writer.into_inner();

    let mut records = Vec::new();
    for line in encoded.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
        let fields: Map<String, Value> = serde_json::from_slice(line)?;
        let text = String::from_utf8_lossy(line);
        if let Some(record) = evaluator.evaluate(SourceRecord::Json {
            text: &text,
            fields: &fields,
        }) {
            records.push(record);
        }
    }
    Ok(records)
}
