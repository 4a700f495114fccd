//! Encoding a batch of records as one object body.

use std::sync::Arc;

use arrow_json::ReaderBuilder;
use arrow_schema::{ArrowError, SchemaRef};
use bytes::Bytes;
use parquet::{
    arrow::ArrowWriter,
    basic::{Compression, ZstdLevel},
    errors::ParquetError,
    file::properties::WriterProperties,
};
use serde_json::{Map, Value};
use thiserror::Error;

/// Rows decoded into one record batch at a time.
pub const DECODE_BATCH_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("no records to serialize")]
    NoRecords,

    #[error("no record has a field with a storable value")]
    NoColumns,

    #[error(transparent)]
    Arrow(#[from] ArrowError),

    #[error("failed to build parquet file: {0}")]
    Parquet(#[from] ParquetError),
}

fn writer_props() -> Result<WriterProperties, ParquetError> {
    Ok(WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(3)?))
        .build())
}

/// Encode `records` as a parquet file with `schema`.
///
/// Fields absent from the schema are ignored; a value that doesn't fit its
/// column fails the whole batch.
pub fn to_parquet(schema: SchemaRef, records: &[Map<String, Value>]) -> Result<Bytes, SerializeError> {
    if records.is_empty() {
        return Err(SerializeError::NoRecords);
    }
    if schema.fields().is_empty() {
        return Err(SerializeError::NoColumns);
    }

    let mut decoder = ReaderBuilder::new(Arc::clone(&schema))
        .with_batch_size(DECODE_BATCH_SIZE)
        .build_decoder()?;
    let mut writer = ArrowWriter::try_new(Vec::new(), schema, Some(writer_props()?))?;
    for chunk in records.chunks(DECODE_BATCH_SIZE) {
        decoder.serialize(chunk)?;
        if let Some(batch) = decoder.flush()? {
            writer.write(&batch)?;
        }
    }
    Ok(Bytes::from(writer.into_inner()?))
}

/// Join raw lines into a newline terminated text body.
pub fn to_text(lines: &[Bytes]) -> Result<Bytes, SerializeError> {
    if lines.is_empty() {
        return Err(SerializeError::NoRecords);
    }
    let len = lines.iter().map(|l| l.len() + 1).sum();
    let mut body = Vec::with_capacity(len);
    for line in lines {
        body.extend_from_slice(line);
        body.push(b'\n');
    }
    Ok(Bytes::from(body))
}
