//! Storing log records as objects.
//!
//! A request body is framed into lines. If its first line is a JSON object
//! (or an array of them) every line is parsed as a record, batches are
//! given a schema inferred from their first record and committed as
//! parquet. Otherwise lines are committed as text. Each committed object
//! goes to one datastore of the table, picked at random.

pub mod ingester;
pub mod schema;
pub mod serialize;

pub use ingester::{DEFAULT_MAX_RECORDS_PER_FILE, Error, IngestSession, IngestSummary, Ingester};
pub use schema::infer_schema;
