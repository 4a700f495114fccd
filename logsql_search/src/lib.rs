//! Searching the objects of a table.
//!
//! A request is planned by `logsql_query`, bound to the table's datastores
//! by the [`resolver`] and then fanned out by the [`executor`] over every
//! object of the table, each object being searched by a [`RecordSelector`].

pub mod executor;
pub mod resolver;
pub mod selector;

pub use executor::{Executor, PrepareError, SearchError, SearchStatement, SearchStream};
pub use resolver::{ResolveError, ResolvedDatastore, resolve, resolve_shuffled};
pub use selector::{ObjectCandidate, RecordSelector, SelectError, StreamingSelector};

use logsql_config::Config;
use logsql_query::OutputFormat;

/// Plan every statement of `text` and bind each to its datastores.
///
/// Fails as a whole if any statement is invalid or names an unknown table,
/// so nothing is searched for a partly valid request.
pub fn prepare_all(
    config: &Config,
    text: &str,
    format: OutputFormat,
) -> Result<Vec<SearchStatement>, PrepareError> {
    logsql_query::plan_all(text)?
        .into_iter()
        .map(|plan| SearchStatement::prepare(config, plan, format))
        .collect()
}
