//! The query language: planning a restricted `SELECT` over one table and
//! evaluating the plan against individual log records.
//!
//! Statements may reference *entities*, fields extracted from unstructured
//! text at read time: `$3` is the third whitespace delimited field of a line,
//! `$ip2` the second IPv4 address in it, `$user_agent.os` the operating
//! system named by its user agent. See [`entity`] for the full catalogue.
//!
//! ```text
//! SELECT $ip, $user_agent.name FROM weblog WHERE $3 >= 500 LIMIT 10
//! ```

use thiserror::Error;

pub mod entity;
pub mod evaluate;
pub mod front_end;
mod lexer;
pub mod predicate;
pub mod scanner;

pub use entity::{Entity, EntityKind, EntityType, Matcher, UserAgentField};
pub use evaluate::{OutputFormat, RecordEvaluator, SourceRecord};
pub use front_end::{Column, Projection, QueryPlan, SOURCE_NAME, extract_table, plan};
pub use lexer::split_statements;
pub use predicate::{Operand, Predicate};
pub use scanner::{EntityMatches, EntityScanner, RegexScanner};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid table name '{0}'")]
    InvalidTableName(String),

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("failed to build entity matcher: {0}")]
    Matcher(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Plan every statement of a request body, in order.
pub fn plan_all(text: &str) -> Result<Vec<QueryPlan>> {
    split_statements(text)?.into_iter().map(plan).collect()
}
