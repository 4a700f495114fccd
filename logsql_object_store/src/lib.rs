//! Object storage plumbing shared by the search and ingestion paths: how a
//! configured datastore becomes an [`ObjectStore`] client, where a table's
//! objects live inside it, and how object bodies are framed into lines.
//!
//! [`ObjectStore`]: object_store::ObjectStore

pub mod lines;
pub mod paths;
pub mod provider;

pub use lines::{LineSplitter, into_lines};
pub use paths::{ObjectFilePath, ObjectFormat, TableDirPath};
pub use provider::{DatastoreConnector, Error, ObjectStoreProvider};
