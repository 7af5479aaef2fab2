//! Error taxonomy for the indexing and query engine
//!
//! Only failures that prevent an operation from making progress surface as
//! errors. Per-file problems (a unit that fails to parse, a duplicate symbol
//! row) are absorbed and logged where they happen.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    /// The store could not be created or opened (unwritable path, not a database)
    #[error("failed to initialize symbol store at {path}: {source}")]
    StoreInit {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("symbol store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A query was issued against a project root that has never been indexed
    #[error("no index found at {0} - index the project first")]
    NotIndexed(PathBuf),

    #[error("invalid arguments for operation {op}: {reason}")]
    InvalidArguments { op: String, reason: String },

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("failed to load configuration from {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IndexerError>;
