//! cxxref: C/C++ symbol indexing over SQLite
//!
//! cxxref parses C and C++ translation units with Tree-sitter, records
//! every symbol occurrence (declarations, definitions and uses) keyed by a
//! clang-style USR in `<root>/indexer.db`, and answers go-to-definition and
//! find-all-references queries for a source position.
//!
//! # Architecture
//!
//! - **Parser**: Builds a cursor tree per translation unit, with includes expanded
//! - **Indexer**: Walks units and writes symbols; fans a directory out over workers
//! - **Store**: SQLite database of `(filename, usr, line, column, type)` rows
//! - **Query Engine**: Resolves a position to a USR and looks it up
//! - **Dispatcher**: Numeric op codes in, callback results out
//!
//! # Example Usage
//!
//! ```no_run
//! use cxxref::{CppParser, IndexConfig, Indexer, QueryEngine};
//!
//! let indexer = Indexer::new(CppParser::new(), IndexConfig::default());
//! let report = indexer.index_directory("/src/project", "-Iinclude").unwrap();
//! println!("Recorded {} symbols", report.symbols_inserted);
//!
//! let engine = QueryEngine::new(CppParser::new(), "/src/project", "-Iinclude");
//! for reference in engine.find_all_references("/src/project/main.cpp", 12, 9).unwrap() {
//!     println!("{}:{}:{}", reference.filename, reference.line, reference.column);
//! }
//! ```

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod indexer;
pub mod models;
pub mod output;
pub mod parser;
pub mod query;
pub mod store;

// Re-export commonly used types
pub use config::IndexConfig;
pub use dispatcher::{Dispatcher, OpCode, OperationResult};
pub use error::{IndexerError, Result};
pub use indexer::{Indexer, WorkerStrategy};
pub use models::{IndexReport, SourceLocation, SymbolKind, SymbolRecord};
pub use parser::{CompilerArgs, CppParser, SourceParser};
pub use query::QueryEngine;
pub use store::SymbolStore;
