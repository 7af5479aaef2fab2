//! Op-code dispatcher
//!
//! The engine's outer boundary: a closed set of numeric operations whose
//! arguments arrive as strings, and one completion callback that receives
//! every result. Unknown codes are logged and ignored.
//!
//! | code | operation | arguments |
//! |------|-----------|-----------|
//! | 0x0  | index one file | project_root, contents_path, original_path, compiler_args |
//! | 0x1  | index a directory | project_root, compiler_args |
//! | 0x2  | drop one file's symbols | project_root, filename |
//! | 0x3  | drop all symbols | project_root |
//! | 0x10 | go to definition | file, line, column |
//! | 0x11 | find all references | file, line, column |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum::Display;

use crate::config::IndexConfig;
use crate::error::{IndexerError, Result};
use crate::indexer::{Indexer, WorkerStrategy};
use crate::models::{IndexReport, SourceLocation, SymbolRecord};
use crate::parser::SourceParser;
use crate::query::QueryEngine;
use crate::store::SymbolStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OpCode {
    IndexSingleFile = 0x0,
    IndexDirectory = 0x1,
    DropSingleFile = 0x2,
    DropAll = 0x3,
    GoToDefinition = 0x10,
    FindAllReferences = 0x11,
}

impl OpCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for OpCode {
    type Error = u32;

    fn try_from(code: u32) -> std::result::Result<Self, Self::Error> {
        match code {
            0x0 => Ok(OpCode::IndexSingleFile),
            0x1 => Ok(OpCode::IndexDirectory),
            0x2 => Ok(OpCode::DropSingleFile),
            0x3 => Ok(OpCode::DropAll),
            0x10 => Ok(OpCode::GoToDefinition),
            0x11 => Ok(OpCode::FindAllReferences),
            other => Err(other),
        }
    }
}

/// What an operation hands to the completion callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationResult {
    Indexed(IndexReport),
    Dropped { rows: usize },
    Definition { location: Option<SourceLocation> },
    References { references: Vec<SymbolRecord> },
    Failed { error: String },
}

/// Project root and compiler arguments of the last index operation
#[derive(Debug, Clone, Default)]
struct Session {
    project_root: Option<PathBuf>,
    compiler_args: String,
}

/// Routes op codes to the indexer, the store and the query engine
pub struct Dispatcher<P, F>
where
    P: SourceParser + Clone,
    F: FnMut(OpCode, OperationResult),
{
    parser: P,
    config: IndexConfig,
    strategy: WorkerStrategy,
    session: Session,
    callback: F,
}

impl<P, F> Dispatcher<P, F>
where
    P: SourceParser + Clone,
    F: FnMut(OpCode, OperationResult),
{
    /// Create a dispatcher whose directory indexing runs on threads
    ///
    /// Long-lived hosts should pass [`WorkerStrategy::Processes`] through
    /// [`Dispatcher::with_strategy`] so parser memory is returned to the OS
    /// after every slice; the `cxxref` binary does this with its own `worker`
    /// subcommand.
    pub fn new(parser: P, config: IndexConfig, callback: F) -> Self {
        Self {
            parser,
            config,
            strategy: WorkerStrategy::Threads,
            session: Session::default(),
            callback,
        }
    }

    pub fn with_strategy(mut self, strategy: WorkerStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Point queries at `project_root` without indexing it first
    pub fn open_session(&mut self, project_root: impl Into<PathBuf>, compiler_args: &str) {
        self.session = Session {
            project_root: Some(project_root.into()),
            compiler_args: compiler_args.to_string(),
        };
    }

    pub fn session_root(&self) -> Option<&Path> {
        self.session.project_root.as_deref()
    }

    /// Run operation `code` and report its result through the callback
    ///
    /// Unknown codes produce no callback at all.
    pub fn dispatch<S: AsRef<str>>(&mut self, code: u32, args: &[S]) {
        let op = match OpCode::try_from(code) {
            Ok(op) => op,
            Err(code) => {
                log::error!("Unknown operation 0x{:x}, ignoring", code);
                return;
            }
        };

        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        log::debug!("Dispatching {} with {:?}", op, args);

        let result = self.execute(op, &args).unwrap_or_else(|e| {
            log::error!("Operation {} failed: {}", op, e);
            OperationResult::Failed {
                error: e.to_string(),
            }
        });

        (self.callback)(op, result);
    }

    fn execute(&mut self, op: OpCode, args: &[&str]) -> Result<OperationResult> {
        match op {
            OpCode::IndexSingleFile => {
                let [root, contents_path, original_path, compiler_args] = expect_args(op, args)?;
                self.open_session(root, compiler_args);
                let report =
                    self.indexer()
                        .index_file(root, contents_path, original_path, compiler_args)?;
                Ok(OperationResult::Indexed(report))
            }
            OpCode::IndexDirectory => {
                let [root, compiler_args] = expect_args(op, args)?;
                self.open_session(root, compiler_args);
                let report = self.indexer().index_directory(root, compiler_args)?;
                Ok(OperationResult::Indexed(report))
            }
            OpCode::DropSingleFile => {
                let [root, filename] = expect_args(op, args)?;
                let rows = self.open_store(root)?.drop_file(filename)?;
                Ok(OperationResult::Dropped { rows })
            }
            OpCode::DropAll => {
                let [root] = expect_args(op, args)?;
                let rows = self.open_store(root)?.drop_all()?;
                Ok(OperationResult::Dropped { rows })
            }
            OpCode::GoToDefinition => {
                let (file, line, column) = position_args(op, args)?;
                let location = self
                    .query_engine(op, file)?
                    .go_to_definition(file, line, column)?;
                Ok(OperationResult::Definition { location })
            }
            OpCode::FindAllReferences => {
                let (file, line, column) = position_args(op, args)?;
                let references = self
                    .query_engine(op, file)?
                    .find_all_references(file, line, column)?;
                Ok(OperationResult::References { references })
            }
        }
    }

    fn indexer(&self) -> Indexer<P> {
        Indexer::new(self.parser.clone(), self.config.clone()).with_strategy(self.strategy.clone())
    }

    fn open_store(&self, root: &str) -> Result<SymbolStore> {
        SymbolStore::open_existing(SymbolStore::store_path(root), self.config.busy_timeout())
    }

    /// Query engine for the session's project
    ///
    /// Go-to-definition reads no store, so without a session it parses
    /// `file` relative to its own directory with no compiler arguments.
    fn query_engine(&self, op: OpCode, file: &str) -> Result<QueryEngine<P>> {
        let (root, compiler_args) = match &self.session.project_root {
            Some(root) => (root.clone(), self.session.compiler_args.as_str()),
            None if op == OpCode::GoToDefinition => {
                let dir = Path::new(file).parent().map(Path::to_path_buf).unwrap_or_default();
                (dir, "")
            }
            None => {
                return Err(IndexerError::InvalidArguments {
                    op: op.to_string(),
                    reason: "no project root in this session, index a project first".to_string(),
                });
            }
        };

        Ok(QueryEngine::new(self.parser.clone(), root, compiler_args)
            .with_busy_timeout(self.config.busy_timeout()))
    }
}

fn expect_args<'a, const N: usize>(op: OpCode, args: &[&'a str]) -> Result<[&'a str; N]> {
    <[&str; N]>::try_from(args).map_err(|_| IndexerError::InvalidArguments {
        op: op.to_string(),
        reason: format!("expected {} arguments, got {}", N, args.len()),
    })
}

fn position_args<'a>(op: OpCode, args: &[&'a str]) -> Result<(&'a str, u32, u32)> {
    let [file, line, column] = expect_args(op, args)?;
    let number = |name: &str, value: &str| {
        value
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| IndexerError::InvalidArguments {
                op: op.to_string(),
                reason: format!("{} must be a positive integer, got {:?}", name, value),
            })
    };
    Ok((file, number("line", line)?, number("column", column)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SymbolKind;
    use crate::parser::CppParser;
    use tempfile::TempDir;

    const A_CPP: &str = "int foo() { return 1; } int main() { return foo(); }";

    fn project() -> (TempDir, String, String) {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.cpp");
        std::fs::write(&file, A_CPP).unwrap();
        let root = temp.path().to_string_lossy().to_string();
        let file = file.to_string_lossy().to_string();
        (temp, root, file)
    }

    fn run(ops: &[(u32, Vec<&str>)]) -> Vec<(OpCode, OperationResult)> {
        let mut results = Vec::new();
        {
            let mut dispatcher =
                Dispatcher::new(CppParser::new(), IndexConfig::default(), |op, result| {
                    results.push((op, result))
                });
            for (code, args) in ops {
                dispatcher.dispatch(*code, args);
            }
        }
        results
    }

    #[test]
    fn test_op_codes() {
        assert_eq!(OpCode::try_from(0x0), Ok(OpCode::IndexSingleFile));
        assert_eq!(OpCode::try_from(0x11), Ok(OpCode::FindAllReferences));
        assert_eq!(OpCode::try_from(0x4), Err(0x4));
        assert_eq!(OpCode::GoToDefinition.code(), 0x10);
        assert_eq!(OpCode::DropAll.to_string(), "drop_all");
    }

    #[test]
    fn test_index_then_query() {
        let (_temp, root, file) = project();
        let results = run(&[
            (0x1, vec![root.as_str(), ""]),
            (0x11, vec![file.as_str(), "1", "45"]),
            (0x10, vec![file.as_str(), "1", "45"]),
        ]);

        assert_eq!(results.len(), 3);
        match &results[0] {
            (OpCode::IndexDirectory, OperationResult::Indexed(report)) => {
                assert_eq!(report.files_indexed, 1);
                assert_eq!(report.symbols_inserted, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &results[1] {
            (OpCode::FindAllReferences, OperationResult::References { references }) => {
                assert_eq!(references.len(), 2);
                assert!(references
                    .iter()
                    .all(|r| r.usr == "c:@F@foo#" && r.kind == SymbolKind::Function));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            results[2],
            (
                OpCode::GoToDefinition,
                OperationResult::Definition {
                    location: Some(SourceLocation::new(&file, 1, 5))
                }
            )
        );
    }

    #[test]
    fn test_index_single_file_opens_session() {
        let (temp, root, file) = project();
        Indexer::new(CppParser::new(), IndexConfig::default())
            .index_directory(temp.path(), "")
            .unwrap();

        let results = run(&[
            (0x0, vec![root.as_str(), file.as_str(), file.as_str(), "-std=c++17"]),
            (0x11, vec![file.as_str(), "1", "5"]),
        ]);

        assert!(matches!(&results[0].1, OperationResult::Indexed(r) if r.files_indexed == 1));
        assert!(matches!(
            &results[1].1,
            OperationResult::References { references } if references.len() == 2
        ));
    }

    #[test]
    fn test_single_file_before_directory_index() {
        let (temp, root, file) = project();
        let b = temp.path().join("b.cpp");
        std::fs::write(&b, "int foo();\nint bar() { return foo(); }\n").unwrap();

        let results = run(&[
            (0x0, vec![root.as_str(), file.as_str(), file.as_str(), ""]),
            (0x1, vec![root.as_str(), ""]),
        ]);

        match &results[0].1 {
            OperationResult::Failed { error } => assert!(error.contains("no index found")),
            other => panic!("unexpected {:?}", other),
        }
        match &results[1].1 {
            OperationResult::Indexed(report) => {
                assert!(!report.skipped);
                assert_eq!(report.files_indexed, 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        let store =
            SymbolStore::open_existing(SymbolStore::store_path(temp.path()), Default::default())
                .unwrap();
        assert_eq!(store.symbols_in_file(&b.to_string_lossy()).unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_code_is_silent() {
        let (temp, root, _file) = project();
        let results = run(&[(0x7, vec![root.as_str(), ""]), (0x12, vec![])]);
        assert!(results.is_empty());
        assert!(!SymbolStore::exists(temp.path()));
    }

    #[test]
    fn test_malformed_arguments() {
        let (_temp, root, file) = project();
        let results = run(&[
            (0x1, vec![root.as_str()]),
            (0x1, vec![root.as_str(), ""]),
            (0x10, vec![file.as_str(), "one", "5"]),
            (0x11, vec![file.as_str(), "1", "0"]),
            (0x11, vec![file.as_str(), "1"]),
        ]);

        assert_eq!(results.len(), 5);
        assert!(matches!(results[0].1, OperationResult::Failed { .. }));
        assert!(matches!(results[1].1, OperationResult::Indexed(_)));
        assert!(results[2..].iter().all(|(_, r)| matches!(r, OperationResult::Failed { .. })));
    }

    #[test]
    fn test_references_without_session_fail() {
        let (_temp, _root, file) = project();
        let results = run(&[(0x11, vec![file.as_str(), "1", "45"])]);
        match &results[0].1 {
            OperationResult::Failed { error } => assert!(error.contains("no project root")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_definition_without_session() {
        let (temp, _root, file) = project();
        let results = run(&[(0x10, vec![file.as_str(), "1", "45"])]);

        assert_eq!(
            results[0].1,
            OperationResult::Definition {
                location: Some(SourceLocation::new(&file, 1, 5))
            }
        );
        assert!(!SymbolStore::exists(temp.path()));
    }

    #[test]
    fn test_store_init_failure_reaches_callback() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("does").join("not").join("exist");
        let root = root.to_string_lossy().to_string();

        let results = run(&[(0x1, vec![root.as_str(), ""])]);
        match &results[0].1 {
            OperationResult::Failed { error } => {
                assert!(error.contains("failed to initialize symbol store"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_drop_operations() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.cpp"), A_CPP).unwrap();
        std::fs::write(
            temp.path().join("b.cpp"),
            "int foo();\nint bar() { return foo(); }\n",
        )
        .unwrap();
        let root = temp.path().to_string_lossy().to_string();
        let a = temp.path().join("a.cpp").to_string_lossy().to_string();

        let results = run(&[
            (0x1, vec![root.as_str(), ""]),
            (0x2, vec![root.as_str(), a.as_str()]),
            (0x11, vec![a.as_str(), "1", "45"]),
            (0x3, vec![root.as_str()]),
            (0x11, vec![a.as_str(), "1", "45"]),
        ]);

        assert_eq!(results[1].1, OperationResult::Dropped { rows: 3 });
        // b.cpp still declares and calls foo
        assert!(matches!(
            &results[2].1,
            OperationResult::References { references } if references.len() == 2
        ));
        assert_eq!(results[3].1, OperationResult::Dropped { rows: 3 });
        assert!(matches!(
            &results[4].1,
            OperationResult::References { references } if references.is_empty()
        ));
    }

    #[test]
    fn test_drop_without_store() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_string_lossy().to_string();
        let results = run(&[(0x3, vec![root.as_str()])]);
        assert!(matches!(results[0].1, OperationResult::Failed { .. }));
        assert!(!SymbolStore::exists(temp.path()));
    }

    #[test]
    fn test_result_serialization() {
        let json = serde_json::to_value(OperationResult::Dropped { rows: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "dropped", "rows": 2 }));
    }
}
