//! Core data models for cxxref
//!
//! These structures are what the store persists and what the query engine
//! and dispatcher hand back to callers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{Display, EnumIter, EnumString};

use crate::parser::AstNodeId;

/// Storage bucket a classified AST node collapses to
///
/// The finer distinctions the parser can see (class vs struct, local vs
/// field, ...) are not kept; every classified node lands in exactly one of
/// these four buckets. The discriminants are the `symbol_type` catalog ids.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SymbolKind {
    Function = 1,
    Variable = 2,
    UserDefinedType = 3,
    Macro = 4,
}

impl SymbolKind {
    /// Catalog id stored in `symbol.type`
    pub fn id(self) -> i64 {
        self as i64
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(SymbolKind::Function),
            2 => Some(SymbolKind::Variable),
            3 => Some(SymbolKind::UserDefinedType),
            4 => Some(SymbolKind::Macro),
            _ => None,
        }
    }

    /// Collapse a parser node classification into its storage bucket
    ///
    /// Returns `None` for nodes that are never recorded (namespaces, the
    /// translation unit itself, unresolved or unexposed nodes).
    pub fn from_node_id(id: AstNodeId) -> Option<Self> {
        match id {
            AstNodeId::Function | AstNodeId::Method => Some(SymbolKind::Function),
            AstNodeId::Class
            | AstNodeId::Struct
            | AstNodeId::Enum
            | AstNodeId::EnumValue
            | AstNodeId::Union
            | AstNodeId::Typedef => Some(SymbolKind::UserDefinedType),
            AstNodeId::LocalVariable | AstNodeId::FunctionParameter | AstNodeId::Field => {
                Some(SymbolKind::Variable)
            }
            AstNodeId::MacroDefinition | AstNodeId::MacroInstantiation => Some(SymbolKind::Macro),
            AstNodeId::Namespace | AstNodeId::TranslationUnit | AstNodeId::Unexposed => None,
        }
    }
}

/// Source language a unit is parsed as
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
}

impl Language {
    /// `.c` files are C; every other source or header extension is parsed as C++
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "c" => Language::C,
            _ => Language::Cpp,
        }
    }

    pub fn from_path(path: &std::path::Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Language::from_extension)
            .unwrap_or(Language::Cpp)
    }
}

/// One symbol occurrence as persisted in the `symbol` table
///
/// `(filename, usr, line, column)` is the primary key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SymbolRecord {
    /// Translation unit the occurrence was found in
    pub filename: String,
    /// Identity of the declaration (the referenced one for use sites)
    pub usr: String,
    /// 1-indexed line
    pub line: u32,
    /// 1-indexed column
    pub column: u32,
    pub kind: SymbolKind,
}

impl SymbolRecord {
    pub fn new(
        filename: impl Into<String>,
        usr: impl Into<String>,
        line: u32,
        column: u32,
        kind: SymbolKind,
    ) -> Self {
        Self {
            filename: filename.into(),
            usr: usr.into(),
            line,
            column,
            kind,
        }
    }
}

/// A position inside a source file (1-indexed line and column)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// Outcome of one worker's slice
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerReport {
    pub files_indexed: usize,
    pub files_failed: usize,
    pub symbols_inserted: usize,
    pub elapsed_ms: u64,
}

impl WorkerReport {
    /// Report for a slice whose worker died before reporting anything
    pub fn failed_slice(files: usize) -> Self {
        Self {
            files_failed: files,
            ..Default::default()
        }
    }
}

/// Aggregated outcome of a directory (or single file) index request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexReport {
    pub root: PathBuf,
    /// True when the store already existed and no work was done
    pub skipped: bool,
    pub files_discovered: usize,
    pub files_indexed: usize,
    pub files_failed: usize,
    pub symbols_inserted: usize,
    pub workers: usize,
    pub elapsed_ms: u64,
}

impl IndexReport {
    pub fn skipped(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skipped: true,
            ..Default::default()
        }
    }

    pub fn absorb(&mut self, worker: &WorkerReport) {
        self.files_indexed += worker.files_indexed;
        self.files_failed += worker.files_failed;
        self.symbols_inserted += worker.symbols_inserted;
    }
}
