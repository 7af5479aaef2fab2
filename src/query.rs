//! Query engine for go-to-definition and find-all-references
//!
//! Both queries re-parse the file they are asked about, so positions are
//! resolved against its current contents. Definitions come straight from the
//! parsed unit; references come from the store.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::models::{SourceLocation, SymbolKind, SymbolRecord};
use crate::parser::{CompilerArgs, SourceParser, TranslationUnit};
use crate::store::{SymbolStore, DEFAULT_BUSY_TIMEOUT};

/// Lookup family a reference query falls into
///
/// All four families run the same identity lookup today. Kept apart so a
/// family can grow its own strategy (e.g. overrides for callables) without
/// touching the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceCategory {
    Callable,
    UserType,
    Variable,
    Macro,
}

impl From<SymbolKind> for ReferenceCategory {
    fn from(kind: SymbolKind) -> Self {
        match kind {
            SymbolKind::Function => ReferenceCategory::Callable,
            SymbolKind::UserDefinedType => ReferenceCategory::UserType,
            SymbolKind::Variable => ReferenceCategory::Variable,
            SymbolKind::Macro => ReferenceCategory::Macro,
        }
    }
}

/// Answers position-based queries for one project
pub struct QueryEngine<P: SourceParser> {
    parser: P,
    root: PathBuf,
    compiler_args: CompilerArgs,
    busy_timeout: Duration,
}

impl<P: SourceParser> QueryEngine<P> {
    pub fn new(parser: P, root: impl Into<PathBuf>, compiler_args: &str) -> Self {
        Self {
            parser,
            root: root.into(),
            compiler_args: CompilerArgs::parse(compiler_args),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn parse(&self, file: &Path) -> Option<TranslationUnit> {
        match self.parser.parse(file, file, &self.compiler_args, &self.root) {
            Ok(unit) => Some(unit),
            Err(e) => {
                log::warn!("Failed to parse {}: {:#}", file.display(), e);
                None
            }
        }
    }

    /// Location of the definition of whatever sits at (line, column)
    ///
    /// `None` when the position holds no symbol or the definition is not
    /// visible from this unit.
    pub fn go_to_definition(
        &self,
        file: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Option<SourceLocation>> {
        let start = Instant::now();
        let file = file.as_ref();

        let location = self.parse(file).and_then(|unit| {
            unit.definition_at(line, column)
                .map(|definition| definition.location().clone())
        });

        match &location {
            Some(found) => log::info!(
                "Definition for {}:{}:{} is {} ({:?})",
                file.display(),
                line,
                column,
                found,
                start.elapsed()
            ),
            None => log::info!(
                "No definition found for {}:{}:{} ({:?})",
                file.display(),
                line,
                column,
                start.elapsed()
            ),
        }

        Ok(location)
    }

    /// Every recorded occurrence sharing the identity of the symbol at (line, column)
    pub fn find_all_references(
        &self,
        file: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<SymbolRecord>> {
        let start = Instant::now();
        let file = file.as_ref();
        let store =
            SymbolStore::open_existing(SymbolStore::store_path(&self.root), self.busy_timeout)?;

        let Some(unit) = self.parse(file) else {
            return Ok(Vec::new());
        };
        let Some(cursor) = unit.cursor_at(line, column) else {
            log::info!("No symbol at {}:{}:{}", file.display(), line, column);
            return Ok(Vec::new());
        };
        let Some(kind) = SymbolKind::from_node_id(cursor.kind()) else {
            log::debug!("{:?} is not a recorded kind", cursor);
            return Ok(Vec::new());
        };

        let usr = cursor.identity();
        if usr.is_empty() {
            return Ok(Vec::new());
        }

        let references = match ReferenceCategory::from(kind) {
            ReferenceCategory::Callable => store.query_by_identity(usr)?,
            ReferenceCategory::UserType => store.query_by_identity(usr)?,
            ReferenceCategory::Variable => store.query_by_identity(usr)?,
            ReferenceCategory::Macro => store.query_by_identity(usr)?,
        };

        log::info!(
            "Found {} references to {} in {:?}",
            references.len(),
            usr,
            start.elapsed()
        );
        Ok(references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::error::IndexerError;
    use crate::indexer::Indexer;
    use crate::parser::CppParser;
    use tempfile::TempDir;

    const A_CPP: &str = "int foo() { return 1; } int main() { return foo(); }";

    fn indexed_project(files: &[(&str, &str)]) -> TempDir {
        let temp = TempDir::new().unwrap();
        for (name, contents) in files {
            std::fs::write(temp.path().join(name), contents).unwrap();
        }
        Indexer::new(CppParser::new(), IndexConfig::default())
            .index_directory(temp.path(), "")
            .unwrap();
        temp
    }

    fn engine(temp: &TempDir) -> QueryEngine<CppParser> {
        QueryEngine::new(CppParser::new(), temp.path(), "")
    }

    fn positions(mut records: Vec<SymbolRecord>) -> Vec<(u32, u32)> {
        records.sort_by_key(|r| (r.filename.clone(), r.line, r.column));
        records.iter().map(|r| (r.line, r.column)).collect()
    }

    #[test]
    fn test_references_from_call_site_and_declaration() {
        let temp = indexed_project(&[("a.cpp", A_CPP)]);
        let file = temp.path().join("a.cpp");
        let engine = engine(&temp);

        let from_call = engine.find_all_references(&file, 1, 45).unwrap();
        assert_eq!(positions(from_call.clone()), vec![(1, 5), (1, 45)]);
        assert!(from_call.iter().all(|r| r.usr == "c:@F@foo#" && r.kind == SymbolKind::Function));

        let from_declaration = engine.find_all_references(&file, 1, 6).unwrap();
        assert_eq!(positions(from_declaration), vec![(1, 5), (1, 45)]);
    }

    #[test]
    fn test_go_to_definition() {
        let temp = indexed_project(&[("a.cpp", A_CPP)]);
        let file = temp.path().join("a.cpp");

        let location = engine(&temp).go_to_definition(&file, 1, 45).unwrap().unwrap();
        assert_eq!(location, SourceLocation::new(&file, 1, 5));
    }

    #[test]
    fn test_empty_results() {
        let temp = indexed_project(&[("a.cpp", A_CPP)]);
        let file = temp.path().join("a.cpp");
        let engine = engine(&temp);

        // whitespace and a keyword
        assert!(engine.find_all_references(&file, 1, 10).unwrap().is_empty());
        assert!(engine.find_all_references(&file, 1, 1).unwrap().is_empty());
        assert_eq!(engine.go_to_definition(&file, 1, 1).unwrap(), None);
        // past the end of the file
        assert!(engine.find_all_references(&file, 99, 1).unwrap().is_empty());
        // a file that does not parse
        let missing = temp.path().join("missing.cpp");
        assert!(engine.find_all_references(&missing, 1, 1).unwrap().is_empty());
        assert_eq!(engine.go_to_definition(&missing, 1, 1).unwrap(), None);
    }

    #[test]
    fn test_definition_in_other_unit_is_not_visible() {
        let temp = indexed_project(&[
            ("api.h", "int compute(int x);\n"),
            ("api.cpp", "#include \"api.h\"\nint compute(int x) { return x; }\n"),
            ("main.cpp", "#include \"api.h\"\nint main() { return compute(2); }\n"),
        ]);
        let engine = engine(&temp);
        let main = temp.path().join("main.cpp");

        assert_eq!(engine.go_to_definition(&main, 2, 21).unwrap(), None);

        let references = engine.find_all_references(&main, 2, 21).unwrap();
        let files: Vec<String> = references
            .iter()
            .map(|r| Path::new(&r.filename).file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(references.len(), 3);
        assert!(files.contains(&"api.h".to_string()));
        assert!(files.contains(&"api.cpp".to_string()));
        assert!(files.contains(&"main.cpp".to_string()));
    }

    #[test]
    fn test_categories() {
        let source = "#define SIZE 4\n\
                      struct Box { int width; };\n\
                      int area(Box b) { return b.width * SIZE; }\n";
        let temp = indexed_project(&[("box.cpp", source)]);
        let file = temp.path().join("box.cpp");
        let engine = engine(&temp);

        // macro use
        let size = engine.find_all_references(&file, 3, 36).unwrap();
        assert_eq!(positions(size.clone()), vec![(1, 9), (3, 36)]);
        assert!(size.iter().all(|r| r.kind == SymbolKind::Macro));

        // type use in the parameter list
        let boxes = engine.find_all_references(&file, 3, 10).unwrap();
        assert_eq!(positions(boxes), vec![(2, 8), (3, 10)]);

        // field through a member access
        let width = engine.find_all_references(&file, 3, 28).unwrap();
        assert_eq!(positions(width.clone()), vec![(2, 18), (3, 28)]);
        assert!(width.iter().all(|r| r.kind == SymbolKind::Variable));
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(ReferenceCategory::from(SymbolKind::Function), ReferenceCategory::Callable);
        assert_eq!(
            ReferenceCategory::from(SymbolKind::UserDefinedType),
            ReferenceCategory::UserType
        );
        assert_eq!(ReferenceCategory::from(SymbolKind::Variable), ReferenceCategory::Variable);
        assert_eq!(ReferenceCategory::from(SymbolKind::Macro), ReferenceCategory::Macro);
    }

    #[test]
    fn test_references_without_index() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.cpp"), A_CPP).unwrap();

        let err = engine(&temp)
            .find_all_references(temp.path().join("a.cpp"), 1, 45)
            .err()
            .unwrap();
        assert!(matches!(err, IndexerError::NotIndexed(_)));
    }
}
