//! Integration tests for cxxref

use cxxref::{
    Dispatcher, IndexConfig, IndexerError, Indexer, OpCode, OperationResult, QueryEngine,
    CppParser, SourceLocation, SymbolKind, SymbolRecord, SymbolStore, WorkerStrategy,
};
use std::path::Path;
use tempfile::TempDir;

const A_CPP: &str = "int foo() { return 1; } int main() { return foo(); }";

fn write_project(files: &[(&str, &str)]) -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    for (name, contents) in files {
        let path = temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
    temp_dir
}

fn sorted(mut records: Vec<SymbolRecord>) -> Vec<SymbolRecord> {
    records.sort_by(|a, b| (&a.filename, a.line, a.column).cmp(&(&b.filename, b.line, b.column)));
    records
}

fn file_name(record: &SymbolRecord) -> String {
    Path::new(&record.filename)
        .file_name()
        .unwrap()
        .to_string_lossy()
        .to_string()
}

#[test]
fn test_full_workflow() {
    let temp_dir = write_project(&[("a.cpp", A_CPP)]);
    let root = temp_dir.path();
    let file = root.join("a.cpp");

    let indexer = Indexer::new(CppParser::new(), IndexConfig::default());
    let report = indexer.index_directory(root, "").unwrap();
    assert!(!report.skipped);
    assert_eq!(report.files_discovered, 1);
    assert_eq!(report.files_indexed, 1);
    assert_eq!(report.files_failed, 0);
    assert!(SymbolStore::exists(root));

    let engine = QueryEngine::new(CppParser::new(), root, "");
    let references = sorted(engine.find_all_references(&file, 1, 45).unwrap());
    assert_eq!(
        references,
        vec![
            SymbolRecord::new(file.to_string_lossy(), "c:@F@foo#", 1, 5, SymbolKind::Function),
            SymbolRecord::new(file.to_string_lossy(), "c:@F@foo#", 1, 45, SymbolKind::Function),
        ]
    );

    let definition = engine.go_to_definition(&file, 1, 45).unwrap();
    assert_eq!(definition, Some(SourceLocation::new(&file, 1, 5)));
}

#[test]
fn test_multi_unit_project_with_headers() {
    let temp_dir = write_project(&[
        (
            "include/shape.h",
            "#define MAX_SIDES 8\nstruct Shape { int sides; };\nint perimeter(Shape s);\n",
        ),
        (
            "src/shape.cpp",
            "#include \"shape.h\"\nint perimeter(Shape s) { return s.sides * MAX_SIDES; }\n",
        ),
        (
            "src/main.cpp",
            "#include \"shape.h\"\nint main() { Shape s; s.sides = 3; return perimeter(s); }\n",
        ),
        ("README.md", "not a source file\n"),
    ]);
    let root = temp_dir.path();

    let indexer = Indexer::new(CppParser::new(), IndexConfig { workers: 2, ..Default::default() });
    let report = indexer.index_directory(root, "-Iinclude").unwrap();
    assert_eq!(report.files_discovered, 3);
    assert_eq!(report.files_failed, 0);

    let engine = QueryEngine::new(CppParser::new(), root, "-Iinclude");
    let main = root.join("src/main.cpp");

    // perimeter: header prototype, out-of-line definition, call in main
    let perimeter = engine.find_all_references(&main, 2, 44).unwrap();
    let mut files: Vec<String> = perimeter.iter().map(file_name).collect();
    files.sort();
    assert_eq!(files, vec!["main.cpp", "shape.cpp", "shape.h"]);
    assert!(perimeter.iter().all(|r| r.kind == SymbolKind::Function));

    // Shape is recorded once per unit that includes the header
    let shape = engine.find_all_references(&main, 2, 14).unwrap();
    assert!(shape.iter().all(|r| r.kind == SymbolKind::UserDefinedType));
    assert!(shape.iter().any(|r| file_name(r) == "shape.h" && r.line == 2 && r.column == 8));
    assert!(shape.iter().any(|r| file_name(r) == "main.cpp"));

    // the definition of perimeter lives in another unit
    assert_eq!(engine.go_to_definition(&main, 2, 44).unwrap(), None);
    // the definition of Shape is reachable through the include
    let definition = engine.go_to_definition(&main, 2, 14).unwrap().unwrap();
    assert_eq!(definition.file, root.join("include").join("shape.h"));
    assert_eq!((definition.line, definition.column), (2, 8));
}

#[test]
fn test_worker_processes() {
    let temp_dir = write_project(&[
        ("a.cpp", A_CPP),
        ("b.cpp", "int foo();\nint bar() { return foo(); }\n"),
        ("c.c", "int foo(void);\nint baz(void) { return foo(); }\n"),
    ]);
    let root = temp_dir.path();

    let indexer = Indexer::new(CppParser::new(), IndexConfig { workers: 2, ..Default::default() })
        .with_strategy(WorkerStrategy::Processes {
            program: env!("CARGO_BIN_EXE_cxxref").into(),
        });
    let report = indexer.index_directory(root, "").unwrap();
    assert_eq!(report.workers, 2);
    assert_eq!(report.files_indexed, 3);
    assert_eq!(report.files_failed, 0);

    let store =
        SymbolStore::open_existing(SymbolStore::store_path(root), Default::default()).unwrap();
    // `foo()` and `foo(void)` share one identity across C and C++ units
    let foo = store.query_by_identity("c:@F@foo#").unwrap();
    assert_eq!(foo.len(), 6);
    let mut files: Vec<String> = foo.iter().map(file_name).collect();
    files.sort();
    files.dedup();
    assert_eq!(files, vec!["a.cpp", "b.cpp", "c.c"]);
}

#[test]
fn test_index_file_replaces_previous_rows() {
    let temp_dir = write_project(&[("a.cpp", A_CPP)]);
    let root = temp_dir.path();
    let file = root.join("a.cpp");

    let indexer = Indexer::new(CppParser::new(), IndexConfig::default());
    indexer.index_directory(root, "").unwrap();

    // editor buffer saved elsewhere, recorded under the real name
    let buffer = root.join("buffer.tmp");
    std::fs::write(&buffer, "int foo() { return 1; }\n\nint main() { return foo(); }\n").unwrap();

    let store =
        SymbolStore::open_existing(SymbolStore::store_path(root), Default::default()).unwrap();
    store.drop_file(&file.to_string_lossy()).unwrap();
    indexer.index_file(root, &buffer, &file, "").unwrap();

    let foo = sorted(store.query_by_identity("c:@F@foo#").unwrap());
    let positions: Vec<(u32, u32)> = foo.iter().map(|r| (r.line, r.column)).collect();
    assert_eq!(positions, vec![(1, 5), (3, 21)]);
    assert!(foo.iter().all(|r| r.filename == file.to_string_lossy()));
}

#[test]
fn test_dispatcher_session() {
    let temp_dir = write_project(&[("a.cpp", A_CPP)]);
    let root = temp_dir.path().to_string_lossy().to_string();
    let file = temp_dir.path().join("a.cpp").to_string_lossy().to_string();

    let mut results = Vec::new();
    {
        let mut dispatcher =
            Dispatcher::new(CppParser::new(), IndexConfig::default(), |op, result| {
                results.push((op, result))
            });
        dispatcher.dispatch(OpCode::IndexDirectory.code(), &[root.as_str(), ""]);
        dispatcher.dispatch(OpCode::FindAllReferences.code(), &[file.as_str(), "1", "45"]);
        dispatcher.dispatch(OpCode::DropAll.code(), &[root.as_str()]);
        dispatcher.dispatch(0x42, &[] as &[&str]);
    }

    assert_eq!(results.len(), 3);
    assert!(matches!(
        &results[0],
        (OpCode::IndexDirectory, OperationResult::Indexed(r)) if r.files_indexed == 1
    ));
    match &results[1] {
        (OpCode::FindAllReferences, OperationResult::References { references }) => {
            assert_eq!(references.len(), 2)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        &results[2],
        (OpCode::DropAll, OperationResult::Dropped { rows }) if *rows > 0
    ));
}

#[test]
fn test_queries_require_an_index() {
    let temp_dir = write_project(&[("a.cpp", A_CPP)]);
    let engine = QueryEngine::new(CppParser::new(), temp_dir.path(), "");

    let err = engine
        .find_all_references(temp_dir.path().join("a.cpp"), 1, 45)
        .unwrap_err();
    assert!(matches!(err, IndexerError::NotIndexed(_)));
    assert!(!SymbolStore::exists(temp_dir.path()));
}
