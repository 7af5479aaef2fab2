//! CLI argument parsing and command handlers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};

use crate::config::IndexConfig;
use crate::dispatcher::{Dispatcher, OpCode, OperationResult};
use crate::indexer::{Indexer, WorkerStrategy};
use crate::models::{IndexReport, SymbolRecord};
use crate::output;
use crate::parser::CppParser;
use crate::query::QueryEngine;
use crate::store::SymbolStore;

/// cxxref: a C/C++ symbol indexer with go-to-definition and find-all-references
#[derive(Parser, Debug)]
#[command(
    name = "cxxref",
    version,
    about = "Index C/C++ symbols into SQLite and query definitions and references",
    long_about = "cxxref parses C and C++ sources with Tree-sitter, records every symbol \
                  occurrence in <root>/indexer.db and answers go-to-definition and \
                  find-all-references queries against it.\n\n\
                  Settings can be put in <root>/cxxref.toml under [index]; flags override them."
)]
pub struct Cli {
    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Index every C/C++ source under a project root
    ///
    /// A root that already has an indexer.db is skipped (existence only, files
    /// are not checked for changes). Use --force to index it again.
    Index {
        /// Project root (defaults to current directory)
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,

        /// Compiler arguments used for every file (e.g. "-Iinclude -xc++")
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        compiler_args: String,

        /// Index even if the store already exists
        #[arg(short, long)]
        force: bool,

        /// Number of workers (0 = one per CPU)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Files each worker writes between commits
        #[arg(long)]
        files_per_commit: Option<usize>,

        /// Kill a worker after this many seconds
        #[arg(long)]
        worker_timeout: Option<u64>,

        /// Run workers as threads of this process instead of child processes
        #[arg(long)]
        threads: bool,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-index a single file of an already indexed project
    IndexFile {
        /// File to record symbols for
        file: PathBuf,

        /// Project root holding the store (defaults to current directory)
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Read the source from this path instead (e.g. an unsaved editor buffer)
        #[arg(long)]
        contents: Option<PathBuf>,

        #[arg(long, default_value = "", allow_hyphen_values = true)]
        compiler_args: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete every symbol recorded for one file
    Drop {
        /// File whose symbols are dropped, as it was indexed
        file: PathBuf,

        #[arg(long, default_value = ".")]
        root: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Delete every recorded symbol (the store itself is kept)
    DropAll {
        #[arg(long, default_value = ".")]
        root: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Print the definition of the symbol at FILE:LINE:COLUMN
    Definition {
        file: PathBuf,
        line: u32,
        column: u32,

        #[arg(long, default_value = ".")]
        root: PathBuf,

        #[arg(long, default_value = "", allow_hyphen_values = true)]
        compiler_args: String,

        #[arg(long)]
        json: bool,
    },

    /// Print every recorded occurrence of the symbol at FILE:LINE:COLUMN
    References {
        file: PathBuf,
        line: u32,
        column: u32,

        #[arg(long, default_value = ".")]
        root: PathBuf,

        #[arg(long, default_value = "", allow_hyphen_values = true)]
        compiler_args: String,

        #[arg(long)]
        json: bool,
    },

    /// Run one raw operation by op code
    ///
    /// Examples:
    ///   cxxref dispatch 0x1 /src/project ""
    ///   cxxref dispatch 0x3 /src/project
    ///   cxxref dispatch --root /src/project 0x11 /src/project/a.cpp 1 45
    Dispatch {
        /// Operation code, hexadecimal (0x11) or decimal (17)
        code: String,

        /// Operation arguments, passed through as strings
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Project root for query operations (give options before CODE)
        #[arg(long)]
        root: Option<PathBuf>,

        #[arg(long, default_value = "", allow_hyphen_values = true)]
        compiler_args: String,

        #[arg(long)]
        json: bool,
    },

    /// Internal: index the files listed on stdin (used by `index`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        root: PathBuf,

        #[arg(long, default_value = "", allow_hyphen_values = true)]
        compiler_args: String,

        #[arg(long, default_value_t = 1)]
        files_per_commit: usize,

        #[arg(long, default_value_t = 30_000)]
        busy_timeout_ms: u64,
    },
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        // Setup logging based on verbosity
        let log_level = match self.verbose {
            0 => "warn",  // Default: only warnings and errors
            1 => "info",  // -v: show info messages
            2 => "debug", // -vv: show debug messages
            _ => "trace", // -vvv: show trace messages
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
            .init();

        match self.command {
            Command::Index {
                path,
                compiler_args,
                force,
                workers,
                files_per_commit,
                worker_timeout,
                threads,
                json,
            } => handle_index(
                &path,
                &compiler_args,
                IndexOverrides {
                    force,
                    workers,
                    files_per_commit,
                    worker_timeout,
                },
                threads,
                json,
            ),
            Command::IndexFile {
                file,
                root,
                contents,
                compiler_args,
                json,
            } => handle_index_file(&root, &file, contents.as_deref(), &compiler_args, json),
            Command::Drop { file, root, json } => handle_drop(&root, Some(&file), json),
            Command::DropAll { root, json } => handle_drop(&root, None, json),
            Command::Definition {
                file,
                line,
                column,
                root,
                compiler_args,
                json,
            } => handle_definition(&root, &file, line, column, &compiler_args, json),
            Command::References {
                file,
                line,
                column,
                root,
                compiler_args,
                json,
            } => handle_references(&root, &file, line, column, &compiler_args, json),
            Command::Dispatch {
                code,
                args,
                root,
                compiler_args,
                json,
            } => handle_dispatch(&code, &args, root.as_deref(), &compiler_args, json),
            Command::Worker {
                root,
                compiler_args,
                files_per_commit,
                busy_timeout_ms,
            } => handle_worker(&root, &compiler_args, files_per_commit, busy_timeout_ms),
        }
    }
}

/// Index settings given on the command line
struct IndexOverrides {
    force: bool,
    workers: Option<usize>,
    files_per_commit: Option<usize>,
    worker_timeout: Option<u64>,
}

fn project_root(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path)
        .with_context(|| format!("Project root not found: {}", path.display()))
}

/// Absolute form of `file`, so it matches the paths indexing recorded
fn absolute(file: &Path) -> Result<PathBuf> {
    if file.is_absolute() {
        return Ok(file.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Failed to get current directory")?
        .join(file))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_index(
    path: &Path,
    compiler_args: &str,
    overrides: IndexOverrides,
    threads: bool,
    json: bool,
) -> Result<()> {
    let root = project_root(path)?;
    let mut config = IndexConfig::load(&root)?;
    config.force |= overrides.force;
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    if let Some(files_per_commit) = overrides.files_per_commit {
        config.files_per_commit = files_per_commit;
    }
    if let Some(worker_timeout) = overrides.worker_timeout {
        config.worker_timeout_secs = worker_timeout;
    }

    let strategy = if threads {
        WorkerStrategy::Threads
    } else {
        let program = std::env::current_exe().context("Failed to get current executable path")?;
        WorkerStrategy::Processes { program }
    };

    let indexer = Indexer::new(CppParser::new(), config).with_strategy(strategy);
    let report = indexer.index_directory(&root, compiler_args)?;

    if json {
        return print_json(&report);
    }
    if report.skipped {
        output::warn(&format!(
            "{} is already indexed (existence check only). Use --force to index it again.",
            root.display()
        ));
        return Ok(());
    }
    print_report(&report);
    Ok(())
}

fn print_report(report: &IndexReport) {
    println!("Indexing complete!");
    println!("  Files discovered: {}", report.files_discovered);
    println!("  Files indexed:    {}", report.files_indexed);
    if report.files_failed > 0 {
        println!("  Files failed:     {}", report.files_failed.yellow());
    }
    println!("  Symbols recorded: {}", report.symbols_inserted);
    println!("  Workers:          {}", report.workers);
    println!("  Elapsed:          {} ms", report.elapsed_ms);
}

fn handle_index_file(
    root: &Path,
    file: &Path,
    contents: Option<&Path>,
    compiler_args: &str,
    json: bool,
) -> Result<()> {
    let root = project_root(root)?;
    let file = absolute(file)?;
    let contents = match contents {
        Some(contents) => absolute(contents)?,
        None => file.clone(),
    };

    let indexer = Indexer::new(CppParser::new(), IndexConfig::load(&root)?);
    let report = indexer.index_file(&root, &contents, &file, compiler_args)?;

    if json {
        return print_json(&report);
    }
    if report.files_failed > 0 {
        output::warn(&format!("Could not parse {}", file.display()));
    } else {
        println!("Recorded {} symbols for {}", report.symbols_inserted, file.display());
    }
    Ok(())
}

fn handle_drop(root: &Path, file: Option<&Path>, json: bool) -> Result<()> {
    let root = project_root(root)?;
    let config = IndexConfig::load(&root)?;
    let store = SymbolStore::open_existing(SymbolStore::store_path(&root), config.busy_timeout())?;

    let rows = match file {
        Some(file) => store.drop_file(&absolute(file)?.to_string_lossy())?,
        None => store.drop_all()?,
    };

    if json {
        return print_json(&OperationResult::Dropped { rows });
    }
    println!("Dropped {} symbols", rows);
    Ok(())
}

fn query_engine(root: &Path, compiler_args: &str) -> Result<QueryEngine<CppParser>> {
    let root = project_root(root)?;
    let config = IndexConfig::load(&root)?;
    Ok(QueryEngine::new(CppParser::new(), root, compiler_args)
        .with_busy_timeout(config.busy_timeout()))
}

fn handle_definition(
    root: &Path,
    file: &Path,
    line: u32,
    column: u32,
    compiler_args: &str,
    json: bool,
) -> Result<()> {
    let engine = query_engine(root, compiler_args)?;
    let location = engine.go_to_definition(absolute(file)?, line, column)?;

    if json {
        return print_json(&location);
    }
    match location {
        Some(location) => println!("{}", location),
        None => output::info("No definition found."),
    }
    Ok(())
}

fn handle_references(
    root: &Path,
    file: &Path,
    line: u32,
    column: u32,
    compiler_args: &str,
    json: bool,
) -> Result<()> {
    let engine = query_engine(root, compiler_args)?;
    let mut references = engine.find_all_references(absolute(file)?, line, column)?;
    references.sort_by(|a, b| {
        (&a.filename, a.line, a.column).cmp(&(&b.filename, b.line, b.column))
    });

    if json {
        return print_json(&references);
    }
    if references.is_empty() {
        output::info("No references found.");
        return Ok(());
    }
    for reference in &references {
        print_reference(reference);
    }
    Ok(())
}

fn print_reference(reference: &SymbolRecord) {
    println!(
        "{}:{}:{}  {}  {}",
        reference.filename.bold(),
        reference.line,
        reference.column,
        reference.kind.to_string().cyan(),
        reference.usr.dimmed()
    );
}

fn parse_op_code(code: &str) -> Result<u32> {
    let code = code.trim();
    match code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => code.parse::<u32>(),
    }
    .with_context(|| format!("Invalid op code: {}", code))
}

fn handle_dispatch(
    code: &str,
    args: &[String],
    root: Option<&Path>,
    compiler_args: &str,
    json: bool,
) -> Result<()> {
    let code = parse_op_code(code)?;
    let config = match root {
        Some(root) => IndexConfig::load(root)?,
        None => IndexConfig::default(),
    };
    let program = std::env::current_exe().context("Failed to get current executable path")?;

    let mut results: Vec<(OpCode, OperationResult)> = Vec::new();
    {
        let mut dispatcher = Dispatcher::new(CppParser::new(), config, |op, result| {
            results.push((op, result))
        })
        .with_strategy(WorkerStrategy::Processes { program });
        if let Some(root) = root {
            dispatcher.open_session(project_root(root)?, compiler_args);
        }
        dispatcher.dispatch(code, args);
    }

    let Some((op, result)) = results.pop() else {
        output::warn(&format!("Unknown operation 0x{:x}, nothing was done", code));
        return Ok(());
    };

    if let OperationResult::Failed { error } = &result {
        anyhow::bail!("{} failed: {}", op, error);
    }
    if json {
        return print_json(&result);
    }

    match result {
        OperationResult::Indexed(report) if report.skipped => {
            output::warn(&format!("{} is already indexed", report.root.display()))
        }
        OperationResult::Indexed(report) => print_report(&report),
        OperationResult::Dropped { rows } => println!("Dropped {} symbols", rows),
        OperationResult::Definition { location: Some(location) } => println!("{}", location),
        OperationResult::Definition { location: None } => output::info("No definition found."),
        OperationResult::References { references } => {
            for reference in &references {
                print_reference(reference);
            }
        }
        OperationResult::Failed { .. } => {}
    }
    Ok(())
}

fn handle_worker(
    root: &Path,
    compiler_args: &str,
    files_per_commit: usize,
    busy_timeout_ms: u64,
) -> Result<()> {
    let config = IndexConfig {
        files_per_commit,
        busy_timeout_ms,
        ..Default::default()
    };
    let indexer = Indexer::new(CppParser::new(), config);

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    indexer
        .serve_worker(root, compiler_args, stdin.lock(), stdout.lock())
        .context("Worker failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_op_code() {
        assert_eq!(parse_op_code("0x11").unwrap(), 0x11);
        assert_eq!(parse_op_code("0X10").unwrap(), 0x10);
        assert_eq!(parse_op_code("17").unwrap(), 17);
        assert_eq!(parse_op_code("0").unwrap(), 0);
        assert!(parse_op_code("0xzz").is_err());
        assert!(parse_op_code("index").is_err());
    }

    #[test]
    fn test_cli_parses_hyphenated_compiler_args() {
        let cli =
            Cli::try_parse_from(["cxxref", "index", ".", "--compiler-args", "-Iinclude -xc++"])
                .unwrap();
        match cli.command {
            Command::Index { compiler_args, .. } => assert_eq!(compiler_args, "-Iinclude -xc++"),
            other => panic!("unexpected {:?}", other),
        }

        let cli =
            Cli::try_parse_from(["cxxref", "worker", "--root", "/p", "--compiler-args=-Iinc"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Command::Worker { ref compiler_args, .. } if compiler_args == "-Iinc"
        ));
    }

    #[test]
    fn test_cli_dispatch_args() {
        let cli = Cli::try_parse_from(["cxxref", "-vv", "dispatch", "0x1", "/p", "-Iinc"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Dispatch { code, args, .. } => {
                assert_eq!(code, "0x1");
                assert_eq!(args, vec!["/p", "-Iinc"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
