//! Indexing engine
//!
//! Two levels:
//! - [`Indexer::index_translation_unit`] parses one file and records every
//!   classified node that physically sits in that file
//! - [`Indexer::index_directory`] discovers sources under a project root,
//!   splits them into contiguous slices and runs one worker per slice
//!
//! Workers never share a connection. Each one opens its own store handle and
//! commits after every file (or every `files_per_commit` files), so readers
//! see a project fill up file by file and a crashed worker only loses the file
//! it was on.

use ignore::WalkBuilder;
use rayon::prelude::*;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::config::IndexConfig;
use crate::error::{IndexerError, Result};
use crate::models::{IndexReport, SymbolKind, SymbolRecord, WorkerReport};
use crate::parser::{
    traverse, AstVisitor, ChildVisit, CompilerArgs, Cursor, SourceParser, TranslationUnit,
};
use crate::store::SymbolStore;

/// How often a timed process worker is polled for exit
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How directory indexing runs its slices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStrategy {
    /// Each slice runs in `<program> worker ...`, so parser memory goes back
    /// to the OS when the slice is done
    Processes { program: PathBuf },
    /// Each slice runs on its own thread of an in-process pool
    Threads,
}

/// What happened to one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Indexed { symbols_inserted: usize },
    ParseFailed,
}

/// Walk context: records the symbols of one translation unit
struct IndexContext<'a> {
    primary: &'a Path,
    filename: String,
    store: &'a SymbolStore,
    inserted: usize,
    error: Option<IndexerError>,
}

impl<'a> IndexContext<'a> {
    fn new(unit: &'a TranslationUnit, store: &'a SymbolStore) -> Self {
        Self {
            primary: unit.spelling(),
            filename: unit.spelling().to_string_lossy().to_string(),
            store,
            inserted: 0,
            error: None,
        }
    }
}

impl AstVisitor for IndexContext<'_> {
    fn visit(&mut self, cursor: Cursor<'_>, _parent: Cursor<'_>) -> ChildVisit {
        // Declarations pulled in from headers belong to the header's own unit
        if cursor.location().file != self.primary || self.error.is_some() {
            return ChildVisit::Continue;
        }

        let Some(kind) = SymbolKind::from_node_id(cursor.kind()) else {
            return ChildVisit::Recurse;
        };

        let usr = cursor.identity();
        if usr.is_empty() {
            return ChildVisit::Recurse;
        }

        let location = cursor.location();
        let record = SymbolRecord::new(
            self.filename.as_str(),
            usr,
            location.line,
            location.column,
            kind,
        );
        match self.store.insert(&record) {
            Ok(true) => self.inserted += 1,
            Ok(false) => {}
            Err(e) => {
                self.error = Some(e);
                return ChildVisit::Continue;
            }
        }

        ChildVisit::Recurse
    }
}

/// Files of a worker indexed since its last commit
#[derive(Debug, Default)]
struct PendingBatch {
    files: usize,
    symbols: usize,
}

impl PendingBatch {
    /// Commit the batch and move it into `report`
    ///
    /// A failed commit rolls the batch back and counts its files as failed;
    /// earlier batches stay committed and the worker goes on.
    fn settle(&mut self, store: &SymbolStore, report: &mut WorkerReport) {
        let committed = store.commit();
        if committed.is_err() {
            if let Err(e) = store.rollback() {
                log::warn!("Failed to roll back uncommitted symbols: {}", e);
            }
        }
        self.apply(committed, report);
    }

    fn apply(&mut self, committed: Result<()>, report: &mut WorkerReport) {
        match committed {
            Ok(()) => {
                report.files_indexed += self.files;
                report.symbols_inserted += self.symbols;
            }
            Err(e) => {
                log::warn!("Failed to commit {} files: {}", self.files, e);
                report.files_failed += self.files;
            }
        }
        *self = PendingBatch::default();
    }
}

/// Drives a [`SourceParser`] over files and directories
pub struct Indexer<P: SourceParser> {
    parser: P,
    config: IndexConfig,
    strategy: WorkerStrategy,
}

impl<P: SourceParser> Indexer<P> {
    /// Create an indexer running slices on threads
    ///
    /// Process workers return parser memory to the OS after every slice;
    /// select them with [`Indexer::with_strategy`] and a program that serves
    /// the `worker` subcommand (the `cxxref` binary does).
    pub fn new(parser: P, config: IndexConfig) -> Self {
        Self {
            parser,
            config,
            strategy: WorkerStrategy::Threads,
        }
    }

    pub fn with_strategy(mut self, strategy: WorkerStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }

    /// Parse one file and insert its symbols into `store`
    ///
    /// Nothing is committed here. A file that fails to parse is logged and
    /// reported as [`FileOutcome::ParseFailed`]; only store failures are errors.
    pub fn index_translation_unit(
        &self,
        root: &Path,
        contents_path: &Path,
        display_path: &Path,
        compiler_args: &CompilerArgs,
        store: &SymbolStore,
    ) -> Result<FileOutcome> {
        let parse_start = Instant::now();
        let unit = match self
            .parser
            .parse(contents_path, display_path, compiler_args, root)
        {
            Ok(unit) => unit,
            Err(e) => {
                log::warn!("Skipping {}: {:#}", display_path.display(), e);
                return Ok(FileOutcome::ParseFailed);
            }
        };
        let parse_elapsed = parse_start.elapsed();

        let walk_start = Instant::now();
        let mut context = IndexContext::new(&unit, store);
        traverse(unit.root(), &mut context);
        if let Some(e) = context.error {
            return Err(e);
        }

        log::debug!(
            "Indexed {}: {} symbols (parse {:?}, walk {:?})",
            display_path.display(),
            context.inserted,
            parse_elapsed,
            walk_start.elapsed()
        );

        Ok(FileOutcome::Indexed {
            symbols_inserted: context.inserted,
        })
    }

    /// Index a single file into an existing store and commit
    ///
    /// `contents_path` is what gets parsed; rows are recorded under
    /// `display_path` (an editor's unsaved buffer indexed as the real file).
    /// Only [`Indexer::index_directory`] creates the store, so a root that was
    /// never indexed fails with [`IndexerError::NotIndexed`].
    pub fn index_file(
        &self,
        root: impl AsRef<Path>,
        contents_path: impl AsRef<Path>,
        display_path: impl AsRef<Path>,
        compiler_args: &str,
    ) -> Result<IndexReport> {
        let start = Instant::now();
        let root = root.as_ref();
        let display_path = display_path.as_ref();

        let store =
            SymbolStore::open_existing(SymbolStore::store_path(root), self.config.busy_timeout())?;
        let outcome = self.index_translation_unit(
            root,
            contents_path.as_ref(),
            display_path,
            &CompilerArgs::parse(compiler_args),
            &store,
        )?;
        store.commit()?;

        let mut report = IndexReport {
            root: root.to_path_buf(),
            files_discovered: 1,
            workers: 1,
            ..Default::default()
        };
        match outcome {
            FileOutcome::Indexed { symbols_inserted } => {
                report.files_indexed = 1;
                report.symbols_inserted = symbols_inserted;
            }
            FileOutcome::ParseFailed => report.files_failed = 1,
        }
        report.elapsed_ms = start.elapsed().as_millis() as u64;

        log::info!(
            "Indexed {} ({} symbols) in {:?}",
            display_path.display(),
            report.symbols_inserted,
            start.elapsed()
        );
        Ok(report)
    }

    /// Index every source file under `root`
    ///
    /// A root that already has a store is skipped unless `force` is set.
    pub fn index_directory(
        &self,
        root: impl AsRef<Path>,
        compiler_args: &str,
    ) -> Result<IndexReport> {
        let start = Instant::now();
        let root = root.as_ref();

        if SymbolStore::exists(root) && !self.config.force {
            log::info!(
                "{} already has a symbol store, skipping \
                 (existence check only, files are not checked for changes)",
                root.display()
            );
            return Ok(IndexReport::skipped(root));
        }

        // Catalog is created and committed before any worker starts writing
        let store =
            SymbolStore::initialize(SymbolStore::store_path(root), self.config.busy_timeout())?;

        let files = self.discover_files(root);
        let worker_count = self.config.worker_count(files.len());
        let slices = partition(&files, worker_count);
        log::info!(
            "Indexing {} files under {} with {} workers",
            files.len(),
            root.display(),
            slices.len()
        );

        let reports = match &self.strategy {
            WorkerStrategy::Threads => self.run_threads(root, compiler_args, &slices)?,
            WorkerStrategy::Processes { program } => {
                self.run_processes(program, root, compiler_args, &slices)
            }
        };

        let mut report = IndexReport {
            root: root.to_path_buf(),
            files_discovered: files.len(),
            workers: slices.len(),
            ..Default::default()
        };
        for worker in &reports {
            report.absorb(worker);
        }

        store.commit()?;
        store.checkpoint()?;

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        log::info!(
            "Indexed {}/{} files ({} failed, {} symbols) in {:?}",
            report.files_indexed,
            report.files_discovered,
            report.files_failed,
            report.symbols_inserted,
            start.elapsed()
        );
        Ok(report)
    }

    /// Files under `root` with an allowed extension, sorted
    pub fn discover_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();

        let walker = WalkBuilder::new(root)
            .follow_links(self.config.follow_symlinks)
            .standard_filters(self.config.respect_ignore_files)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            // Only process files (not directories)
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }

            if self.config.accepts(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }

        files.sort();
        log::debug!("Discovered {} source files under {}", files.len(), root.display());
        files
    }

    /// Index one slice of files on a fresh store connection
    ///
    /// This is the body of every worker, thread or process.
    pub fn run_slice(
        &self,
        root: &Path,
        compiler_args: &CompilerArgs,
        files: &[PathBuf],
    ) -> Result<WorkerReport> {
        let start = Instant::now();
        let store =
            SymbolStore::initialize(SymbolStore::store_path(root), self.config.busy_timeout())?;
        let files_per_commit = self.config.files_per_commit();
        let mut report = WorkerReport::default();
        let mut batch = PendingBatch::default();

        for (index, file) in files.iter().enumerate() {
            match self.index_translation_unit(root, file, file, compiler_args, &store) {
                Ok(FileOutcome::Indexed { symbols_inserted }) => {
                    batch.files += 1;
                    batch.symbols += symbols_inserted;
                }
                Ok(FileOutcome::ParseFailed) => report.files_failed += 1,
                Err(e) => {
                    log::warn!("Failed to record symbols for {}: {}", file.display(), e);
                    report.files_failed += 1;
                }
            }

            if (index + 1) % files_per_commit == 0 {
                batch.settle(&store, &mut report);
            }
        }
        batch.settle(&store, &mut report);

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        log::debug!(
            "Worker finished {} files ({} failed) in {:?}",
            files.len(),
            report.files_failed,
            start.elapsed()
        );
        Ok(report)
    }

    /// Worker process side of [`WorkerStrategy::Processes`]
    ///
    /// Reads a JSON array of file paths from `input`, indexes them and writes
    /// the [`WorkerReport`] as one JSON line to `output`.
    pub fn serve_worker<R: Read, W: Write>(
        &self,
        root: &Path,
        compiler_args: &str,
        input: R,
        mut output: W,
    ) -> Result<WorkerReport> {
        let files: Vec<PathBuf> = serde_json::from_reader(input)
            .map_err(|e| IndexerError::Worker(format!("invalid file list on stdin: {}", e)))?;

        let report = self.run_slice(root, &CompilerArgs::parse(compiler_args), &files)?;

        serde_json::to_writer(&mut output, &report)
            .map_err(|e| IndexerError::Worker(format!("failed to write report: {}", e)))?;
        writeln!(output)?;
        output.flush()?;
        Ok(report)
    }

    fn run_threads(
        &self,
        root: &Path,
        compiler_args: &str,
        slices: &[&[PathBuf]],
    ) -> Result<Vec<WorkerReport>> {
        if slices.is_empty() {
            return Ok(Vec::new());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(slices.len())
            .build()
            .map_err(|e| IndexerError::Worker(format!("failed to create thread pool: {}", e)))?;
        let compiler_args = CompilerArgs::parse(compiler_args);

        let reports = pool.install(|| {
            slices
                .par_iter()
                .enumerate()
                .map(|(index, slice)| {
                    self.run_slice(root, &compiler_args, slice)
                        .unwrap_or_else(|e| {
                            log::warn!("Worker {} failed: {}", index, e);
                            WorkerReport::failed_slice(slice.len())
                        })
                })
                .collect()
        });

        Ok(reports)
    }

    fn run_processes(
        &self,
        program: &Path,
        root: &Path,
        compiler_args: &str,
        slices: &[&[PathBuf]],
    ) -> Vec<WorkerReport> {
        let mut reports = Vec::with_capacity(slices.len());
        let mut running = Vec::with_capacity(slices.len());

        for (index, slice) in slices.iter().enumerate() {
            match self.spawn_worker(program, root, compiler_args, slice) {
                Ok(child) => running.push((index, slice.len(), child)),
                Err(e) => {
                    log::warn!("Worker {} failed to start: {}", index, e);
                    reports.push(WorkerReport::failed_slice(slice.len()));
                }
            }
        }

        // Every worker was launched at once, so they share one deadline
        let deadline = self
            .config
            .worker_timeout()
            .map(|timeout| Instant::now() + timeout);

        for (index, files, child) in running {
            let report = join_worker(child, deadline).unwrap_or_else(|e| {
                log::warn!("Worker {} failed: {}", index, e);
                WorkerReport::failed_slice(files)
            });
            reports.push(report);
        }

        reports
    }

    fn spawn_worker(
        &self,
        program: &Path,
        root: &Path,
        compiler_args: &str,
        files: &[PathBuf],
    ) -> Result<Child> {
        let mut command = Command::new(program);
        command
            .arg("worker")
            .arg("--root")
            .arg(root)
            .arg(format!("--compiler-args={}", compiler_args))
            .arg(format!("--files-per-commit={}", self.config.files_per_commit()))
            .arg(format!("--busy-timeout-ms={}", self.config.busy_timeout_ms))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        if std::env::var_os("RUST_LOG").is_none() {
            command.env("RUST_LOG", log::max_level().as_str());
        }

        let mut child = command.spawn().map_err(|e| {
            IndexerError::Worker(format!("failed to spawn {}: {}", program.display(), e))
        })?;

        let payload = serde_json::to_vec(files)
            .map_err(|e| IndexerError::Worker(format!("failed to encode file list: {}", e)))?;

        // Dropping stdin closes it, which ends the worker's input
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&payload),
            None => Ok(()),
        };
        if let Err(e) = written {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e.into());
        }

        Ok(child)
    }
}

/// Wait for a worker process and read its report
///
/// A worker still running at `deadline` is killed; its committed files stay
/// in the store, the rest of its slice counts as failed.
fn join_worker(mut child: Child, deadline: Option<Instant>) -> Result<WorkerReport> {
    let status = match deadline {
        None => child.wait()?,
        Some(deadline) => loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(IndexerError::Worker("timed out and was killed".to_string()));
            }
            std::thread::sleep(WORKER_POLL_INTERVAL);
        },
    };

    if !status.success() {
        return Err(IndexerError::Worker(format!("exited with {}", status)));
    }

    let mut output = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout.read_to_string(&mut output)?;
    }

    serde_json::from_str(output.trim())
        .map_err(|e| IndexerError::Worker(format!("unreadable report {:?}: {}", output.trim(), e)))
}

/// Split `items` into at most `slices` contiguous, non-empty runs whose
/// lengths differ by at most one
pub fn partition<T>(items: &[T], slices: usize) -> Vec<&[T]> {
    let slices = slices.min(items.len());
    if slices == 0 {
        return Vec::new();
    }

    let base = items.len() / slices;
    let extra = items.len() % slices;
    let mut parts = Vec::with_capacity(slices);
    let mut start = 0;

    for index in 0..slices {
        let len = base + usize::from(index < extra);
        parts.push(&items[start..start + len]);
        start += len;
    }

    parts
}
