//! Symbol store backed by SQLite
//!
//! One store per project root, at `<root>/indexer.db`:
//! - `symbol_type`: fixed catalog of the four storage buckets
//! - `symbol`: one row per (filename, usr, line, column) occurrence
//!
//! Every worker opens its own [`SymbolStore`]. Writers never coordinate in
//! process; concurrent writes are serialized by SQLite's own locking (WAL
//! journal plus a busy timeout), which is also what makes [`SymbolStore::initialize`]
//! safe to race from several processes.

use rusqlite::{Connection, OpenFlags, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{IndexerError, Result};
use crate::models::{SymbolKind, SymbolRecord};

/// Store file name within the project root
pub const STORE_FILE: &str = "indexer.db";

/// How long a connection waits on another writer's lock before giving up
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS symbol_type (
    id INTEGER,
    name TEXT,
    PRIMARY KEY(id)
);

CREATE TABLE IF NOT EXISTS symbol (
    filename TEXT,
    usr TEXT,
    line INTEGER,
    "column" INTEGER,
    type INTEGER,
    PRIMARY KEY(filename, usr, line, "column"),
    FOREIGN KEY (type) REFERENCES symbol_type(id)
);

CREATE INDEX IF NOT EXISTS idx_symbol_usr ON symbol(usr);
"#;

const SQL_INSERT_SYMBOL: &str =
    r#"INSERT OR IGNORE INTO symbol (filename, usr, line, "column", type) VALUES (?1, ?2, ?3, ?4, ?5)"#;

const SQL_SELECT_BY_USR: &str =
    r#"SELECT filename, usr, line, "column", type FROM symbol WHERE usr = ?1"#;

const SQL_SELECT_BY_FILE: &str =
    r#"SELECT filename, usr, line, "column", type FROM symbol WHERE filename = ?1 ORDER BY line, "column""#;

/// A single connection to a project's symbol store
pub struct SymbolStore {
    conn: Connection,
    path: PathBuf,
}

impl SymbolStore {
    /// Path of the store belonging to `root`
    pub fn store_path(root: impl AsRef<Path>) -> PathBuf {
        root.as_ref().join(STORE_FILE)
    }

    /// Whether `root` has already been indexed (existence only, no staleness check)
    pub fn exists(root: impl AsRef<Path>) -> bool {
        Self::store_path(root).exists()
    }

    /// Create (if needed) and open the store at `path`
    ///
    /// Creates both tables and seeds the catalog inside one immediate
    /// transaction, then commits so that other connections can start writing
    /// right away.
    pub fn initialize(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let init_err = |source| IndexerError::StoreInit {
            path: path.clone(),
            source,
        };

        let conn = Connection::open(&path).map_err(init_err)?;
        conn.busy_timeout(busy_timeout).map_err(init_err)?;

        // journal_mode reports the resulting mode as a row
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(init_err)?;
        log::debug!("Symbol store {:?} journal mode: {}", path, mode);

        conn.execute_batch("PRAGMA foreign_keys = ON; BEGIN IMMEDIATE;")
            .map_err(init_err)?;

        let seeded = (|| -> rusqlite::Result<()> {
            conn.execute_batch(SCHEMA)?;
            let mut stmt =
                conn.prepare("INSERT OR IGNORE INTO symbol_type (id, name) VALUES (?1, ?2)")?;
            for kind in [
                SymbolKind::Function,
                SymbolKind::Variable,
                SymbolKind::UserDefinedType,
                SymbolKind::Macro,
            ] {
                stmt.execute(params![kind.id(), kind.to_string()])?;
            }
            Ok(())
        })();

        match seeded {
            Ok(()) => conn.execute_batch("COMMIT").map_err(init_err)?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(init_err(e));
            }
        }

        log::debug!("Initialized symbol store at {:?}", path);
        Ok(Self { conn, path })
    }

    /// Open a store that must already exist
    pub fn open_existing(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(IndexerError::NotIndexed(path));
        }

        let init_err = |source| IndexerError::StoreInit {
            path: path.clone(),
            source,
        };
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(init_err)?;
        conn.busy_timeout(busy_timeout).map_err(init_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(init_err)?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a write transaction unless one is already pending
    fn begin(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(())
    }

    /// Insert one occurrence; returns false if the row already existed
    ///
    /// The write joins the pending transaction (opening one if needed) and
    /// only becomes visible to other connections after [`SymbolStore::commit`].
    pub fn insert(&self, record: &SymbolRecord) -> Result<bool> {
        self.begin()?;
        let mut stmt = self.conn.prepare_cached(SQL_INSERT_SYMBOL)?;
        let written = stmt.execute(params![
            record.filename,
            record.usr,
            record.line,
            record.column,
            record.kind.id(),
        ])?;
        Ok(written > 0)
    }

    /// All occurrences sharing `usr`, in no particular order
    pub fn query_by_identity(&self, usr: &str) -> Result<Vec<SymbolRecord>> {
        let mut stmt = self.conn.prepare_cached(SQL_SELECT_BY_USR)?;
        let rows = stmt.query_map([usr], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All occurrences recorded for one translation unit, in source order
    pub fn symbols_in_file(&self, filename: &str) -> Result<Vec<SymbolRecord>> {
        let mut stmt = self.conn.prepare_cached(SQL_SELECT_BY_FILE)?;
        let rows = stmt.query_map([filename], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn symbol_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM symbol", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Contents of the `symbol_type` catalog, ordered by id
    pub fn catalog(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM symbol_type ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Make pending inserts durable and visible to other connections
    pub fn commit(&self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Discard pending inserts
    pub fn rollback(&self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    /// Delete every occurrence recorded for one translation unit
    pub fn drop_file(&self, filename: &str) -> Result<usize> {
        self.begin()?;
        let removed = self
            .conn
            .execute("DELETE FROM symbol WHERE filename = ?1", [filename])?;
        self.commit()?;
        log::info!("Dropped {} symbols recorded for {}", removed, filename);
        Ok(removed)
    }

    /// Delete every occurrence; the catalog is immutable and stays
    pub fn drop_all(&self) -> Result<usize> {
        self.begin()?;
        let removed = self.conn.execute("DELETE FROM symbol", [])?;
        self.commit()?;
        log::info!("Dropped all {} symbols from {:?}", removed, self.path);
        Ok(removed)
    }

    /// Fold the WAL back into the main database file
    pub fn checkpoint(&self) -> Result<()> {
        self.commit()?;
        // Returns (busy, log_pages, checkpointed_pages)
        let (busy, log_pages, checkpointed): (i64, i64, i64) =
            self.conn
                .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
        log::debug!(
            "WAL checkpoint completed: busy={}, log_pages={}, checkpointed_pages={}",
            busy,
            log_pages,
            checkpointed
        );
        Ok(())
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SymbolRecord> {
    let type_id: i64 = row.get(4)?;
    let kind = SymbolKind::from_id(type_id).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Integer,
            format!("unknown symbol type id {}", type_id).into(),
        )
    })?;

    Ok(SymbolRecord {
        filename: row.get(0)?,
        usr: row.get(1)?,
        line: row.get(2)?,
        column: row.get(3)?,
        kind,
    })
}
