//! Indexing configuration
//!
//! Settings come from an optional `cxxref.toml` at the project root:
//!
//! ```toml
//! [index]
//! workers = 8
//! files_per_commit = 1
//! extensions = ["cpp", "h"]
//! ```
//!
//! Every key is optional. CLI flags override whatever the file says.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{IndexerError, Result};

/// Config file name within the project root
pub const CONFIG_FILE: &str = "cxxref.toml";

/// Extensions indexed when none are configured
pub const DEFAULT_EXTENSIONS: &[&str] = &["cpp", "cc", "cxx", "c", "h", "hh", "hpp"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexConfig {
    /// Number of workers for directory indexing (0 = one per CPU)
    pub workers: usize,
    /// Files written between two commits of a worker
    pub files_per_commit: usize,
    /// File extensions to index, without the leading dot
    pub extensions: Vec<String>,
    /// Follow symbolic links while walking the project
    pub follow_symlinks: bool,
    /// Skip files excluded by .gitignore / .ignore
    pub respect_ignore_files: bool,
    /// Kill a process worker after this many seconds (0 = never)
    pub worker_timeout_secs: u64,
    /// How long a connection waits on another writer's lock
    pub busy_timeout_ms: u64,
    /// Re-index even when the store already exists
    pub force: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            files_per_commit: 1,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            follow_symlinks: false,
            respect_ignore_files: false,
            worker_timeout_secs: 0,
            busy_timeout_ms: 30_000,
            force: false,
        }
    }
}

impl IndexConfig {
    /// Load `[index]` from `<root>/cxxref.toml`
    ///
    /// Falls back to defaults if the file doesn't exist or has no `[index]` table.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);

        if !config_path.exists() {
            log::debug!("No {} found, using default index config", CONFIG_FILE);
            return Ok(Self::default());
        }

        let config_err = |reason: String| IndexerError::Config {
            path: config_path.clone(),
            reason,
        };

        let config_str = std::fs::read_to_string(&config_path)?;
        let toml_value: toml::Value =
            toml::from_str(&config_str).map_err(|e| config_err(e.to_string()))?;

        match toml_value.get("index") {
            Some(index_table) => {
                let config: IndexConfig = index_table
                    .clone()
                    .try_into()
                    .map_err(|e: toml::de::Error| config_err(format!("[index]: {}", e)))?;
                log::debug!("Loaded index config from {:?}", config_path);
                Ok(config)
            }
            None => {
                log::debug!("No [index] section in {}, using defaults", CONFIG_FILE);
                Ok(Self::default())
            }
        }
    }

    /// Workers to launch for `files` files: never more than there are files
    pub fn worker_count(&self, files: usize) -> usize {
        let wanted = if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        };
        wanted.max(1).min(files)
    }

    pub fn files_per_commit(&self) -> usize {
        self.files_per_commit.max(1)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn worker_timeout(&self) -> Option<Duration> {
        (self.worker_timeout_secs > 0).then(|| Duration::from_secs(self.worker_timeout_secs))
    }

    /// Whether `path` has one of the configured extensions
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.') == ext)
    }
}
