//! User-facing terminal messages
//!
//! Colored, padded messages on stderr without the timestamps and module
//! prefixes env_logger adds. Results themselves go to stdout.

use owo_colors::OwoColorize;

/// Display a warning message to the user in yellow with padding
///
/// # Example
/// ```ignore
/// output::warn("/src/project is already indexed. Use --force to index it again.");
/// ```
pub fn warn(message: &str) {
    eprintln!("\n{}\n", message.yellow());
}

/// Display an error message to the user in red with padding
///
/// # Example
/// ```ignore
/// output::error("No symbol store under /src/project. Run 'cxxref index' first.");
/// ```
pub fn error(message: &str) {
    eprintln!("\n{}\n", message.red());
}

/// Display an informational message to the user with padding
pub fn info(message: &str) {
    eprintln!("\n{}\n", message);
}
