//! Compiler argument handling
//!
//! Arguments cross the engine boundary as one string (exactly what a build
//! system or editor hands over). Only the parts the parser can use are
//! extracted: include search paths and an explicit `-x` language override.

use std::path::{Path, PathBuf};

use crate::models::Language;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilerArgs {
    raw: String,
    pub include_dirs: Vec<PathBuf>,
    pub language: Option<Language>,
}

impl CompilerArgs {
    pub fn parse(raw: &str) -> Self {
        let words = match shell_words::split(raw) {
            Ok(words) => words,
            Err(e) => {
                log::warn!(
                    "Malformed compiler arguments ({}), splitting on whitespace: {}",
                    e,
                    raw
                );
                raw.split_whitespace().map(str::to_string).collect()
            }
        };

        let mut args = CompilerArgs {
            raw: raw.to_string(),
            ..Default::default()
        };

        let mut words = words.into_iter();
        while let Some(word) = words.next() {
            match word.as_str() {
                "-I" | "-iquote" | "-isystem" => {
                    if let Some(dir) = words.next() {
                        args.include_dirs.push(PathBuf::from(dir));
                    }
                }
                "-x" => {
                    args.language = words.next().and_then(|lang| language_from_flag(&lang));
                }
                _ => {
                    if let Some(dir) = word.strip_prefix("-I") {
                        args.include_dirs.push(PathBuf::from(dir));
                    } else if let Some(dir) = word.strip_prefix("-iquote") {
                        args.include_dirs.push(PathBuf::from(dir));
                    } else if let Some(dir) = word.strip_prefix("-isystem") {
                        args.include_dirs.push(PathBuf::from(dir));
                    } else if let Some(lang) = word.strip_prefix("-x") {
                        args.language = language_from_flag(lang);
                    }
                }
            }
        }

        args
    }

    /// The arguments exactly as received
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Include directories, relative ones anchored at the project root
    pub fn resolved_include_dirs(&self, project_root: &Path) -> Vec<PathBuf> {
        self.include_dirs
            .iter()
            .map(|dir| {
                if dir.is_absolute() {
                    dir.clone()
                } else {
                    project_root.join(dir)
                }
            })
            .collect()
    }
}

fn language_from_flag(flag: &str) -> Option<Language> {
    match flag {
        "c" | "c-header" => Some(Language::C),
        "c++" | "c++-header" => Some(Language::Cpp),
        _ => None,
    }
}
