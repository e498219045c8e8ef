//! Override files: host files substituted into a test's build context.
//!
//! Rules come from a comma separated `pattern:path` list. A rule applies to
//! every test whose name matches `pattern`; its host file replaces each file
//! in the build context with the same file name, or lands at the context root
//! if the context has no such file.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::error::{HiveError, HiveResult};

/// One `pattern:path` override rule.
#[derive(Debug, Clone)]
pub struct OverrideRule {
    pub pattern: Regex,
    pub path: PathBuf,
}

impl OverrideRule {
    pub fn applies_to(&self, test_name: &str) -> bool {
        self.pattern.is_match(test_name)
    }

    /// The logical name the host file replaces inside a build context.
    pub fn file_name(&self) -> &std::ffi::OsStr {
        self.path.file_name().unwrap_or(self.path.as_os_str())
    }
}

impl PartialEq for OverrideRule {
    fn eq(&self, other: &Self) -> bool {
        self.pattern.as_str() == other.pattern.as_str() && self.path == other.path
    }
}

/// Parse a comma separated `pattern:path` list.
///
/// The split happens at the last `:` so patterns may themselves contain
/// colons (client tags such as `:master`). Every host file must exist.
pub fn parse_overrides(list: &str) -> HiveResult<Vec<OverrideRule>> {
    let mut rules = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (pattern, path) = entry.rsplit_once(':').ok_or_else(|| {
            HiveError::config(format!("override {entry:?} is not of the form pattern:path"))
        })?;
        if pattern.is_empty() || path.is_empty() {
            return Err(HiveError::config(format!(
                "override {entry:?} has an empty pattern or path"
            )));
        }
        let pattern = Regex::new(pattern)
            .map_err(|e| HiveError::config(format!("invalid override pattern {pattern:?}: {e}")))?;
        let path = PathBuf::from(path);
        if !path.is_file() {
            return Err(HiveError::config(format!(
                "override file {} does not exist",
                path.display()
            )));
        }
        rules.push(OverrideRule { pattern, path });
    }
    Ok(rules)
}

/// Copy `context` into a fresh temporary directory and apply `overrides`.
///
/// The returned directory is deleted when dropped.
pub fn stage_context(context: &Path, overrides: &[OverrideRule]) -> std::io::Result<TempDir> {
    let staged = tempfile::Builder::new().prefix("hive-context-").tempdir()?;

    for entry in WalkDir::new(context) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(context)
            .map_err(std::io::Error::other)?;
        let target = staged.path().join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    for rule in overrides {
        let name = rule.file_name();
        let mut replaced = false;
        for entry in WalkDir::new(staged.path()) {
            let entry = entry.map_err(std::io::Error::other)?;
            if entry.file_type().is_file() && entry.file_name() == name {
                fs::copy(&rule.path, entry.path())?;
                replaced = true;
            }
        }
        if !replaced {
            fs::copy(&rule.path, staged.path().join(name))?;
        }
    }

    Ok(staged)
}
