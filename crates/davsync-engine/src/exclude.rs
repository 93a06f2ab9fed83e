//! Exclude engine
//!
//! Compiled matcher over the merged system and user exclude patterns.
//! Discovery consults it for every local and remote name; results are
//! cached per sync run.

use std::collections::HashMap;
use std::sync::Mutex;

use glob::Pattern;
use tracing::warn;

use davsync_core::domain::RelativePath;

/// Why (or that) a path is excluded from synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcludeClass {
    NotExcluded,
    /// Temp files and editor droppings; sync may pick them up later.
    ExcludedTransient,
    /// Hidden files, when the root's policy excludes them.
    ExcludedHidden,
    /// Matched a pattern from the user's exclude list.
    ExcludedUserPattern,
    /// OS-reserved or otherwise unrepresentable names.
    ExcludedInvalidName,
    /// A directory the scanner could not enter.
    ExcludedTraversalDenied,
    /// A conflict copy, when the root keeps them out of sync.
    ExcludedConflictFile,
}

impl ExcludeClass {
    pub fn is_excluded(&self) -> bool {
        !matches!(self, ExcludeClass::NotExcluded)
    }
}

/// Name patterns that are transient by default: partial downloads and
/// editor temp files.
const TRANSIENT_NAME_PATTERNS: &[&str] = &[".*.~*", "*~", ".#*", "*.tmp", ".~lock.*"];

/// Windows device names the server side cannot store.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Compiled exclude matcher for one sync root.
pub struct ExcludeEngine {
    /// User patterns matched against the full relative path.
    path_patterns: Vec<Pattern>,
    /// User patterns without a slash, matched against each name.
    name_patterns: Vec<Pattern>,
    transient_patterns: Vec<Pattern>,
    /// Exact names always excluded (journal db and companions).
    reserved_files: Vec<String>,
    exclude_hidden: bool,
    exclude_conflict_files: bool,
    cache: Mutex<HashMap<String, ExcludeClass>>,
}

impl ExcludeEngine {
    /// Builds the matcher from user patterns (globs, `**` supported).
    /// `journal_file` is the root's journal db name; it and its WAL/SHM
    /// companions are always excluded.
    pub fn new(
        user_patterns: &[String],
        exclude_hidden: bool,
        journal_file: Option<&str>,
    ) -> Self {
        let mut path_patterns = Vec::new();
        let mut name_patterns = Vec::new();
        for raw in user_patterns {
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            match Pattern::new(raw) {
                Ok(pattern) => {
                    if raw.contains('/') {
                        path_patterns.push(pattern);
                    } else {
                        name_patterns.push(pattern);
                    }
                }
                Err(e) => warn!(pattern = raw, error = %e, "Ignoring invalid exclude pattern"),
            }
        }

        let transient_patterns = TRANSIENT_NAME_PATTERNS
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect();

        let mut reserved_files = vec![
            ".davsync-exclude.lst".to_string(),
            ".davsync.log".to_string(),
        ];
        if let Some(db) = journal_file {
            reserved_files.push(db.to_string());
            reserved_files.push(format!("{db}-wal"));
            reserved_files.push(format!("{db}-shm"));
        }

        Self {
            path_patterns,
            name_patterns,
            transient_patterns,
            reserved_files,
            exclude_hidden,
            exclude_conflict_files: false,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_conflict_files_excluded(mut self, excluded: bool) -> Self {
        self.exclude_conflict_files = excluded;
        self
    }

    /// Drops the per-run cache; call between runs.
    pub fn reset_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Classifies a path; ancestors are not consulted (discovery walks
    /// top-down and stops descending at the first excluded directory).
    pub fn classify(&self, path: &RelativePath) -> ExcludeClass {
        if path.is_root() {
            return ExcludeClass::NotExcluded;
        }
        if let Some(cached) = self.cache.lock().unwrap().get(path.as_str()) {
            return *cached;
        }
        let class = self.classify_uncached(path);
        self.cache
            .lock()
            .unwrap()
            .insert(path.as_str().to_string(), class);
        class
    }

    fn classify_uncached(&self, path: &RelativePath) -> ExcludeClass {
        let name = path.file_name().unwrap_or_default();

        if self.reserved_files.iter().any(|r| r == name) {
            return ExcludeClass::ExcludedTransient;
        }

        if invalid_name(name) {
            return ExcludeClass::ExcludedInvalidName;
        }

        if self
            .transient_patterns
            .iter()
            .any(|p| p.matches(name))
        {
            return ExcludeClass::ExcludedTransient;
        }

        if name.contains(" (conflicted copy ") && self.exclude_conflict_files {
            return ExcludeClass::ExcludedConflictFile;
        }

        if self.exclude_hidden && name.starts_with('.') {
            return ExcludeClass::ExcludedHidden;
        }

        if self.name_patterns.iter().any(|p| p.matches(name))
            || self.path_patterns.iter().any(|p| p.matches(path.as_str()))
        {
            return ExcludeClass::ExcludedUserPattern;
        }

        ExcludeClass::NotExcluded
    }
}

/// Names no server-visible file may carry.
fn invalid_name(name: &str) -> bool {
    if name.is_empty() || name.ends_with('.') || name.ends_with(' ') {
        return true;
    }
    let stem = name.split('.').next().unwrap_or(name);
    RESERVED_NAMES
        .iter()
        .any(|r| stem.eq_ignore_ascii_case(r))
}
