//! Lazy enumeration of candidate files under a scan root.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use glob::{MatchOptions, Pattern, PatternError};
use log::{debug, warn};
use walkdir::WalkDir;

/// Shared cancellation flag, polled between items.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A file the scan must never report, matched by name within a directory.
#[derive(Debug, Clone)]
struct ExcludedFile {
    name: OsString,
    dir: PathBuf,
    canonical_dir: Option<PathBuf>,
}

impl ExcludedFile {
    fn new(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_os_string();
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let canonical_dir = dir.canonicalize().ok();
        Some(Self {
            name,
            dir,
            canonical_dir,
        })
    }

    fn matches(&self, path: &Path) -> bool {
        if path.file_name() != Some(self.name.as_os_str()) {
            return false;
        }
        let Some(parent) = path.parent() else {
            return false;
        };
        parent == self.dir
            || match (&self.canonical_dir, parent.canonicalize()) {
                (Some(expected), Ok(actual)) => *expected == actual,
                _ => false,
            }
    }
}

/// Walks a directory tree depth-first in file-name order.
///
/// Unreadable entries and symlink loops are logged and skipped. Each call to
/// [`PathScanner::paths`] starts a fresh walk.
#[derive(Debug, Clone)]
pub struct PathScanner {
    root: PathBuf,
    follow_symlinks: bool,
    exclude: Vec<Pattern>,
    excluded_files: Vec<ExcludedFile>,
}

impl PathScanner {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            follow_symlinks: false,
            exclude: Vec::new(),
            excluded_files: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Glob patterns matched against paths relative to the root, with `/`
    /// separators. A matching directory is pruned.
    pub fn exclude_patterns<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self, PatternError> {
        for pattern in patterns {
            self.exclude.push(Pattern::new(pattern.as_ref())?);
        }
        Ok(self)
    }

    /// Never yield `path`, nor its SQLite `-wal`, `-shm` and `-journal`
    /// companions.
    pub fn exclude_database(mut self, path: &Path) -> Self {
        let mut candidates = vec![path.to_path_buf()];
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            candidates.push(PathBuf::from(name));
        }
        self.excluded_files
            .extend(candidates.iter().filter_map(|c| ExcludedFile::new(c)));
        self
    }

    pub fn paths(&self, cancel: &CancellationToken) -> ScanPaths<'_> {
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter();
        ScanPaths {
            scanner: self,
            walker,
            cancel: cancel.clone(),
            skipped: 0,
        }
    }

    fn relative_text(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if self.exclude.is_empty() {
            return false;
        }
        let relative = self.relative_text(path);
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.exclude.iter().any(|p| p.matches_with(&relative, options))
    }
}

/// Iterator returned by [`PathScanner::paths`].
pub struct ScanPaths<'a> {
    scanner: &'a PathScanner,
    walker: walkdir::IntoIter,
    cancel: CancellationToken,
    skipped: usize,
}

impl ScanPaths<'_> {
    /// Entries skipped because they could not be read.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for ScanPaths<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    self.skipped += 1;
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                if self.scanner.is_excluded(entry.path()) {
                    debug!("Pruning excluded directory {}", entry.path().display());
                    self.walker.skip_current_dir();
                }
                continue;
            }
            let path = entry.path();
            let is_file = if entry.path_is_symlink() && !self.scanner.follow_symlinks {
                false
            } else {
                entry.file_type().is_file()
            };
            if !is_file {
                continue;
            }
            if self.scanner.excluded_files.iter().any(|f| f.matches(path)) {
                debug!("Skipping catalog file {}", path.display());
                continue;
            }
            if self.scanner.is_excluded(path) {
                continue;
            }
            return Some(entry.into_path());
        }
    }
}
