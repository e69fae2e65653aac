use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid glob pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },
    #[error("failed to read ignore file {path}: {source}")]
    IgnoreFile { path: PathBuf, source: io::Error },
}

/// Include/exclude decision over path strings.
///
/// A path matches when at least one include pattern matches it and no
/// exclude pattern does. An empty include list is the universal pattern.
/// Patterns are shell-style globs (`*`, `?`, `[..]`); `*` may cross `/`,
/// so `*.log` matches at any depth.
#[derive(Debug)]
pub struct GlobFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    include_set: GlobSet,
    exclude_set: GlobSet,
}

impl GlobFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Result<Self, FilterError> {
        let include_set = compile(&include)?;
        let exclude_set = compile(&exclude)?;
        Ok(Self {
            include,
            exclude,
            include_set,
            exclude_set,
        })
    }

    /// A filter that matches everything.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new()).expect("empty pattern lists always compile")
    }

    pub fn matches(&self, path: &Path) -> bool {
        (self.include.is_empty() || self.include_set.is_match(path))
            && !self.exclude_set.is_match(path)
    }

    /// Watch decision for directories. Include patterns select the files of
    /// interest; their events arrive through the parent directory's watch,
    /// so a directory is only rejected by the exclude side.
    pub fn allows_dir(&self, path: &Path) -> bool {
        !self.exclude_set.is_match(path)
    }

    pub fn include_patterns(&self) -> &[String] {
        &self.include
    }

    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude
    }
}

fn compile(patterns: &[String]) -> Result<GlobSet, FilterError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| FilterError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| FilterError::Pattern {
        pattern: String::from("<set>"),
        source,
    })
}

/// Per-directory override filters, looked up by nearest ancestor.
///
/// Kept as an ordered list of `(prefix, filter)` pairs rather than a tree:
/// resolution walks the list and keeps the longest prefix that contains the
/// queried path. Paths are matched relative to their prefix.
#[derive(Debug, Default)]
pub struct OverrideSet {
    entries: Vec<(PathBuf, GlobFilter)>,
}

impl OverrideSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, prefix: PathBuf, filter: GlobFilter) {
        trace!("override filter for {}", prefix.display());
        self.entries.push((prefix, filter));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the nearest-ancestor override (if any) accepts the path.
    pub fn allows(&self, path: &Path) -> bool {
        match self.nearest(path) {
            Some((prefix, filter)) => match path.strip_prefix(prefix) {
                Ok(relative) => filter.matches(relative),
                Err(_) => true,
            },
            None => true,
        }
    }

    fn nearest(&self, path: &Path) -> Option<(&Path, &GlobFilter)> {
        self.entries
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix) && path != prefix.as_path())
            .max_by_key(|(prefix, _)| prefix.as_os_str().len())
            .map(|(prefix, filter)| (prefix.as_path(), filter))
    }
}

/// Parse ignore-file content: blank lines and `#` comments are dropped,
/// everything else is an exclude glob. `!` negation is not supported and
/// such lines are skipped.
pub fn parse_ignore_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| {
            if line.is_empty() || line.starts_with('#') {
                false
            } else if line.starts_with('!') {
                trace!("ignoring negated ignore pattern `{line}`");
                false
            } else {
                true
            }
        })
        .map(str::to_owned)
        .collect()
}

/// Read an ignore file into an exclude-only filter.
pub fn read_ignore_file(path: &Path) -> Result<GlobFilter, FilterError> {
    let content = fs::read_to_string(path).map_err(|source| FilterError::IgnoreFile {
        path: path.to_owned(),
        source,
    })?;
    GlobFilter::new(Vec::new(), parse_ignore_lines(&content))
}
