//! Content search over a directory tree.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use super::{FsError, PathJail};

/// Default traversal depth for searches.
pub const DEFAULT_SEARCH_DEPTH: usize = 25;

/// Options controlling a content search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Pattern to look for, required
    pub pattern: String,
    /// Treat `pattern` as a regular expression rather than a literal
    pub regex: bool,
    /// Match case-insensitively
    pub ignore_case: bool,
    /// Only match whole words
    pub word: bool,
    /// Only search files whose name matches this glob
    pub include: Option<String>,
    /// Skip files and directories whose name matches any of these globs
    pub exclude: Vec<String>,
    /// Maximum directory depth
    pub depth: usize,
    /// Follow symbolic links while walking
    pub follow: bool,
    /// Search hidden files and directories
    pub hidden: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            regex: false,
            ignore_case: false,
            word: false,
            include: None,
            exclude: Vec::new(),
            depth: DEFAULT_SEARCH_DEPTH,
            follow: false,
            hidden: false,
        }
    }
}

impl SearchOptions {
    /// Literal search for `pattern` with default settings.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Default::default()
        }
    }
}

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    /// File containing the match
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The matching line, without its terminator
    pub text: String,
}

/// Pluggable search backend used by [`LocalFs::search`](super::LocalFs::search).
///
/// `root` has already been validated by the jail. Implementations that
/// follow symlinks must not read anything `jail` rejects; the filesystem
/// additionally drops any returned match whose real path leaves the jail.
pub trait Searcher: Send + Sync + std::fmt::Debug {
    /// Search files under `root`.
    fn search(
        &self,
        root: &Path,
        jail: &PathJail,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchMatch>, FsError>;
}

/// In-process grep over a `walkdir` traversal.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrepSearcher;

impl GrepSearcher {
    fn compile(opts: &SearchOptions) -> Result<regex_lite::Regex, FsError> {
        if opts.pattern.is_empty() {
            return Err(FsError::InvalidPattern("search pattern is required".into()));
        }
        let mut pattern = if opts.regex {
            opts.pattern.clone()
        } else {
            regex_lite::escape(&opts.pattern)
        };
        if opts.word {
            pattern = format!(r"\b(?:{pattern})\b");
        }
        regex_lite::RegexBuilder::new(&pattern)
            .case_insensitive(opts.ignore_case)
            .build()
            .map_err(|e| FsError::InvalidPattern(e.to_string()))
    }
}

fn compile_globs(patterns: &[String]) -> Result<Vec<glob::Pattern>, FsError> {
    patterns
        .iter()
        .map(|p| glob::Pattern::new(p).map_err(|e| FsError::InvalidPattern(format!("{p}: {e}"))))
        .collect()
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Whether a followed symlink stays inside the jail. Pruned entries are
/// neither read nor descended into.
fn link_inside(entry: &DirEntry, jail: &PathJail) -> bool {
    if !entry.path_is_symlink() {
        return true;
    }
    match std::fs::canonicalize(entry.path()) {
        Ok(real) if jail.contains(&real) => true,
        _ => {
            debug!(path = %entry.path().display(), "search: pruning symlink outside jail");
            false
        }
    }
}

impl Searcher for GrepSearcher {
    fn search(
        &self,
        root: &Path,
        jail: &PathJail,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchMatch>, FsError> {
        let regex = Self::compile(opts)?;
        let include = opts
            .include
            .as_deref()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| FsError::InvalidPattern(format!("{p}: {e}")))
            })
            .transpose()?;
        let exclude = compile_globs(&opts.exclude)?;

        let walker = WalkDir::new(root)
            .max_depth(opts.depth)
            .follow_links(opts.follow)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                (opts.hidden || !is_hidden(e))
                    && (e.depth() == 0 || !exclude.iter().any(|g| g.matches(&name)))
                    && link_inside(e, jail)
            });

        let mut matches = Vec::new();
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(include) = &include
                && !include.matches(&entry.file_name().to_string_lossy())
            {
                continue;
            }
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            // Binary files are not searched.
            if bytes.contains(&0) {
                continue;
            }
            let content = String::from_utf8_lossy(&bytes);
            for (i, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(SearchMatch {
                        path: entry.path().to_path_buf(),
                        line: i + 1,
                        text: line.to_string(),
                    });
                }
            }
        }
        Ok(matches)
    }
}
