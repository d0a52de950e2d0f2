//! Jailed virtual filesystem.
//!
//! This module provides:
//! - [`PathJail`] - Resolves raw paths against a root set; the trust boundary
//! - [`LocalFs`] - File operations on the host filesystem, every one of which
//!   goes through the jail first
//! - [`Searcher`] - Pluggable content search used by [`LocalFs::search`]
//!
//! Paths handed to the filesystem may be relative (resolved against the
//! session [`WorkDir`]), may traverse symlinks, and may not exist yet. The jail
//! resolves all three cases before any I/O is performed.

mod jail;
mod lines;
mod local;
mod search;
mod tree;

use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use jail::{PathJail, WorkDir};
pub use lines::{MAX_LINE_LEN, ReadOptions, format_numbered};
pub use local::{BatchRead, EditOptions, LocalFs, MAX_BATCH_FILES, OpenFlags};
pub use search::{GrepSearcher, SearchMatch, SearchOptions, Searcher};
pub use tree::{NodeKind, TreeNode};

/// Errors that can occur during filesystem operations
#[derive(Debug, Error)]
pub enum FsError {
    /// Resolved path (or its resolved parent) lies outside every root
    #[error("access denied - path outside allowed directories: {}", .0.display())]
    AccessDenied(PathBuf),
    /// Path could not be made absolute
    #[error("invalid path: {0}")]
    PathInvalid(String),
    /// No ancestor of the path exists
    #[error("parent directory does not exist: {}", .0.display())]
    PathMissingParent(PathBuf),
    /// The jail was configured without any root directory
    #[error("no root directories configured")]
    NoRoots,
    /// File or directory not found
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// Target already exists
    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    /// Path is not a directory
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    /// Path is not a file
    #[error("not a file: {}", .0.display())]
    NotAFile(PathBuf),
    /// Directory is not empty and recursive deletion was not requested
    #[error("{} is a non-empty directory, use recursive delete", .0.display())]
    NotEmptyOrNotRecursive(PathBuf),
    /// Line offset past the end of the file
    #[error("line offset {offset} exceeds file length ({lines} lines)")]
    OffsetOutOfRange {
        /// Requested 0-indexed line offset
        offset: usize,
        /// Number of lines in the file
        lines: usize,
    },
    /// A batch read asked for more files than allowed
    #[error("too many files requested: {requested} (maximum is {max} per request)")]
    TooManyFiles {
        /// Number of paths in the request
        requested: usize,
        /// Batch limit
        max: usize,
    },
    /// Bad search or replace pattern
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Map an IO error on `path`, keeping not-found distinguishable.
    pub(crate) fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.into()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.into()),
            _ => Self::Io(err),
        }
    }
}

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Dir,
    /// Symbolic link (not followed)
    Symlink,
    /// Anything else (socket, fifo, device)
    Other,
}

impl From<std::fs::FileType> for EntryKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_symlink() {
            Self::Symlink
        } else if ft.is_dir() {
            Self::Dir
        } else if ft.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

/// Directory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Entry kind, symlinks are reported as such
    pub kind: EntryKind,
    /// Size in bytes (of the link itself for symlinks)
    pub size: u64,
}

impl DirEntry {
    /// Whether this entry is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// File/directory metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// Base name
    pub name: String,
    /// Resolved absolute path
    pub path: PathBuf,
    /// Whether this is a directory
    pub is_dir: bool,
    /// Whether this is a regular file
    pub is_file: bool,
    /// Whether this is a symbolic link (only possible from `lstat`)
    pub is_symlink: bool,
    /// Permission bits
    pub mode: u32,
    /// File size in bytes
    pub size: u64,
    /// Last modified time as Unix timestamp
    pub modified: Option<u64>,
}

impl FileInfo {
    pub(crate) fn from_metadata(path: PathBuf, meta: &std::fs::Metadata) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            is_symlink: meta.file_type().is_symlink(),
            mode: permission_bits(meta),
            size: meta.len(),
            modified: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            path,
        }
    }

    /// Permissions formatted as octal, e.g. `755`
    pub fn permissions(&self) -> String {
        format!("{:o}", self.mode & 0o7777)
    }
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
