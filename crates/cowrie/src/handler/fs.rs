//! Filesystem hooks backed by the jailed [`LocalFs`].

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::vfs::{DirEntry, FileInfo, FsError, LocalFs, OpenFlags};

/// Open hook: open `path` (relative to `dir`) with `flags`.
pub trait OpenHandler: Send + Sync {
    /// Open a file for the interpreter.
    fn open(&self, dir: &Path, path: &Path, flags: OpenFlags) -> Result<File, FsError>;
}

/// ReadDir hook: list `path` (relative to `dir`).
pub trait ReadDirHandler: Send + Sync {
    /// Entries of one directory, sorted by name.
    fn read_dir(&self, dir: &Path, path: &Path) -> Result<Vec<DirEntry>, FsError>;
}

/// Stat hook: metadata of `path` (relative to `dir`), following a final
/// symlink only when `follow` is set.
pub trait StatHandler: Send + Sync {
    /// Metadata for the interpreter.
    fn stat(&self, dir: &Path, path: &Path, follow: bool) -> Result<FileInfo, FsError>;
}

/// The three filesystem hooks, delegating to a [`LocalFs`].
#[derive(Debug, Clone)]
pub struct FsHooks {
    fs: LocalFs,
}

impl FsHooks {
    /// Wrap a filesystem.
    pub fn new(fs: LocalFs) -> Self {
        Self { fs }
    }

    /// The wrapped filesystem.
    pub fn fs(&self) -> &LocalFs {
        &self.fs
    }
}

fn absolute(dir: &Path, path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

impl OpenHandler for FsHooks {
    fn open(&self, dir: &Path, path: &Path, flags: OpenFlags) -> Result<File, FsError> {
        self.fs.open(absolute(dir, path), flags)
    }
}

impl ReadDirHandler for FsHooks {
    fn read_dir(&self, dir: &Path, path: &Path) -> Result<Vec<DirEntry>, FsError> {
        self.fs.list(absolute(dir, path))
    }
}

impl StatHandler for FsHooks {
    fn stat(&self, dir: &Path, path: &Path, follow: bool) -> Result<FileInfo, FsError> {
        let path = absolute(dir, path);
        if follow {
            self.fs.stat(path)
        } else {
            self.fs.lstat(path)
        }
    }
}
