//! Host-backed filesystem confined by a [`PathJail`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::lines::{ReadOptions, read_lines};
use super::tree::{TreeNode, TreeWalker};
use super::{
    DirEntry, EntryKind, FileInfo, FsError, GrepSearcher, PathJail, SearchMatch, SearchOptions,
    Searcher, WorkDir,
};

/// How to open a file through [`LocalFs::open`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open for reading
    pub read: bool,
    /// Open for writing
    pub write: bool,
    /// Append to the end instead of overwriting
    pub append: bool,
    /// Create the file if it does not exist
    pub create: bool,
    /// Truncate an existing file
    pub truncate: bool,
}

impl OpenFlags {
    /// Read-only.
    pub fn read() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Write, creating or truncating.
    pub fn write() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Append, creating if missing.
    pub fn append() -> Self {
        Self {
            write: true,
            append: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.read)
            .write(self.write)
            .append(self.append)
            .create(self.create)
            .truncate(self.truncate);
        opts
    }
}

/// Most paths [`LocalFs::read_multiple_files`] accepts in one call.
pub const MAX_BATCH_FILES: usize = 50;

/// One file of a [`LocalFs::read_multiple_files`] batch.
#[derive(Debug)]
pub struct BatchRead {
    /// Path as requested
    pub path: PathBuf,
    /// File contents, or why this path could not be read
    pub content: Result<Vec<u8>, FsError>,
}

/// Options for [`LocalFs::edit_file`].
#[derive(Debug, Clone, Copy)]
pub struct EditOptions {
    /// Replace every match instead of only the first
    pub all_occurrences: bool,
    /// Treat `find` as a regular expression
    pub regex: bool,
}

impl Default for EditOptions {
    fn default() -> Self {
        Self {
            all_occurrences: true,
            regex: false,
        }
    }
}

/// Filesystem facade over the host filesystem.
///
/// Every path argument is resolved against the shared [`WorkDir`] and
/// validated by the [`PathJail`] before any I/O happens.
#[derive(Debug, Clone)]
pub struct LocalFs {
    jail: Arc<PathJail>,
    workdir: Arc<WorkDir>,
    searcher: Arc<dyn Searcher>,
}

impl LocalFs {
    /// Create a filesystem over `jail`, resolving relative paths against `workdir`.
    pub fn new(jail: Arc<PathJail>, workdir: Arc<WorkDir>) -> Self {
        Self {
            jail,
            workdir,
            searcher: Arc::new(GrepSearcher),
        }
    }

    /// Replace the search backend.
    pub fn with_searcher(mut self, searcher: Arc<dyn Searcher>) -> Self {
        self.searcher = searcher;
        self
    }

    /// The jail all operations go through.
    pub fn jail(&self) -> &PathJail {
        &self.jail
    }

    /// Current working directory.
    pub fn workdir(&self) -> PathBuf {
        self.workdir.get()
    }

    /// Resolve and validate a path.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, FsError> {
        self.jail.resolve(&self.workdir.get(), path)
    }

    /// Resolve a path without following a final symlink.
    ///
    /// The parent is validated; the last component is kept as given.
    fn resolve_no_follow(&self, path: &Path) -> Result<PathBuf, FsError> {
        let cwd = self.workdir.get();
        if path.as_os_str().is_empty() {
            return self.jail.resolve(&cwd, path);
        }
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        match (abs.parent(), abs.file_name()) {
            (Some(parent), Some(name)) => match self.jail.resolve(&cwd, parent) {
                Ok(dir) => Ok(dir.join(name)),
                // A root's parent lies outside the jail.
                Err(FsError::AccessDenied(_)) => {
                    let full = self.jail.resolve(&cwd, path)?;
                    if self.jail.roots().contains(&full) {
                        Ok(full)
                    } else {
                        Err(FsError::AccessDenied(full))
                    }
                }
                Err(e) => Err(e),
            },
            _ => self.jail.resolve(&cwd, path),
        }
    }

    /// Open a file.
    pub fn open(&self, path: impl AsRef<Path>, flags: OpenFlags) -> Result<File, FsError> {
        let resolved = self.resolve(path)?;
        flags
            .to_options()
            .open(&resolved)
            .map_err(|e| FsError::from_io(resolved, e))
    }

    /// Read a whole file.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, FsError> {
        let resolved = self.resolve(path)?;
        if resolved.is_dir() {
            return Err(FsError::NotAFile(resolved));
        }
        std::fs::read(&resolved).map_err(|e| FsError::from_io(resolved, e))
    }

    /// Write a whole file, creating missing parent directories.
    pub fn write(&self, path: impl AsRef<Path>, content: &[u8]) -> Result<(), FsError> {
        let resolved = self.resolve(path)?;
        if resolved.is_dir() {
            return Err(FsError::NotAFile(resolved));
        }
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&resolved, content).map_err(|e| FsError::from_io(resolved, e))
    }

    /// List one directory, sorted by name.
    pub fn list(&self, path: impl AsRef<Path>) -> Result<Vec<DirEntry>, FsError> {
        let resolved = self.resolve(path)?;
        let meta = std::fs::metadata(&resolved).map_err(|e| FsError::from_io(&resolved, e))?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(resolved));
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&resolved)? {
            let entry = entry?;
            let kind = entry
                .file_type()
                .map(EntryKind::from)
                .unwrap_or(EntryKind::Other);
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                size,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Create a directory and any missing parents.
    pub fn create_dir(&self, path: impl AsRef<Path>) -> Result<(), FsError> {
        let resolved = self.resolve(path)?;
        if std::fs::symlink_metadata(&resolved).is_ok() {
            return Err(FsError::AlreadyExists(resolved));
        }
        std::fs::create_dir_all(&resolved).map_err(|e| FsError::from_io(resolved, e))
    }

    /// Metadata, following symlinks.
    pub fn stat(&self, path: impl AsRef<Path>) -> Result<FileInfo, FsError> {
        let resolved = self.resolve(path)?;
        let meta = std::fs::metadata(&resolved).map_err(|e| FsError::from_io(&resolved, e))?;
        Ok(FileInfo::from_metadata(resolved, &meta))
    }

    /// Metadata of the path itself; a final symlink is not followed.
    pub fn lstat(&self, path: impl AsRef<Path>) -> Result<FileInfo, FsError> {
        let resolved = self.resolve_no_follow(path.as_ref())?;
        let meta =
            std::fs::symlink_metadata(&resolved).map_err(|e| FsError::from_io(&resolved, e))?;
        Ok(FileInfo::from_metadata(resolved, &meta))
    }

    /// Recursive directory tree bounded by `max_depth`.
    ///
    /// Symlinks are skipped unless `follow_symlinks` is set, and then only
    /// descended into when their target lies inside the jail.
    pub fn tree(
        &self,
        path: impl AsRef<Path>,
        max_depth: usize,
        follow_symlinks: bool,
    ) -> Result<TreeNode, FsError> {
        let resolved = self.resolve(path)?;
        if !resolved.is_dir() {
            return Err(FsError::NotADirectory(resolved));
        }
        let walker = TreeWalker {
            jail: &self.jail,
            max_depth,
            follow_symlinks,
        };
        walker
            .build(&resolved, 0)
            .map_err(|e| FsError::from_io(resolved, e))
    }

    /// Copy a file or directory tree.
    ///
    /// Permission bits are preserved; symlinks inside a copied directory are skipped.
    pub fn copy(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<(), FsError> {
        let src = self.resolve(src)?;
        let dst = self.resolve(dst)?;
        self.copy_resolved(&src, &dst)
    }

    fn copy_resolved(&self, src: &Path, dst: &Path) -> Result<(), FsError> {
        let meta = std::fs::metadata(src).map_err(|e| FsError::from_io(src, e))?;
        if !meta.is_dir() {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(src, dst).map_err(|e| FsError::from_io(src, e))?;
            return Ok(());
        }

        if dst.starts_with(src) {
            return Err(FsError::PathInvalid(format!(
                "cannot copy {} into itself",
                src.display()
            )));
        }
        std::fs::create_dir_all(dst)?;
        std::fs::set_permissions(dst, meta.permissions())?;

        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                debug!(path = %entry.path().display(), "copy: skipping symlink");
                continue;
            }
            // Re-validate: the destination may already hold symlinks.
            let child_dst = self.jail.resolve(dst, entry.file_name())?;
            self.copy_resolved(&entry.path(), &child_dst)?;
        }
        Ok(())
    }

    /// Delete a file, symlink or directory.
    ///
    /// A non-empty directory requires `recursive`.
    pub fn delete(&self, path: impl AsRef<Path>, recursive: bool) -> Result<(), FsError> {
        let resolved = self.resolve_no_follow(path.as_ref())?;
        if self.jail.roots().contains(&resolved) {
            return Err(FsError::AccessDenied(resolved));
        }
        let meta =
            std::fs::symlink_metadata(&resolved).map_err(|e| FsError::from_io(&resolved, e))?;
        if !meta.is_dir() {
            return std::fs::remove_file(&resolved).map_err(|e| FsError::from_io(resolved, e));
        }

        let empty = std::fs::read_dir(&resolved)?.next().is_none();
        if empty {
            std::fs::remove_dir(&resolved)?;
        } else if recursive {
            std::fs::remove_dir_all(&resolved)?;
        } else {
            return Err(FsError::NotEmptyOrNotRecursive(resolved));
        }
        Ok(())
    }

    /// Move `src` to `dst`, creating the destination's parent if missing.
    pub fn rename(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<(), FsError> {
        let src = self.resolve_no_follow(src.as_ref())?;
        if std::fs::symlink_metadata(&src).is_err() {
            return Err(FsError::NotFound(src));
        }
        // Replace a symlink at the destination rather than its target.
        let dst = self.resolve_no_follow(dst.as_ref())?;
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&src, &dst).map_err(|e| FsError::from_io(src, e))
    }

    /// Replace `find` with `replace` in a file, returning the number of replacements.
    pub fn edit_file(
        &self,
        path: impl AsRef<Path>,
        find: &str,
        replace: &str,
        opts: EditOptions,
    ) -> Result<usize, FsError> {
        let resolved = self.resolve(path)?;
        if resolved.is_dir() {
            return Err(FsError::NotAFile(resolved));
        }
        let content =
            std::fs::read_to_string(&resolved).map_err(|e| FsError::from_io(&resolved, e))?;

        let (modified, count) = if opts.regex {
            let re = regex_lite::Regex::new(find)
                .map_err(|e| FsError::InvalidPattern(e.to_string()))?;
            if opts.all_occurrences {
                let count = re.find_iter(&content).count();
                (re.replace_all(&content, replace).into_owned(), count)
            } else {
                let count = usize::from(re.is_match(&content));
                (re.replacen(&content, 1, replace).into_owned(), count)
            }
        } else {
            if find.is_empty() {
                return Err(FsError::InvalidPattern("empty search string".into()));
            }
            if opts.all_occurrences {
                (content.replace(find, replace), content.matches(find).count())
            } else {
                let count = usize::from(content.contains(find));
                (content.replacen(find, replace, 1), count)
            }
        };

        if count > 0 {
            std::fs::write(&resolved, modified)?;
        }
        debug!(path = %resolved.display(), count, "edit_file");
        Ok(count)
    }

    /// Read several files at once.
    ///
    /// Each path is validated on its own; a failure is recorded for that
    /// entry and the rest of the batch is still read. An empty batch or one
    /// larger than [`MAX_BATCH_FILES`] fails as a whole.
    pub fn read_multiple_files<P: AsRef<Path>>(
        &self,
        paths: &[P],
    ) -> Result<Vec<BatchRead>, FsError> {
        if paths.is_empty() {
            return Err(FsError::PathInvalid("no files specified".to_string()));
        }
        if paths.len() > MAX_BATCH_FILES {
            return Err(FsError::TooManyFiles {
                requested: paths.len(),
                max: MAX_BATCH_FILES,
            });
        }
        Ok(paths
            .iter()
            .map(|path| {
                let content = self.read(path);
                if let Err(e) = &content {
                    debug!(path = %path.as_ref().display(), error = %e, "batch read: skipping");
                }
                BatchRead {
                    path: path.as_ref().to_path_buf(),
                    content,
                }
            })
            .collect())
    }

    /// Read a line range, optionally numbered.
    pub fn read_file(&self, path: impl AsRef<Path>, opts: &ReadOptions) -> Result<String, FsError> {
        let bytes = self.read(path)?;
        read_lines(&String::from_utf8_lossy(&bytes), opts)
    }

    /// Search file contents under `path`.
    pub fn search(
        &self,
        path: impl AsRef<Path>,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchMatch>, FsError> {
        let root = self.resolve(path)?;
        let matches = self.searcher.search(&root, &self.jail, opts)?;
        Ok(matches
            .into_iter()
            .filter(|m| match std::fs::canonicalize(&m.path) {
                Ok(real) if self.jail.contains(&real) => true,
                _ => {
                    debug!(path = %m.path.display(), "search: dropping match outside jail");
                    false
                }
            })
            .collect())
    }

    /// The configured root directories.
    pub fn list_roots(&self) -> Vec<PathBuf> {
        self.jail.roots().to_vec()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::fs;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        outside: PathBuf,
        fs: LocalFs,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let base = fs::canonicalize(tmp.path()).unwrap();
        let root = base.join("root");
        let outside = base.join("outside");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("secret.txt"), "secret").unwrap();

        let jail = Arc::new(PathJail::new([&root]).unwrap());
        let workdir = Arc::new(WorkDir::new(&root));
        Fixture {
            _tmp: tmp,
            fs: LocalFs::new(jail, workdir),
            root,
            outside,
        }
    }

    // ==================== Read/Write Tests ====================

    #[test]
    fn test_write_read_binary_round_trip() {
        let f = fixture();
        let data = b"abc\0def\0\xff";
        f.fs.write("bin.dat", data).unwrap();
        assert_eq!(f.fs.read("bin.dat").unwrap(), data);
        assert_eq!(fs::read(f.root.join("bin.dat")).unwrap(), data);
    }

    #[test]
    fn test_write_creates_parents() {
        let f = fixture();
        f.fs.write("a/b/c.txt", b"deep").unwrap();
        assert_eq!(fs::read_to_string(f.root.join("a/b/c.txt")).unwrap(), "deep");
    }

    #[test]
    fn test_write_onto_directory() {
        let f = fixture();
        fs::create_dir(f.root.join("dir")).unwrap();
        assert!(matches!(
            f.fs.write("dir", b"x").unwrap_err(),
            FsError::NotAFile(_)
        ));
    }

    #[test]
    fn test_escape_denied_without_mutation() {
        let f = fixture();
        let err = f.fs.write("../outside/secret.txt", b"pwned").unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));
        assert_eq!(
            fs::read_to_string(f.outside.join("secret.txt")).unwrap(),
            "secret"
        );

        let err = f.fs.read(f.outside.join("secret.txt")).unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_denied_without_mutation() {
        let f = fixture();
        std::os::unix::fs::symlink(&f.outside, f.root.join("out")).unwrap();

        assert!(matches!(
            f.fs.write("out/secret.txt", b"pwned").unwrap_err(),
            FsError::AccessDenied(_)
        ));
        assert!(matches!(
            f.fs.write("out/new.txt", b"pwned").unwrap_err(),
            FsError::AccessDenied(_)
        ));
        assert!(!f.outside.join("new.txt").exists());
        assert_eq!(
            fs::read_to_string(f.outside.join("secret.txt")).unwrap(),
            "secret"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_behind_missing_dotdot_denied() {
        let f = fixture();
        std::os::unix::fs::symlink(&f.outside, f.root.join("link")).unwrap();

        assert!(matches!(
            f.fs.resolve("missing/../link/secret.txt").unwrap_err(),
            FsError::AccessDenied(_)
        ));
        assert!(matches!(
            f.fs.read("missing/../link/secret.txt").unwrap_err(),
            FsError::AccessDenied(_)
        ));
        assert!(matches!(
            f.fs.write("missing/../link/pwned.txt", b"pwned").unwrap_err(),
            FsError::AccessDenied(_)
        ));
        assert!(!f.outside.join("pwned.txt").exists());
        assert!(!f.root.join("missing").exists());
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.fs.read("nope.txt").unwrap_err(),
            FsError::NotFound(_)
        ));
    }

    #[test]
    fn test_open_append() {
        use std::io::Write as _;

        let f = fixture();
        f.fs.write("log.txt", b"one\n").unwrap();
        let mut file = f.fs.open("log.txt", OpenFlags::append()).unwrap();
        file.write_all(b"two\n").unwrap();
        drop(file);
        assert_eq!(f.fs.read("log.txt").unwrap(), b"one\ntwo\n");
    }

    // ==================== Directory Tests ====================

    #[test]
    fn test_list_sorted() {
        let f = fixture();
        f.fs.write("b.txt", b"").unwrap();
        f.fs.write("a.txt", b"12").unwrap();
        f.fs.create_dir("c").unwrap();

        let entries = f.fs.list(".").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt", "c"]);
        assert_eq!(entries[0].size, 2);
        assert!(entries[2].is_dir());
    }

    #[test]
    fn test_list_file_is_not_directory() {
        let f = fixture();
        f.fs.write("a.txt", b"").unwrap();
        assert!(matches!(
            f.fs.list("a.txt").unwrap_err(),
            FsError::NotADirectory(_)
        ));
    }

    #[test]
    fn test_create_dir_existing() {
        let f = fixture();
        f.fs.create_dir("x/y").unwrap();
        assert!(f.root.join("x/y").is_dir());
        assert!(matches!(
            f.fs.create_dir("x/y").unwrap_err(),
            FsError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_delete_rules() {
        let f = fixture();
        f.fs.write("full/file.txt", b"x").unwrap();
        f.fs.create_dir("empty").unwrap();

        assert!(matches!(
            f.fs.delete("full", false).unwrap_err(),
            FsError::NotEmptyOrNotRecursive(_)
        ));
        assert!(f.root.join("full/file.txt").exists());

        f.fs.delete("empty", false).unwrap();
        assert!(!f.root.join("empty").exists());

        f.fs.delete("full", true).unwrap();
        assert!(!f.root.join("full").exists());
    }

    #[test]
    fn test_delete_root_denied() {
        let f = fixture();
        assert!(matches!(
            f.fs.delete(".", true).unwrap_err(),
            FsError::AccessDenied(_)
        ));
        assert!(f.root.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_delete_symlink_removes_link_only() {
        let f = fixture();
        f.fs.write("target.txt", b"keep").unwrap();
        std::os::unix::fs::symlink(f.root.join("target.txt"), f.root.join("link")).unwrap();

        f.fs.delete("link", false).unwrap();
        assert!(f.root.join("target.txt").exists());
        assert!(fs::symlink_metadata(f.root.join("link")).is_err());
    }

    #[test]
    fn test_rename_creates_parent() {
        let f = fixture();
        f.fs.write("a.txt", b"move me").unwrap();
        f.fs.rename("a.txt", "new/dir/b.txt").unwrap();
        assert!(!f.root.join("a.txt").exists());
        assert_eq!(fs::read(f.root.join("new/dir/b.txt")).unwrap(), b"move me");
    }

    #[test]
    fn test_rename_out_of_jail_denied() {
        let f = fixture();
        f.fs.write("a.txt", b"stay").unwrap();
        assert!(matches!(
            f.fs.rename("a.txt", f.outside.join("a.txt")).unwrap_err(),
            FsError::AccessDenied(_)
        ));
        assert!(f.root.join("a.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_rename_onto_symlink_replaces_link() {
        let f = fixture();
        f.fs.write("a.txt", b"new").unwrap();
        f.fs.write("target.txt", b"old").unwrap();
        std::os::unix::fs::symlink(f.root.join("target.txt"), f.root.join("link")).unwrap();

        f.fs.rename("a.txt", "link").unwrap();
        assert_eq!(fs::read(f.root.join("target.txt")).unwrap(), b"old");
        assert!(!fs::symlink_metadata(f.root.join("link")).unwrap().is_symlink());
        assert_eq!(fs::read(f.root.join("link")).unwrap(), b"new");

        std::os::unix::fs::symlink(f.outside.join("secret.txt"), f.root.join("out")).unwrap();
        f.fs.write("b.txt", b"pwned").unwrap();
        f.fs.rename("b.txt", "out").unwrap();
        assert_eq!(
            fs::read_to_string(f.outside.join("secret.txt")).unwrap(),
            "secret"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_preserves_mode_and_skips_symlinks() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        f.fs.write("src/run.sh", b"#!/bin/sh\n").unwrap();
        fs::set_permissions(f.root.join("src/run.sh"), fs::Permissions::from_mode(0o750)).unwrap();
        fs::set_permissions(f.root.join("src"), fs::Permissions::from_mode(0o711)).unwrap();
        std::os::unix::fs::symlink(&f.outside, f.root.join("src/out")).unwrap();

        f.fs.copy("src", "dst").unwrap();

        let mode = |p: &str| fs::metadata(f.root.join(p)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode("dst/run.sh"), 0o750);
        assert_eq!(mode("dst"), 0o711);
        assert!(fs::symlink_metadata(f.root.join("dst/out")).is_err());
    }

    // ==================== Metadata Tests ====================

    #[cfg(unix)]
    #[test]
    fn test_stat_and_lstat() {
        let f = fixture();
        f.fs.write("real.txt", b"12345").unwrap();
        std::os::unix::fs::symlink("real.txt", f.root.join("alias")).unwrap();

        let info = f.fs.stat("alias").unwrap();
        assert!(info.is_file);
        assert!(!info.is_symlink);
        assert_eq!(info.size, 5);
        assert_eq!(info.name, "real.txt");

        let info = f.fs.lstat("alias").unwrap();
        assert!(info.is_symlink);
        assert_eq!(info.name, "alias");
    }

    #[cfg(unix)]
    #[test]
    fn test_lstat_link_in_outside_dir_denied() {
        let f = fixture();
        std::os::unix::fs::symlink(&f.outside, f.root.join("out")).unwrap();
        assert!(matches!(
            f.fs.lstat("out/secret.txt").unwrap_err(),
            FsError::AccessDenied(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_tree_depth_and_symlinks() {
        let f = fixture();
        f.fs.write("a/b/c/deep.txt", b"x").unwrap();
        f.fs.write("top.txt", b"xyz").unwrap();
        std::os::unix::fs::symlink(&f.outside, f.root.join("escape")).unwrap();
        std::os::unix::fs::symlink(f.root.join("a"), f.root.join("inner")).unwrap();

        let tree = f.fs.tree(".", 2, false).unwrap();
        assert!(tree.child("escape").is_none());
        assert!(tree.child("inner").is_none());
        assert_eq!(tree.child("top.txt").unwrap().size, Some(3));
        let b = tree.child("a").unwrap().child("b").unwrap();
        assert!(b.children.is_empty());

        let tree = f.fs.tree(".", 2, true).unwrap();
        assert!(tree.child("escape").is_none());
        assert!(tree.child("inner").unwrap().child("b").is_some());

        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["type"], "directory");
    }

    // ==================== Edit/Read Tests ====================

    #[test]
    fn test_edit_file_literal_all() {
        let f = fixture();
        f.fs.write("fruit.txt", b"banana").unwrap();
        let count = f
            .fs
            .edit_file("fruit.txt", "a", "b", EditOptions::default())
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(f.fs.read("fruit.txt").unwrap(), b"bbnbnb");
    }

    #[test]
    fn test_edit_file_first_only_and_no_match() {
        let f = fixture();
        f.fs.write("fruit.txt", b"banana").unwrap();
        let opts = EditOptions {
            all_occurrences: false,
            regex: false,
        };
        assert_eq!(f.fs.edit_file("fruit.txt", "an", "AN", opts).unwrap(), 1);
        assert_eq!(f.fs.read("fruit.txt").unwrap(), b"bANana");
        assert_eq!(f.fs.edit_file("fruit.txt", "zz", "y", opts).unwrap(), 0);
    }

    #[test]
    fn test_edit_file_regex() {
        let f = fixture();
        f.fs.write("v.txt", b"v1 v22 v333").unwrap();
        let opts = EditOptions {
            all_occurrences: true,
            regex: true,
        };
        assert_eq!(f.fs.edit_file("v.txt", r"v(\d+)", "n$1", opts).unwrap(), 3);
        assert_eq!(f.fs.read("v.txt").unwrap(), b"n1 n22 n333");
        assert!(matches!(
            f.fs.edit_file("v.txt", "(", "x", opts).unwrap_err(),
            FsError::InvalidPattern(_)
        ));
    }

    #[test]
    fn test_read_file_ranges() {
        let f = fixture();
        f.fs.write("three.txt", b"one\ntwo\nthree\n").unwrap();
        let opts = ReadOptions {
            offset: 5,
            limit: Some(10),
            numbered: false,
        };
        assert!(matches!(
            f.fs.read_file("three.txt", &opts).unwrap_err(),
            FsError::OffsetOutOfRange { .. }
        ));

        let opts = ReadOptions {
            offset: 1,
            limit: None,
            numbered: true,
        };
        assert_eq!(
            f.fs.read_file("three.txt", &opts).unwrap(),
            "   2\ttwo\n   3\tthree"
        );
    }

    #[test]
    fn test_read_multiple_files_reports_per_path() {
        let f = fixture();
        f.fs.write("a.txt", b"alpha").unwrap();
        f.fs.create_dir("dir").unwrap();
        let secret = f.outside.join("secret.txt");
        let paths = [
            PathBuf::from("a.txt"),
            PathBuf::from("missing.txt"),
            PathBuf::from("dir"),
            secret.clone(),
        ];

        let batch = f.fs.read_multiple_files(&paths).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0].path, PathBuf::from("a.txt"));
        assert_eq!(batch[0].content.as_ref().unwrap(), b"alpha");
        assert!(matches!(batch[1].content, Err(FsError::NotFound(_))));
        assert!(matches!(batch[2].content, Err(FsError::NotAFile(_))));
        assert!(matches!(batch[3].content, Err(FsError::AccessDenied(_))));
        assert_eq!(batch[3].path, secret);
    }

    #[test]
    fn test_read_multiple_files_batch_limits() {
        let f = fixture();
        assert!(matches!(
            f.fs.read_multiple_files::<&str>(&[]).unwrap_err(),
            FsError::PathInvalid(_)
        ));

        let paths = vec!["a.txt"; MAX_BATCH_FILES + 1];
        assert!(matches!(
            f.fs.read_multiple_files(&paths).unwrap_err(),
            FsError::TooManyFiles { requested: 51, max: 50 }
        ));
        let paths = vec!["a.txt"; MAX_BATCH_FILES];
        assert_eq!(f.fs.read_multiple_files(&paths).unwrap().len(), MAX_BATCH_FILES);
    }

    // ==================== Search Tests ====================

    #[cfg(unix)]
    #[test]
    fn test_search_drops_matches_outside_jail() {
        let f = fixture();
        f.fs.write("in.txt", b"needle\n").unwrap();
        fs::write(f.outside.join("out.txt"), "needle\n").unwrap();
        std::os::unix::fs::symlink(&f.outside, f.root.join("out")).unwrap();

        let opts = SearchOptions {
            follow: true,
            ..SearchOptions::new("needle")
        };
        let found = f.fs.search(".", &opts).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, f.root.join("in.txt"));
    }

    #[test]
    fn test_list_roots() {
        let f = fixture();
        assert_eq!(f.fs.list_roots(), vec![f.root.clone()]);
    }
}
