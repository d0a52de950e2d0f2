//! Path jail: confines resolved paths to a set of root directories.

use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use super::FsError;

/// Upper bound on dangling symlinks followed while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

/// Working directory shared between the process environment and the filesystem.
///
/// Relative paths given to [`LocalFs`](super::LocalFs) resolve against this
/// directory. It only changes through [`VirtualOs::chdir`](crate::VirtualOs::chdir),
/// which validates the new directory through the jail first.
#[derive(Debug)]
pub struct WorkDir(RwLock<PathBuf>);

impl WorkDir {
    /// Create a working directory handle.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self(RwLock::new(dir.into()))
    }

    /// Current working directory.
    pub fn get(&self) -> PathBuf {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set(&self, dir: PathBuf) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = dir;
    }
}

/// Validates paths against an ordered, non-empty set of canonical roots.
///
/// Membership is checked component-wise, so a root of `/tmp/foo` admits
/// `/tmp/foo/bar` but not `/tmp/foobar`.
#[derive(Debug, Clone)]
pub struct PathJail {
    roots: Vec<PathBuf>,
}

impl PathJail {
    /// Create a jail from root directories.
    ///
    /// Each root is canonicalized; duplicates are dropped keeping the first
    /// occurrence. An empty root set is [`FsError::NoRoots`].
    pub fn new<I, P>(roots: I) -> Result<Self, FsError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut canonical: Vec<PathBuf> = Vec::new();
        for root in roots {
            let root = root.as_ref();
            let resolved = std::fs::canonicalize(root)
                .map_err(|e| FsError::PathInvalid(format!("root {}: {e}", root.display())))?;
            if !resolved.is_dir() {
                return Err(FsError::NotADirectory(resolved));
            }
            if !canonical.contains(&resolved) {
                canonical.push(resolved);
            }
        }

        if canonical.is_empty() {
            return Err(FsError::NoRoots);
        }
        debug!(roots = ?canonical, "path jail configured");
        Ok(Self { roots: canonical })
    }

    /// The canonical root set, in configuration order.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Whether an absolute, already-resolved path lies within a root.
    pub fn contains(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }

    /// Resolve `raw` against `cwd` and validate the result.
    ///
    /// Existing paths come back fully symlink-resolved. For paths that do not
    /// exist yet, the nearest existing ancestor is resolved and validated and
    /// the remaining components are appended.
    pub fn resolve(&self, cwd: &Path, raw: impl AsRef<Path>) -> Result<PathBuf, FsError> {
        let abs = absolutize(cwd, raw.as_ref())?;
        self.resolve_absolute(abs, 0)
    }

    fn resolve_absolute(&self, abs: PathBuf, hops: usize) -> Result<PathBuf, FsError> {
        if let Ok(real) = std::fs::canonicalize(&abs) {
            return self.admit(real);
        }

        let components: Vec<Component<'_>> = abs.components().collect();
        for keep in (1..=components.len()).rev() {
            let prefix: PathBuf = components[..keep].iter().collect();
            let tail = &components[keep..];

            if keep < components.len()
                && let Ok(real) = std::fs::canonicalize(&prefix)
            {
                if !self.contains(&real) {
                    debug!(
                        path = %abs.display(),
                        ancestor = %real.display(),
                        "ancestor outside jail"
                    );
                    return Err(FsError::AccessDenied(real));
                }
                let joined = append_normalized(real, tail);
                // `..` may step back onto existing entries, symlinks included.
                if tail.contains(&Component::ParentDir) {
                    return self.resolve_absolute(joined, hops + 1);
                }
                return self.admit(joined);
            }

            // A dangling symlink: validate where it points instead.
            if let Ok(meta) = std::fs::symlink_metadata(&prefix)
                && meta.file_type().is_symlink()
            {
                if hops >= MAX_SYMLINK_HOPS {
                    return Err(FsError::PathInvalid(format!(
                        "{}: too many levels of symbolic links",
                        abs.display()
                    )));
                }
                let target = std::fs::read_link(&prefix)?;
                let base = prefix.parent().unwrap_or_else(|| Path::new("/"));
                let mut next = base.join(target);
                next.extend(tail.iter());
                return self.resolve_absolute(next, hops + 1);
            }
        }

        Err(FsError::PathMissingParent(abs))
    }

    fn admit(&self, path: PathBuf) -> Result<PathBuf, FsError> {
        if self.contains(&path) {
            Ok(path)
        } else {
            debug!(path = %path.display(), "path outside jail");
            Err(FsError::AccessDenied(path))
        }
    }
}

fn absolutize(cwd: &Path, raw: &Path) -> Result<PathBuf, FsError> {
    if raw.as_os_str().is_empty() {
        return Err(FsError::PathInvalid("empty path".to_string()));
    }
    if raw.is_absolute() {
        return Ok(raw.to_path_buf());
    }
    if !cwd.is_absolute() {
        return Err(FsError::PathInvalid(format!(
            "{}: working directory {} is not absolute",
            raw.display(),
            cwd.display()
        )));
    }
    if raw == Path::new(".") || raw.as_os_str() == "./" {
        return Ok(cwd.to_path_buf());
    }
    Ok(cwd.join(raw))
}

/// Append components that do not exist on disk, resolving `.` and `..` lexically.
fn append_normalized(mut base: PathBuf, tail: &[Component<'_>]) -> PathBuf {
    for component in tail {
        match component {
            Component::Normal(part) => base.push(part),
            Component::ParentDir => {
                base.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    base
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::fs;

    fn setup() -> (tempfile::TempDir, PathBuf, PathJail) {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("foo")).unwrap();
        fs::create_dir(tmp.path().join("foobar")).unwrap();
        fs::write(tmp.path().join("foobar/secret.txt"), b"secret").unwrap();
        let root = fs::canonicalize(tmp.path().join("foo")).unwrap();
        let jail = PathJail::new([&root]).unwrap();
        (tmp, root, jail)
    }

    // ==================== Construction Tests ====================

    #[test]
    fn test_empty_roots_rejected() {
        let err = PathJail::new(Vec::<PathBuf>::new()).unwrap_err();
        assert!(matches!(err, FsError::NoRoots));
    }

    #[test]
    fn test_missing_root_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = PathJail::new([tmp.path().join("nope")]).unwrap_err();
        assert!(matches!(err, FsError::PathInvalid(_)));
    }

    #[test]
    fn test_duplicate_roots_collapsed() {
        let (_tmp, root, _) = setup();
        let jail = PathJail::new([root.clone(), root.join("."), root.clone()]).unwrap();
        assert_eq!(jail.roots(), &[root]);
    }

    // ==================== Boundary Tests ====================

    #[test]
    fn test_sibling_with_shared_prefix_denied() {
        let (_tmp, root, jail) = setup();
        let sibling = root.parent().unwrap().join("foobar");

        let err = jail.resolve(&root, &sibling).unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));

        let err = jail.resolve(&root, sibling.join("secret.txt")).unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));
    }

    #[test]
    fn test_child_of_root_accepted() {
        let (_tmp, root, jail) = setup();
        let resolved = jail.resolve(&root, root.join("bar")).unwrap();
        assert_eq!(resolved, root.join("bar"));
    }

    #[test]
    fn test_root_itself_accepted() {
        let (_tmp, root, jail) = setup();
        assert_eq!(jail.resolve(&root, &root).unwrap(), root);
    }

    // ==================== Relative Path Tests ====================

    #[test]
    fn test_relative_path_uses_cwd() {
        let (_tmp, root, jail) = setup();
        fs::create_dir(root.join("sub")).unwrap();
        let resolved = jail.resolve(&root.join("sub"), "file.txt").unwrap();
        assert_eq!(resolved, root.join("sub/file.txt"));
    }

    #[test]
    fn test_dot_is_cwd() {
        let (_tmp, root, jail) = setup();
        fs::create_dir(root.join("sub")).unwrap();
        assert_eq!(jail.resolve(&root.join("sub"), ".").unwrap(), root.join("sub"));
        assert_eq!(jail.resolve(&root.join("sub"), "./").unwrap(), root.join("sub"));
    }

    #[test]
    fn test_dotdot_escape_denied() {
        let (_tmp, root, jail) = setup();
        let err = jail.resolve(&root, "../foobar/secret.txt").unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));
    }

    #[test]
    fn test_dotdot_escape_through_missing_dirs_denied() {
        let (_tmp, root, jail) = setup();
        let err = jail.resolve(&root, "new/dir/../../../escape.txt").unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));
    }

    #[test]
    fn test_dotdot_inside_missing_dirs_normalized() {
        let (_tmp, root, jail) = setup();
        let resolved = jail.resolve(&root, "a/b/../c.txt").unwrap();
        assert_eq!(resolved, root.join("a/c.txt"));
    }

    #[test]
    fn test_empty_path_invalid() {
        let (_tmp, root, jail) = setup();
        assert!(matches!(
            jail.resolve(&root, "").unwrap_err(),
            FsError::PathInvalid(_)
        ));
    }

    #[test]
    fn test_relative_cwd_invalid() {
        let (_tmp, _root, jail) = setup();
        assert!(matches!(
            jail.resolve(Path::new("relative"), "file").unwrap_err(),
            FsError::PathInvalid(_)
        ));
    }

    // ==================== Symlink Tests ====================

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_denied() {
        let (_tmp, root, jail) = setup();
        let outside = root.parent().unwrap().join("foobar");
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let err = jail.resolve(&root, "link/secret.txt").unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));

        // Creating a new file through the link is denied too.
        let err = jail.resolve(&root, "link/new.txt").unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));
        assert!(!outside.join("new.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_behind_missing_dotdot_denied() {
        let (_tmp, root, jail) = setup();
        let outside = root.parent().unwrap().join("foobar");
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let err = jail.resolve(&root, "missing/../link/secret.txt").unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));
        let err = jail.resolve(&root, "a/b/../../link/new.txt").unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));

        fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();
        let resolved = jail.resolve(&root, "missing/../alias/new.txt").unwrap();
        assert_eq!(resolved, root.join("real/new.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_resolves_to_target() {
        let (_tmp, root, jail) = setup();
        fs::create_dir(root.join("real")).unwrap();
        fs::write(root.join("real/data.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();

        let resolved = jail.resolve(&root, "alias/data.txt").unwrap();
        assert_eq!(resolved, root.join("real/data.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_outward_denied() {
        let (_tmp, root, jail) = setup();
        let outside = root.parent().unwrap().join("foobar/created.txt");
        std::os::unix::fs::symlink(&outside, root.join("dangle")).unwrap();

        let err = jail.resolve(&root, "dangle").unwrap_err();
        assert!(matches!(err, FsError::AccessDenied(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_inward_accepted() {
        let (_tmp, root, jail) = setup();
        std::os::unix::fs::symlink("later.txt", root.join("pending")).unwrap();

        let resolved = jail.resolve(&root, "pending").unwrap();
        assert_eq!(resolved, root.join("later.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_rejected() {
        let (_tmp, root, jail) = setup();
        std::os::unix::fs::symlink("b", root.join("a")).unwrap();
        std::os::unix::fs::symlink("a", root.join("b")).unwrap();

        let err = jail.resolve(&root, "a").unwrap_err();
        assert!(matches!(err, FsError::PathInvalid(_)));
    }

    // ==================== WorkDir Tests ====================

    #[test]
    fn test_workdir_set_get() {
        let dir = WorkDir::new("/a");
        assert_eq!(dir.get(), PathBuf::from("/a"));
        dir.set(PathBuf::from("/b"));
        assert_eq!(dir.get(), PathBuf::from("/b"));
    }
}
