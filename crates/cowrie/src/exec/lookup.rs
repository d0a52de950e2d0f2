//! Program lookup along `PATH`.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Why a program could not be located.
#[derive(Debug, Error)]
pub enum LookupError {
    /// No candidate exists
    #[error("{0}: command not found")]
    NotFound(String),
    /// A candidate exists but is a directory or lacks execute permission
    #[error("{}: permission denied", .0.display())]
    NotExecutable(PathBuf),
}

/// Find the program `name` relative to `dir` using the `PATH` in `env`.
///
/// Names containing `/` are resolved against `dir` directly. Empty `PATH`
/// entries stand for `dir`. Without a `PATH`, only such names resolve.
pub fn look_path(dir: &Path, env: &[(String, String)], name: &str) -> Result<PathBuf, LookupError> {
    if name.is_empty() {
        return Err(LookupError::NotFound(name.to_string()));
    }
    if name.contains('/') {
        let candidate = dir.join(name);
        return check_executable(&candidate).map(|()| candidate);
    }

    let path_var = env
        .iter()
        .rev()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.as_str())
        .unwrap_or_default();

    if path_var.is_empty() {
        return Err(LookupError::NotFound(name.to_string()));
    }

    let mut denied = None;
    for entry in path_var.split(':') {
        let base = if entry.is_empty() {
            dir.to_path_buf()
        } else {
            dir.join(entry)
        };
        let candidate = base.join(name);
        match check_executable(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e @ LookupError::NotExecutable(_)) => {
                denied.get_or_insert(e);
            }
            Err(LookupError::NotFound(_)) => {}
        }
    }
    Err(denied.unwrap_or_else(|| LookupError::NotFound(name.to_string())))
}

fn check_executable(path: &Path) -> Result<(), LookupError> {
    let meta = std::fs::metadata(path)
        .map_err(|_| LookupError::NotFound(path.display().to_string()))?;
    if meta.is_dir() || !is_executable(&meta) {
        return Err(LookupError::NotExecutable(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    meta.is_file()
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_path_search_order() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("a")).unwrap();
        std::fs::create_dir(tmp.path().join("b")).unwrap();
        script(&tmp.path().join("a"), "tool", 0o644);
        let expected = script(&tmp.path().join("b"), "tool", 0o755);

        let env = vec![("PATH".to_string(), "a:b".to_string())];
        assert_eq!(look_path(tmp.path(), &env, "tool").unwrap(), expected);
    }

    #[test]
    fn test_slash_names_and_empty_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let expected = script(tmp.path(), "local", 0o755);

        assert_eq!(look_path(tmp.path(), &[], "./local").unwrap(), tmp.path().join("./local"));
        let env = vec![("PATH".to_string(), ":/nonexistent".to_string())];
        assert_eq!(look_path(tmp.path(), &env, "local").unwrap(), expected);
    }

    #[test]
    fn test_missing_and_not_executable() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "plain", 0o644);
        let env = vec![("PATH".to_string(), tmp.path().display().to_string())];

        assert!(matches!(
            look_path(tmp.path(), &env, "nope").unwrap_err(),
            LookupError::NotFound(_)
        ));
        assert!(matches!(
            look_path(tmp.path(), &env, "plain").unwrap_err(),
            LookupError::NotExecutable(_)
        ));
        assert!(matches!(
            look_path(tmp.path(), &[], "plain").unwrap_err(),
            LookupError::NotFound(_)
        ));
    }
}
