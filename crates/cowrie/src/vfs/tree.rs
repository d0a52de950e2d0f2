//! Bounded recursive directory tree.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::PathJail;

/// Kind of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Regular file (or anything that is not a directory)
    File,
    /// Directory
    Directory,
}

/// A node in a directory tree, serializable as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    /// Base name
    pub name: String,
    /// Resolved absolute path
    pub path: PathBuf,
    /// Node kind
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Size in bytes, files only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Last modified time as Unix timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
    /// Children, sorted by name; empty beyond the depth bound
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Find a direct child by name.
    pub fn child(&self, name: &str) -> Option<&TreeNode> {
        self.children.iter().find(|c| c.name == name)
    }
}

pub(crate) struct TreeWalker<'a> {
    pub(crate) jail: &'a PathJail,
    pub(crate) max_depth: usize,
    pub(crate) follow_symlinks: bool,
}

impl TreeWalker<'_> {
    pub(crate) fn build(&self, path: &Path, depth: usize) -> std::io::Result<TreeNode> {
        let meta = std::fs::metadata(path)?;
        let mut node = TreeNode {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            path: path.to_path_buf(),
            kind: NodeKind::File,
            size: None,
            modified: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            children: Vec::new(),
        };

        if !meta.is_dir() {
            node.size = Some(meta.len());
            return Ok(node);
        }
        node.kind = NodeKind::Directory;
        if depth >= self.max_depth {
            return Ok(node);
        }

        let mut entries: Vec<_> = std::fs::read_dir(path)?.filter_map(Result::ok).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let mut child_path = entry.path();
            let is_symlink = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
            if is_symlink {
                if !self.follow_symlinks {
                    continue;
                }
                match std::fs::canonicalize(&child_path) {
                    Ok(target) if self.jail.contains(&target) => child_path = target,
                    Ok(target) => {
                        debug!(
                            link = %child_path.display(),
                            target = %target.display(),
                            "tree: skipping symlink outside jail"
                        );
                        continue;
                    }
                    Err(e) => {
                        debug!(
                            link = %child_path.display(),
                            error = %e,
                            "tree: skipping broken symlink"
                        );
                        continue;
                    }
                }
            }

            match self.build(&child_path, depth + 1) {
                Ok(mut child) => {
                    // Keep the link's own name for followed symlinks.
                    child.name = entry.file_name().to_string_lossy().into_owned();
                    node.children.push(child);
                }
                Err(e) => debug!(path = %child_path.display(), error = %e, "tree: skipping entry"),
            }
        }
        Ok(node)
    }
}
