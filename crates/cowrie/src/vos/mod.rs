//! Virtual process environment.
//!
//! A [`VirtualOs`] is the per-session stand-in for the host process state a
//! shell normally mutates: the working directory, the environment, and
//! process exit. None of it leaks into the host process.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, info};

use crate::vfs::{FsError, PathJail, WorkDir};

/// Callback invoked by [`VirtualOs::exit`].
pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

/// Per-session working directory, environment and exit hook.
pub struct VirtualOs {
    jail: Arc<PathJail>,
    workdir: Arc<WorkDir>,
    env: RwLock<HashMap<String, Value>>,
    on_exit: ExitFn,
}

impl std::fmt::Debug for VirtualOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualOs")
            .field("workdir", &self.workdir.get())
            .field("env_len", &self.env.read().map(|e| e.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl VirtualOs {
    /// Create an environment with an empty variable map.
    pub fn new(jail: Arc<PathJail>, workdir: Arc<WorkDir>) -> Self {
        Self {
            jail,
            workdir,
            env: RwLock::new(HashMap::new()),
            on_exit: Arc::new(|code| info!(code, "exit requested")),
        }
    }

    /// Replace the exit callback.
    pub fn with_exit_handler(mut self, on_exit: ExitFn) -> Self {
        self.on_exit = on_exit;
        self
    }

    /// Change the session working directory.
    ///
    /// The target must resolve inside the jail and be an existing directory.
    pub fn chdir(&self, path: impl AsRef<std::path::Path>) -> Result<(), FsError> {
        let resolved = self.jail.resolve(&self.workdir.get(), path)?;
        let meta = std::fs::metadata(&resolved).map_err(|e| FsError::from_io(&resolved, e))?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(resolved));
        }
        debug!(dir = %resolved.display(), "chdir");
        self.workdir.set(resolved);
        Ok(())
    }

    /// Current session working directory.
    pub fn getwd(&self) -> PathBuf {
        self.workdir.get()
    }

    /// An unstarted process with the session environment and working directory.
    pub fn command(&self, program: impl AsRef<OsStr>) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(program);
        cmd.env_clear()
            .envs(self.export_env_pairs())
            .current_dir(self.workdir.get());
        cmd
    }

    /// The environment flattened to `NAME=value` strings.
    ///
    /// Strings, numbers and booleans render as-is; anything else as JSON.
    /// Order is unspecified.
    pub fn export_env(&self) -> Vec<String> {
        self.export_env_pairs()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }

    pub(crate) fn export_env_pairs(&self) -> Vec<(String, String)> {
        let env = self.env.read().unwrap_or_else(PoisonError::into_inner);
        env.iter().map(|(k, v)| (k.clone(), stringify(v))).collect()
    }

    /// A snapshot of the environment map.
    pub fn environ(&self) -> HashMap<String, Value> {
        self.env
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Look up one variable.
    pub fn getenv(&self, name: &str) -> Option<Value> {
        self.env
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Set a variable.
    pub fn setenv(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.env
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into());
    }

    /// Remove a variable, returning its previous value.
    pub fn unsetenv(&self, name: &str) -> Option<Value> {
        self.env
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Report a requested exit to the callback.
    pub fn exit(&self, code: i32) {
        (self.on_exit)(code);
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
