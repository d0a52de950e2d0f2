//! Session API for running scripts in a sandbox.
//!
//! A [`Session`] wires the jailed filesystem, the virtual process
//! environment and the exec handler chain into the reference interpreter.
//!
//! # Example
//!
//! ```rust,ignore
//! use cowrie::Session;
//!
//! let session = Session::builder()
//!     .root("/home/user/code")
//!     .env("CI", true)
//!     .deny("curl")
//!     .build()?;
//!
//! let status = session.run_script("ls src | wc -l").await?;
//! assert!(status.is_success());
//! ```

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncRead, AsyncReadExt as _};
use tracing::{debug, info};

use crate::builtins::{BuiltinDispatcher, BuiltinRegistry};
use crate::cancel::CancelToken;
use crate::config::{ConfigError, SessionConfig};
use crate::exec::{ExecSupervisor, ExitStatus};
use crate::handler::{CommandPolicyBuilder, ExecHandler, FsHooks, HandlerChain};
use crate::interp::{Hooks, ParseError, Program, RunError, Runner, parse};
use crate::io::Stdio;
use crate::vfs::{FsError, LocalFs, PathJail, WorkDir};
use crate::vos::{ExitFn, VirtualOs};

/// Errors that end a session run
#[derive(Debug, Error)]
pub enum SessionError {
    /// Jail misconfiguration or a script that cannot be opened
    #[error(transparent)]
    Fs(#[from] FsError),
    /// The script does not parse
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The cancellation token fired
    #[error("run cancelled")]
    Cancelled,
    /// Reading input or writing output failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration file error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Builder for constructing a [`Session`].
///
/// # Example
///
/// ```rust,ignore
/// let session = Session::builder()
///     .root("/srv/project")
///     .root("/tmp/scratch")
///     .workdir("/srv/project/src")
///     .max_timeout(Duration::from_secs(5))
///     .build()?;
/// ```
pub struct SessionBuilder {
    roots: Vec<PathBuf>,
    workdir: Option<PathBuf>,
    max_timeout: Option<Duration>,
    env: Vec<(String, Value)>,
    deny: Vec<String>,
    pre_handler: Option<Arc<dyn ExecHandler>>,
    registry: Option<BuiltinRegistry>,
    on_exit: Option<ExitFn>,
    stdio: Option<Stdio>,
    cancel: Option<CancelToken>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("roots", &self.roots)
            .field("workdir", &self.workdir)
            .field("max_timeout", &self.max_timeout)
            .field("deny", &self.deny)
            .field("has_pre_handler", &self.pre_handler.is_some())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Create a builder with no roots and the default builtins.
    pub fn new() -> Self {
        Self {
            roots: Vec::new(),
            workdir: None,
            max_timeout: None,
            env: Vec::new(),
            deny: Vec::new(),
            pre_handler: None,
            registry: Some(BuiltinRegistry::with_defaults()),
            on_exit: None,
            stdio: None,
            cancel: None,
        }
    }

    /// Add a root directory to the jail.
    pub fn root(mut self, path: impl AsRef<Path>) -> Self {
        self.roots.push(path.as_ref().to_path_buf());
        self
    }

    /// Add several root directories.
    pub fn roots<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.roots
            .extend(paths.into_iter().map(|p| p.as_ref().to_path_buf()));
        self
    }

    /// Initial working directory; must lie inside the jail.
    ///
    /// Defaults to the first root.
    pub fn workdir(mut self, path: impl AsRef<Path>) -> Self {
        self.workdir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Grace period between interrupt and kill for cancelled processes.
    pub fn max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = Some(timeout);
        self
    }

    /// Seed a session environment variable.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Refuse commands matching a glob pattern.
    pub fn deny(mut self, pattern: impl Into<String>) -> Self {
        self.deny.push(pattern.into());
        self
    }

    /// Handler consulted before builtins and external processes.
    pub fn pre_handler(mut self, handler: Arc<dyn ExecHandler>) -> Self {
        self.pre_handler = Some(handler);
        self
    }

    /// Replace the builtin registry.
    pub fn builtins(mut self, registry: BuiltinRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run every command as an external process.
    pub fn without_builtins(mut self) -> Self {
        self.registry = None;
        self
    }

    /// Called with the code when a script runs `exit`.
    pub fn on_exit(mut self, f: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.on_exit = Some(Arc::new(f));
        self
    }

    /// Streams scripts run with; defaults to the host's.
    pub fn stdio(mut self, stdio: Stdio) -> Self {
        self.stdio = Some(stdio);
        self
    }

    /// Token that cancels every run of the session.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Apply a configuration. Values already set on the builder are
    /// extended (roots, env, deny) or replaced (everything else).
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.roots.extend(config.roots);
        if config.workdir.is_some() {
            self.workdir = config.workdir;
        }
        if config.max_timeout.is_some() {
            self.max_timeout = config.max_timeout;
        }
        self.env.extend(config.env);
        self.deny.extend(config.deny);
        if !config.builtins {
            self.registry = None;
        }
        self
    }

    /// Apply a JSON configuration file.
    pub fn config_file(self, path: impl AsRef<Path>) -> Result<Self, SessionError> {
        Ok(self.config(SessionConfig::from_file(path)?))
    }

    /// Build the session.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No root is configured, or a root is not an existing directory
    /// - The working directory is outside the jail or not a directory
    pub fn build(self) -> Result<Session, SessionError> {
        let jail = Arc::new(PathJail::new(&self.roots)?);
        let first_root = jail.roots()[0].clone();
        let workdir = Arc::new(WorkDir::new(first_root));

        let mut os = VirtualOs::new(jail.clone(), workdir.clone());
        if let Some(on_exit) = self.on_exit {
            os = os.with_exit_handler(on_exit);
        }
        if let Some(dir) = &self.workdir {
            os.chdir(dir)?;
        }
        for (name, value) in self.env {
            os.setenv(name, value);
        }
        let os = Arc::new(os);
        let fs = LocalFs::new(jail, workdir);

        let mut chain = HandlerChain::new();
        if !self.deny.is_empty() {
            let policy = self
                .deny
                .iter()
                .fold(CommandPolicyBuilder::new(), |b, pattern| b.deny(pattern))
                .build();
            chain = chain.with(Arc::new(policy));
        }
        if let Some(pre) = self.pre_handler {
            chain = chain.with(pre);
        }
        if let Some(registry) = self.registry {
            chain = chain.with(Arc::new(BuiltinDispatcher::new(
                Arc::new(registry),
                fs.clone(),
            )));
        }
        chain = chain.with(Arc::new(ExecSupervisor::new(os.clone(), self.max_timeout)));

        info!(
            roots = ?fs.list_roots(),
            workdir = %os.getwd().display(),
            stages = chain.len(),
            "session ready"
        );
        Ok(Session {
            hooks: Hooks::new(FsHooks::new(fs.clone()), Arc::new(chain)),
            os,
            fs,
            stdio: self.stdio.unwrap_or_else(Stdio::inherit),
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

/// A sandboxed shell session.
///
/// Every run starts a fresh interpreter seeded with the session environment
/// and working directory. Files are only reachable inside the jail and
/// commands go through the handler chain: pre-handler, builtins, then a
/// supervised external process.
pub struct Session {
    os: Arc<VirtualOs>,
    fs: LocalFs,
    hooks: Hooks,
    stdio: Stdio,
    cancel: CancelToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("os", &self.os)
            .field("roots", &self.fs.list_roots())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// The virtual process environment.
    pub fn os(&self) -> &Arc<VirtualOs> {
        &self.os
    }

    /// The jailed filesystem.
    pub fn fs(&self) -> &LocalFs {
        &self.fs
    }

    /// The session's cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn runner(&self) -> Runner {
        Runner::new(
            self.hooks.clone(),
            self.os.getwd(),
            self.os.export_env(),
            self.cancel.clone(),
        )
    }

    async fn execute(
        &self,
        runner: &mut Runner,
        program: &Program,
    ) -> Result<ExitStatus, SessionError> {
        match runner.run(program, &self.stdio).await {
            Ok(status) => Ok(status),
            Err(RunError::Exit(status)) => {
                info!(code = status.code(), "script called exit");
                self.os.exit(status.code());
                Ok(status)
            }
            Err(RunError::Cancelled) => Err(SessionError::Cancelled),
            Err(RunError::Io(e)) => Err(e.into()),
        }
    }

    /// Run a script given as text.
    pub async fn run_script(&self, script: &str) -> Result<ExitStatus, SessionError> {
        let program = parse(script)?;
        debug!(statements = program.body.len(), "running script");
        let mut runner = self.runner();
        self.execute(&mut runner, &program).await
    }

    /// Run a script file, opened through the jail.
    pub async fn run_path(&self, path: impl AsRef<Path>) -> Result<ExitStatus, SessionError> {
        let data = self.fs.read(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "running script file");
        self.run_script(&String::from_utf8_lossy(&data)).await
    }

    /// Read `input` to the end, then run it.
    pub async fn run_piped<R>(&self, mut input: R) -> Result<ExitStatus, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut data = Vec::new();
        tokio::select! {
            read = input.read_to_end(&mut data) => { read?; }
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
        }
        self.run_script(&String::from_utf8_lossy(&data)).await
    }

    /// Read-eval loop over `input`.
    ///
    /// Prints `$ ` before each statement and `> ` while a statement is
    /// incomplete. Errors are reported as `error: ...` and the loop goes on;
    /// it ends at end of input, on `exit`, or when the session is cancelled.
    pub async fn run_interactive<R>(&self, input: R) -> Result<ExitStatus, SessionError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut runner = self.runner();
        let mut pending = String::new();
        self.prompt("$ ")?;

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            };
            let Some(line) = line else {
                break;
            };
            pending.push_str(&line);
            pending.push('\n');

            match parse(&pending) {
                Err(ParseError::Incomplete) => {
                    self.prompt("> ")?;
                    continue;
                }
                Err(e) => writeln!(self.stdio.stderr.clone(), "error: {e}")?,
                Ok(program) => match runner.run(&program, &self.stdio).await {
                    Ok(_) => {}
                    Err(RunError::Exit(status)) => {
                        info!(code = status.code(), "interactive session exited");
                        self.os.exit(status.code());
                        return Ok(status);
                    }
                    Err(RunError::Cancelled) => return Err(SessionError::Cancelled),
                    Err(RunError::Io(e)) => writeln!(self.stdio.stderr.clone(), "error: {e}")?,
                },
            }
            pending.clear();
            self.prompt("$ ")?;
        }

        if !pending.trim().is_empty() {
            writeln!(self.stdio.stderr.clone(), "error: {}", ParseError::Incomplete)?;
        }
        Ok(runner.last_status())
    }

    fn prompt(&self, prompt: &str) -> std::io::Result<()> {
        self.stdio.stdout.write_bytes(prompt.as_bytes())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicI32, Ordering};

    use crate::io::SharedBuffer;

    fn session(root: &Path) -> (Session, SharedBuffer, SharedBuffer) {
        let (stdio, out, err) = Stdio::captured();
        let session = Session::builder().root(root).stdio(stdio).build().unwrap();
        (session, out, err)
    }

    #[test]
    fn test_build_requires_root() {
        assert!(matches!(
            Session::builder().build(),
            Err(SessionError::Fs(FsError::NoRoots))
        ));
    }

    #[test]
    fn test_workdir_must_be_inside_jail() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let result = Session::builder().root(&root).workdir(tmp.path()).build();
        assert!(matches!(
            result,
            Err(SessionError::Fs(FsError::AccessDenied(_)))
        ));
    }

    #[tokio::test]
    async fn test_session_env_and_workdir_seed_runs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("src")).unwrap();
        let (stdio, out, _) = Stdio::captured();
        let session = Session::builder()
            .root(tmp.path())
            .workdir("src")
            .env("COUNT", 3)
            .stdio(stdio)
            .build()
            .unwrap();

        session.run_script("echo $COUNT; pwd; cd ..").await.unwrap();
        session.run_script("pwd").await.unwrap();
        let src = std::fs::canonicalize(tmp.path().join("src")).unwrap();
        let expected = format!("3\n{}\n{}\n", src.display(), src.display());
        assert_eq!(out.to_string_lossy(), expected);
    }

    #[tokio::test]
    async fn test_exit_calls_callback() {
        let tmp = tempfile::tempdir().unwrap();
        let code = Arc::new(AtomicI32::new(-1));
        let seen = code.clone();
        let (stdio, _, _) = Stdio::captured();
        let session = Session::builder()
            .root(tmp.path())
            .stdio(stdio)
            .on_exit(move |c| seen.store(c, Ordering::SeqCst))
            .build()
            .unwrap();

        let status = session.run_script("exit 5; echo unreachable").await.unwrap();
        assert_eq!(status, ExitStatus(5));
        assert_eq!(code.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_run_path_is_jailed() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("hello.sh"), "echo hello from file\n").unwrap();
        std::fs::write(tmp.path().join("outside.sh"), "echo escaped\n").unwrap();
        let (session, out, _) = session(&root);

        session.run_path("hello.sh").await.unwrap();
        assert_eq!(out.to_string_lossy(), "hello from file\n");
        assert!(matches!(
            session.run_path("../outside.sh").await,
            Err(SessionError::Fs(FsError::AccessDenied(_)))
        ));
    }

    #[tokio::test]
    async fn test_run_interactive() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, out, err) = session(tmp.path());
        let input: &[u8] = b"x=1\nif true; then\necho $x\nfi\ntrue &\necho after\n";

        let status = session.run_interactive(input).await.unwrap();
        assert_eq!(status, ExitStatus::SUCCESS);
        assert_eq!(out.to_string_lossy(), "$ $ > > 1\n$ $ after\n$ ");
        assert!(err.to_string_lossy().starts_with("error: "));
    }

    #[tokio::test]
    async fn test_run_interactive_stops_on_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, out, _) = session(tmp.path());
        let input: &[u8] = b"echo one\nexit 2\necho two\n";

        let status = session.run_interactive(input).await.unwrap();
        assert_eq!(status, ExitStatus(2));
        assert_eq!(out.to_string_lossy(), "$ one\n$ ");
    }

    #[tokio::test]
    async fn test_run_piped() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, out, _) = session(tmp.path());
        let input: &[u8] = b"echo piped | cat\n";
        session.run_piped(input).await.unwrap();
        assert_eq!(out.to_string_lossy(), "piped\n");
    }

    #[tokio::test]
    async fn test_cancelled_session() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, _, _) = session(tmp.path());
        session.cancel_token().cancel();
        assert!(matches!(
            session.run_script("echo hi").await,
            Err(SessionError::Cancelled)
        ));
        let (_reader, writer) = tokio::io::duplex(64);
        let pending = tokio::io::BufReader::new(writer);
        assert!(matches!(
            session.run_interactive(pending).await,
            Err(SessionError::Cancelled)
        ));
    }
}
