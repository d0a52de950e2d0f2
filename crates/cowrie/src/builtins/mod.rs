//! In-process coreutils.
//!
//! These builtins replace common Unix utilities so scripts can use them
//! without spawning a process. They only ever touch the filesystem through
//! the jailed [`LocalFs`] in their [`BuiltinContext`].

mod cat;
mod fileops;
mod head;
mod ls;
mod names;
mod tac;
mod tail;
mod wc;

pub use cat::CatCommand;
pub use fileops::{CpCommand, MkdirCommand, MvCommand, RmCommand, TouchCommand};
pub use head::HeadCommand;
pub use ls::LsCommand;
pub use names::{BasenameCommand, DirnameCommand};
pub use tac::TacCommand;
pub use tail::TailCommand;
pub use wc::WcCommand;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::{self, Read, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::exec::{ExecError, ExitStatus};
use crate::handler::{ExecHandler, HandlerContext, Outcome};
use crate::io::{Output, Stdio};
use crate::vfs::{FsError, LocalFs};

/// Capabilities handed to a builtin: its streams, the caller's working
/// directory and the jailed filesystem.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinContext<'a> {
    /// Streams attached to the command
    pub stdio: &'a Stdio,
    /// Working directory of the caller
    pub dir: &'a Path,
    /// Jailed filesystem
    pub fs: &'a LocalFs,
}

impl BuiltinContext<'_> {
    /// Standard output.
    pub fn stdout(&self) -> Output {
        self.stdio.stdout.clone()
    }

    /// Standard error.
    pub fn stderr(&self) -> Output {
        self.stdio.stderr.clone()
    }

    /// An argument as a path, relative ones joined onto the working directory.
    pub fn path(&self, arg: &str) -> PathBuf {
        let path = Path::new(arg);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }

    /// Contents of a file argument; `-` reads standard input.
    pub fn read_input(&self, arg: &str) -> Result<Vec<u8>, FsError> {
        if arg == "-" {
            Ok(self.stdio.stdin.read_all()?)
        } else {
            self.fs.read(self.path(arg))
        }
    }

    /// A reader over a file argument; `-` streams standard input.
    pub fn open_input(&self, arg: &str) -> Result<Box<dyn Read + Send>, FsError> {
        if arg == "-" {
            Ok(self.stdio.stdin.reader())
        } else {
            Ok(Box::new(io::Cursor::new(self.fs.read(self.path(arg))?)))
        }
    }

    /// Write `command: subject: error` to standard error.
    pub fn report(&self, command: &str, subject: &str, err: impl Display) -> io::Result<()> {
        writeln!(self.stderr(), "{command}: {subject}: {err}")
    }
}

/// An in-process command.
pub trait Builtin: Send + Sync {
    /// Run with `args` (`args[0]` is the command name).
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus>;
}

/// Registry of builtins by command name.
#[derive(Clone, Default)]
pub struct BuiltinRegistry {
    builtins: BTreeMap<String, Arc<dyn Builtin>>,
}

impl std::fmt::Debug for BuiltinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinRegistry")
            .field("names", &self.builtins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BuiltinRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every builtin in this module.
    pub fn with_defaults() -> Self {
        Self::new()
            .with("basename", Arc::new(BasenameCommand))
            .with("cat", Arc::new(CatCommand))
            .with("cp", Arc::new(CpCommand))
            .with("dirname", Arc::new(DirnameCommand))
            .with("head", Arc::new(HeadCommand))
            .with("ls", Arc::new(LsCommand))
            .with("mkdir", Arc::new(MkdirCommand))
            .with("mv", Arc::new(MvCommand))
            .with("rm", Arc::new(RmCommand))
            .with("tac", Arc::new(TacCommand))
            .with("tail", Arc::new(TailCommand))
            .with("touch", Arc::new(TouchCommand))
            .with("wc", Arc::new(WcCommand))
    }

    /// Register (or replace) a builtin.
    pub fn with(mut self, name: impl Into<String>, builtin: Arc<dyn Builtin>) -> Self {
        self.builtins.insert(name.into(), builtin);
        self
    }

    /// Look up a builtin.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Builtin>> {
        self.builtins.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builtins.keys().map(String::as_str)
    }
}

/// Exec stage running registered builtins; passes on unknown names.
#[derive(Debug, Clone)]
pub struct BuiltinDispatcher {
    registry: Arc<BuiltinRegistry>,
    fs: LocalFs,
}

impl BuiltinDispatcher {
    /// Dispatch `registry` builtins over `fs`.
    pub fn new(registry: Arc<BuiltinRegistry>, fs: LocalFs) -> Self {
        Self { registry, fs }
    }

    /// The registry consulted.
    pub fn registry(&self) -> &BuiltinRegistry {
        &self.registry
    }
}

#[async_trait]
impl ExecHandler for BuiltinDispatcher {
    async fn handle(&self, ctx: &HandlerContext, args: &[String]) -> Outcome {
        let Some(name) = args.first() else {
            return Outcome::Pass;
        };
        let Some(builtin) = self.registry.get(name) else {
            return Outcome::Pass;
        };
        if ctx.cancel.is_cancelled() {
            return Outcome::Handled(Err(ExecError::Cancelled));
        }

        debug!(builtin = %name, "running builtin");
        // Builtins block on pipes and host stdin, so they run on the
        // blocking pool and race the token.
        let run = tokio::task::spawn_blocking({
            let builtin = builtin.clone();
            let stdio = ctx.stdio.clone();
            let dir = ctx.dir.clone();
            let fs = self.fs.clone();
            let args = args.to_vec();
            move || {
                let bctx = BuiltinContext {
                    stdio: &stdio,
                    dir: &dir,
                    fs: &fs,
                };
                builtin.run(&bctx, &args)
            }
        });
        let result = tokio::select! {
            joined = run => joined,
            () = ctx.cancel.cancelled() => {
                debug!(builtin = %name, "builtin abandoned on cancellation");
                return Outcome::Handled(Err(ExecError::Cancelled));
            }
        };
        match result {
            Ok(Ok(status)) => Outcome::status(status),
            // Downstream stopped reading; a shell would see SIGPIPE here.
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                Outcome::status(ExitStatus::BROKEN_PIPE)
            }
            Ok(Err(e)) => {
                let _ = writeln!(ctx.stdio.stderr.clone(), "{name}: {e}");
                Outcome::status(ExitStatus::FAILURE)
            }
            Err(e) => {
                warn!(builtin = %name, error = %e, "builtin panicked");
                let _ = writeln!(ctx.stdio.stderr.clone(), "{name}: internal error");
                Outcome::status(ExitStatus::FAILURE)
            }
        }
    }
}

/// Split `-abc` style flags from operands. `--` ends option parsing and a
/// lone `-` is an operand.
fn split_flags(args: &[String]) -> (Vec<char>, Vec<String>) {
    let mut flags = Vec::new();
    let mut operands = Vec::new();
    let mut options_done = false;
    for arg in args.iter().skip(1) {
        if options_done || arg == "-" || !arg.starts_with('-') {
            operands.push(arg.clone());
        } else if arg == "--" {
            options_done = true;
        } else {
            flags.extend(arg.chars().skip(1));
        }
    }
    (flags, operands)
}
