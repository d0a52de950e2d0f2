//! Cowrie: sandboxed shell execution
//!
//! Cowrie runs shell scripts against a jailed view of the host. Every path a
//! script touches is resolved through a [`PathJail`] so it can never reach
//! outside a fixed set of root directories, common coreutils run in-process
//! against that jail, and every other command becomes a supervised child
//! process that is interrupted, then killed, when the run is cancelled.
//!
//! The main entry point is [`Session`]:
//!
//! ```rust,ignore
//! use cowrie::Session;
//!
//! let session = Session::builder().root("/srv/project").build()?;
//! let status = session.run_script("for f in *.rs; do wc -l $f; done").await?;
//! ```
//!
//! The lower layers are usable on their own: [`LocalFs`] for jailed file
//! operations, [`VirtualOs`] for the per-session environment, and
//! [`HandlerChain`] for composing exec handlers.

pub mod builtins;
mod cancel;
mod config;
pub mod exec;
pub mod handler;
pub mod interp;
pub mod io;
mod session;
pub mod vfs;
mod vos;

pub use builtins::{Builtin, BuiltinContext, BuiltinDispatcher, BuiltinRegistry};
pub use cancel::CancelToken;
pub use config::{ConfigError, SessionConfig};
pub use exec::{ExecError, ExecSupervisor, ExitStatus};
pub use handler::{
    CommandPolicy, CommandPolicyBuilder, ExecHandler, HandlerChain, HandlerContext, Outcome,
};
pub use io::{Input, Output, Stdio};
pub use session::{Session, SessionBuilder, SessionError};
pub use vfs::{DirEntry, FileInfo, FsError, LocalFs, PathJail, WorkDir};
pub use vos::{ExitFn, VirtualOs};
