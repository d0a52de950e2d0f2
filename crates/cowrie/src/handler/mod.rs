//! Hooks the interpreter calls into, and the exec handler chain.
//!
//! The interpreter is configured with exactly four hooks:
//!
//! - **open**, **read_dir**, **stat**: delegated to the jailed [`LocalFs`](crate::LocalFs)
//!   by [`FsHooks`]
//! - **exec**: a [`HandlerChain`] of exec stages, typically an optional
//!   pre-handler, the [`BuiltinDispatcher`](crate::BuiltinDispatcher), and
//!   the [`ExecSupervisor`](crate::ExecSupervisor) as terminal fallback
//!
//! A stage either handles a command (stopping the chain, whatever the
//! result) or passes it to the next stage.

mod fs;
mod policy;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::cancel::CancelToken;
use crate::exec::{ExecError, ExitStatus};
use crate::io::Stdio;

pub use fs::{FsHooks, OpenHandler, ReadDirHandler, StatHandler};
pub use policy::{CommandPolicy, CommandPolicyBuilder, PolicyDecision};

/// Per-command state handed to exec stages.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Working directory of the calling interpreter
    pub dir: PathBuf,
    /// Exported environment of the calling interpreter
    pub env: Vec<(String, String)>,
    /// Streams attached to the command
    pub stdio: Stdio,
    /// Cancellation token of the run
    pub cancel: CancelToken,
}

impl HandlerContext {
    /// Value of an exported variable.
    pub fn getenv(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// What an exec stage did with a command.
#[derive(Debug)]
pub enum Outcome {
    /// Not mine; try the next stage
    Pass,
    /// Handled, with the command's result
    Handled(Result<ExitStatus, ExecError>),
}

impl Outcome {
    /// Handled with a plain exit status.
    pub fn status(status: ExitStatus) -> Self {
        Self::Handled(Ok(status))
    }

    /// Whether the command was handled.
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled(_))
    }
}

/// One stage of the exec chain.
#[async_trait]
pub trait ExecHandler: Send + Sync {
    /// Handle `args` (`args[0]` is the command name) or pass.
    async fn handle(&self, ctx: &HandlerContext, args: &[String]) -> Outcome;
}

#[async_trait]
impl<T: ExecHandler + ?Sized> ExecHandler for Arc<T> {
    async fn handle(&self, ctx: &HandlerContext, args: &[String]) -> Outcome {
        (**self).handle(ctx, args).await
    }
}

/// Ordered, immutable sequence of exec stages.
#[derive(Clone, Default)]
pub struct HandlerChain {
    stages: Vec<Arc<dyn ExecHandler>>,
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl HandlerChain {
    /// An empty chain; every command passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn with(mut self, stage: Arc<dyn ExecHandler>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[async_trait]
impl ExecHandler for HandlerChain {
    async fn handle(&self, ctx: &HandlerContext, args: &[String]) -> Outcome {
        for (i, stage) in self.stages.iter().enumerate() {
            let outcome = stage.handle(ctx, args).await;
            if outcome.is_handled() {
                trace!(stage = i, command = ?args.first(), "exec handled");
                return outcome;
            }
        }
        Outcome::Pass
    }
}
