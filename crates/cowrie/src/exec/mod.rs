//! Supervised execution of external programs.
//!
//! [`ExecSupervisor`] owns one external process per exec request: it looks
//! the program up, starts it with the session's environment, watches it
//! against the run's [`CancelToken`](crate::CancelToken), escalates from
//! interrupt to kill, and translates how the process ended into a shell
//! [`ExitStatus`].

mod lookup;
mod supervisor;

use thiserror::Error;

use crate::vfs::FsError;

pub use lookup::{LookupError, look_path};
pub use supervisor::{DEFAULT_KILL_TIMEOUT, ExecSupervisor, Supervision};

/// Shell-visible exit status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    /// Success
    pub const SUCCESS: Self = Self(0);
    /// Generic failure
    pub const FAILURE: Self = Self(1);
    /// Command found but not permitted to run
    pub const NOT_EXECUTABLE: Self = Self(126);
    /// Command not found or could not be started
    pub const NOT_FOUND: Self = Self(127);
    /// Wrote to a pipe nobody reads any more (SIGPIPE)
    pub const BROKEN_PIPE: Self = Self(128 + 13);

    /// Whether the status is zero.
    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// The numeric code.
    pub fn code(self) -> i32 {
        self.0
    }

    /// Status for a process killed by `signal`.
    pub fn from_signal(signal: i32) -> Self {
        Self(128 + signal)
    }
}

impl From<bool> for ExitStatus {
    fn from(ok: bool) -> Self {
        if ok { Self::SUCCESS } else { Self::FAILURE }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors an exec stage reports besides an exit status.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The run's cancellation token fired and the process was stopped
    #[error("run cancelled")]
    Cancelled,
    /// IO error while running the command
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Filesystem error
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Lifecycle of one supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Request received, nothing started
    NotStarted,
    /// Process spawned and being watched
    Running,
    /// Exited with a code
    Completed,
    /// Terminated by a signal not sent by the supervisor
    SignaledExit,
    /// Stopped by the interrupt sent on cancellation
    Interrupted,
    /// Force-killed on cancellation
    Killed,
    /// Program not found or not executable
    LookupFailed,
    /// Program found but could not be started
    StartFailed,
}

impl ProcessState {
    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }
}
