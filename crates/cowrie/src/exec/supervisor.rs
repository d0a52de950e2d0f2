//! Process lifecycle: lookup, start, watch, escalate, translate.

use std::io::Write as _;
use std::process::Stdio as ProcessStdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::{ExecError, ExitStatus, ProcessState, look_path};
use crate::cancel::CancelToken;
use crate::handler::{ExecHandler, HandlerContext, Outcome};
use crate::io::{Input, Output, Stdio};
use crate::vos::VirtualOs;

/// Grace period between interrupt and kill when no maximum timeout is configured.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// How long stdio pumps may keep draining after a cancelled process is gone.
const CANCELLED_DRAIN: Duration = Duration::from_millis(100);

/// How long stdio pumps may keep draining after a process exits on its own.
const EXITED_DRAIN: Duration = Duration::from_secs(1);

/// Final state and result of one supervised exec.
#[derive(Debug)]
pub struct Supervision {
    /// Terminal process state
    pub state: ProcessState,
    /// Exit status, or why there is none
    pub result: Result<ExitStatus, ExecError>,
}

/// Runs external programs under timeout/interrupt/kill escalation.
#[derive(Debug, Clone)]
pub struct ExecSupervisor {
    os: Arc<VirtualOs>,
    kill_timeout: Duration,
}

struct Tracker<'a> {
    program: &'a str,
    state: ProcessState,
}

impl Tracker<'_> {
    fn enter(&mut self, next: ProcessState) {
        debug!(program = self.program, from = ?self.state, to = ?next, "process state");
        self.state = next;
    }

    fn finish(mut self, next: ProcessState, result: Result<ExitStatus, ExecError>) -> Supervision {
        self.enter(next);
        Supervision {
            state: self.state,
            result,
        }
    }
}

impl ExecSupervisor {
    /// Create a supervisor spawning through `os`.
    ///
    /// `max_timeout` replaces [`DEFAULT_KILL_TIMEOUT`] as the grace period
    /// between interrupt and kill; zero kills immediately on cancellation.
    pub fn new(os: Arc<VirtualOs>, max_timeout: Option<Duration>) -> Self {
        Self {
            os,
            kill_timeout: max_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT),
        }
    }

    /// Grace period between interrupt and kill.
    pub fn kill_timeout(&self) -> Duration {
        self.kill_timeout
    }

    /// Run `args` to completion or cancellation.
    pub async fn supervise(&self, ctx: &HandlerContext, args: &[String]) -> Supervision {
        let program = args.first().map(String::as_str).unwrap_or_default();
        let mut tracker = Tracker {
            program,
            state: ProcessState::NotStarted,
        };

        let path = match look_path(&ctx.dir, &ctx.env, program) {
            Ok(path) => path,
            Err(e) => {
                diagnostic(&ctx.stdio.stderr, &e.to_string());
                return tracker.finish(ProcessState::LookupFailed, Ok(ExitStatus::NOT_FOUND));
            }
        };

        let (stdin, stdout, stderr) = match child_stdio(&ctx.stdio) {
            Ok(stdio) => stdio,
            Err(e) => {
                diagnostic(&ctx.stdio.stderr, &format!("{program}: {e}"));
                return tracker.finish(ProcessState::StartFailed, Ok(ExitStatus::NOT_FOUND));
            }
        };
        let mut cmd = self.os.command(&path);
        cmd.args(&args[1..])
            .env_clear()
            .envs(ctx.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&ctx.dir)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.arg0(program);

        let spawned = cmd.spawn();
        // Pipe ends duplicated for the child must not stay open here.
        drop(cmd);
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                diagnostic(&ctx.stdio.stderr, &format!("{program}: {e}"));
                return tracker.finish(ProcessState::StartFailed, Ok(ExitStatus::NOT_FOUND));
            }
        };
        tracker.enter(ProcessState::Running);
        info!(program, pid = child.id(), "process started");

        let mut pumps = Vec::new();
        if let (Input::Bytes(data), Some(mut stdin)) = (&ctx.stdio.stdin, child.stdin.take()) {
            let data = data.clone();
            pumps.push(tokio::spawn(async move {
                // A child that exits without reading closes the pipe; that is fine.
                let _ = stdin.write_all(&data).await;
            }));
        }
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, ctx.stdio.stdout.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, ctx.stdio.stderr.clone())));
        }

        let (waited, escalation) = self.watch(&mut child, &ctx.cancel).await;

        // Background descendants may hold the streams open after the child
        // is gone, so draining is bounded.
        let drain = async {
            for pump in pumps.iter_mut() {
                let _ = pump.await;
            }
        };
        let drained = if escalation.is_some() {
            tokio::time::timeout(CANCELLED_DRAIN, drain).await.is_ok()
        } else {
            tokio::select! {
                drained = tokio::time::timeout(EXITED_DRAIN, drain) => drained.is_ok(),
                () = ctx.cancel.cancelled() => false,
            }
        };
        if !drained {
            debug!(program, "streams still open after exit, abandoning them");
            pumps.iter().for_each(|p| p.abort());
        }

        let (state, result) = translate(program, waited, escalation, &ctx.stdio.stderr);
        tracker.finish(state, result)
    }

    /// Wait for the child or the cancellation token.
    ///
    /// Returns the wait result and, when cancellation escalated, the state
    /// reached: [`ProcessState::Interrupted`] or [`ProcessState::Killed`].
    async fn watch(
        &self,
        child: &mut Child,
        cancel: &CancelToken,
    ) -> (std::io::Result<std::process::ExitStatus>, Option<ProcessState>) {
        tokio::select! {
            status = child.wait() => return (status, None),
            () = cancel.cancelled() => {}
        }

        if self.kill_timeout.is_zero() || !cfg!(unix) || !interrupt(child) {
            debug!("cancelled: killing immediately");
            let _ = child.start_kill();
            return (child.wait().await, Some(ProcessState::Killed));
        }

        debug!(grace = ?self.kill_timeout, "cancelled: interrupt sent");
        match tokio::time::timeout(self.kill_timeout, child.wait()).await {
            Ok(status) => (status, Some(ProcessState::Interrupted)),
            Err(_) => {
                warn!(grace = ?self.kill_timeout, "process ignored interrupt, killing");
                let _ = child.start_kill();
                (child.wait().await, Some(ProcessState::Killed))
            }
        }
    }
}

#[async_trait]
impl ExecHandler for ExecSupervisor {
    async fn handle(&self, ctx: &HandlerContext, args: &[String]) -> Outcome {
        Outcome::Handled(self.supervise(ctx, args).await.result)
    }
}

/// How the process ended, as a terminal state and shell status.
fn translate(
    program: &str,
    waited: std::io::Result<std::process::ExitStatus>,
    escalation: Option<ProcessState>,
    stderr: &Output,
) -> (ProcessState, Result<ExitStatus, ExecError>) {
    let status = match waited {
        Ok(status) => status,
        Err(e) => {
            warn!(program, error = %e, "wait failed");
            diagnostic(stderr, &format!("{program}: lost track of process"));
            return (ProcessState::Completed, Ok(ExitStatus::FAILURE));
        }
    };

    if let Some(code) = status.code() {
        info!(program, code, "process exited");
        return (ProcessState::Completed, Ok(ExitStatus(code)));
    }

    match escalation {
        Some(state) => {
            info!(program, ?state, "process stopped on cancellation");
            (state, Err(ExecError::Cancelled))
        }
        None => {
            let signal = exit_signal(&status);
            info!(program, signal, "process terminated by signal");
            (
                ProcessState::SignaledExit,
                Ok(ExitStatus::from_signal(signal)),
            )
        }
    }
}

/// Child streams for `stdio`. Pipes are handed to the child directly so it
/// sees end of file and broken pipes the way it would under a shell.
fn child_stdio(stdio: &Stdio) -> std::io::Result<(ProcessStdio, ProcessStdio, ProcessStdio)> {
    let stdin = match &stdio.stdin {
        Input::Null => ProcessStdio::null(),
        Input::Inherit => ProcessStdio::inherit(),
        Input::Bytes(_) => ProcessStdio::piped(),
        Input::Pipe(reader) => reader.try_clone()?.into(),
    };
    let output = |out: &Output| -> std::io::Result<ProcessStdio> {
        Ok(match out.pipe_writer() {
            Some(writer) => writer?.into(),
            None => ProcessStdio::piped(),
        })
    };
    Ok((stdin, output(&stdio.stdout)?, output(&stdio.stderr)?))
}

async fn pump(mut reader: impl AsyncRead + Unpin, out: Output) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if out.write_bytes(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
}

fn diagnostic(stderr: &Output, message: &str) {
    let mut stderr = stderr.clone();
    let _ = writeln!(stderr, "{message}");
}

#[cfg(unix)]
fn interrupt(child: &Child) -> bool {
    let Some(pid) = child.id().and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
    // to a child we have not reaped yet.
    unsafe { libc::kill(pid, libc::SIGINT) == 0 }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> bool {
    false
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or_default()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> i32 {
    0
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::time::Instant;

    use crate::io::{SharedBuffer, Stdio};
    use crate::vfs::{PathJail, WorkDir};

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        os: Arc<VirtualOs>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let jail = Arc::new(PathJail::new([&root]).unwrap());
        let os = Arc::new(VirtualOs::new(jail, Arc::new(WorkDir::new(&root))));
        Fixture {
            _tmp: tmp,
            root,
            os,
        }
    }

    fn ctx(dir: &std::path::Path) -> (HandlerContext, SharedBuffer, SharedBuffer) {
        let (stdio, out, err) = Stdio::captured();
        let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string());
        let ctx = HandlerContext {
            dir: dir.to_path_buf(),
            env: vec![("PATH".to_string(), path)],
            stdio,
            cancel: CancelToken::new(),
        };
        (ctx, out, err)
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_lookup_failure() {
        let f = fixture();
        let sup = ExecSupervisor::new(f.os.clone(), None);
        let (ctx, _out, err) = ctx(&f.root);

        let run = sup.supervise(&ctx, &args(&["no-such-program-xyz"])).await;
        assert_eq!(run.state, ProcessState::LookupFailed);
        assert!(matches!(run.result, Ok(ExitStatus(127))));
        assert!(err.to_string_lossy().contains("no-such-program-xyz"));
    }

    #[tokio::test]
    async fn test_start_failure() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        let script = f.root.join("broken");
        std::fs::write(&script, "#!/nonexistent/interpreter\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let sup = ExecSupervisor::new(f.os.clone(), None);
        let (ctx, _out, err) = ctx(&f.root);
        let run = sup.supervise(&ctx, &args(&["./broken"])).await;
        assert_eq!(run.state, ProcessState::StartFailed);
        assert!(matches!(run.result, Ok(ExitStatus(127))));
        assert!(!err.contents().is_empty());
    }

    #[tokio::test]
    async fn test_exit_code_and_streams() {
        let f = fixture();
        let sup = ExecSupervisor::new(f.os.clone(), None);
        let (ctx, out, err) = ctx(&f.root);

        let run = sup
            .supervise(&ctx, &args(&["sh", "-c", "echo out; echo err >&2; exit 3"]))
            .await;
        assert_eq!(run.state, ProcessState::Completed);
        assert!(matches!(run.result, Ok(ExitStatus(3))));
        assert_eq!(out.to_string_lossy(), "out\n");
        assert_eq!(err.to_string_lossy(), "err\n");
    }

    #[tokio::test]
    async fn test_context_env_dir_and_stdin() {
        let f = fixture();
        std::fs::create_dir(f.root.join("sub")).unwrap();
        f.os.setenv("SESSION_ONLY", "ignored");
        let sup = ExecSupervisor::new(f.os.clone(), None);
        let (mut ctx, out, _err) = ctx(&f.root.join("sub"));
        ctx.env.push(("GREETING".into(), "hi".into()));
        ctx.stdio.stdin = Input::bytes("piped");

        let script = r#"echo "$GREETING ${SESSION_ONLY:-unset} $(pwd)"; cat"#;
        let run = sup.supervise(&ctx, &args(&["sh", "-c", script])).await;
        assert!(matches!(run.result, Ok(ExitStatus(0))));
        assert_eq!(
            out.to_string_lossy(),
            format!("hi unset {}\npiped", f.root.join("sub").display())
        );
    }

    #[tokio::test]
    async fn test_signal_exit_translated() {
        let f = fixture();
        let sup = ExecSupervisor::new(f.os.clone(), None);
        let (ctx, _out, _err) = ctx(&f.root);

        let run = sup
            .supervise(&ctx, &args(&["sh", "-c", "kill -TERM $$"]))
            .await;
        assert_eq!(run.state, ProcessState::SignaledExit);
        assert!(matches!(run.result, Ok(ExitStatus(143))));
    }

    #[tokio::test]
    async fn test_cancel_interrupts() {
        let f = fixture();
        let sup = ExecSupervisor::new(f.os.clone(), Some(Duration::from_secs(10)));
        let (ctx, _out, _err) = ctx(&f.root);

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let run = sup.supervise(&ctx, &args(&["sleep", "30"])).await;
        assert_eq!(run.state, ProcessState::Interrupted);
        assert!(matches!(run.result, Err(ExecError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_kills_after_grace() {
        let f = fixture();
        let sup = ExecSupervisor::new(f.os.clone(), Some(Duration::from_millis(200)));
        let (ctx, _out, _err) = ctx(&f.root);

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let run = sup
            .supervise(&ctx, &args(&["sh", "-c", "trap '' INT; exec sleep 30"]))
            .await;
        assert_eq!(run.state, ProcessState::Killed);
        assert!(matches!(run.result, Err(ExecError::Cancelled)));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_zero_grace_kills_immediately() {
        let f = fixture();
        let sup = ExecSupervisor::new(f.os.clone(), Some(Duration::ZERO));
        let (ctx, _out, _err) = ctx(&f.root);
        ctx.cancel.cancel();

        let run = sup
            .supervise(&ctx, &args(&["sh", "-c", "trap '' INT; exec sleep 30"]))
            .await;
        assert_eq!(run.state, ProcessState::Killed);
        assert!(matches!(run.result, Err(ExecError::Cancelled)));
    }

    #[tokio::test]
    async fn test_background_descendant_does_not_hold_exec() {
        let f = fixture();
        let sup = ExecSupervisor::new(f.os.clone(), None);
        let (ctx, out, _err) = ctx(&f.root);

        let started = Instant::now();
        let run = sup
            .supervise(&ctx, &args(&["sh", "-c", "sleep 30 & echo started"]))
            .await;
        assert_eq!(run.state, ProcessState::Completed);
        assert!(matches!(run.result, Ok(ExitStatus(0))));
        assert_eq!(out.to_string_lossy(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_pipe_handed_to_child() {
        let f = fixture();
        let sup = ExecSupervisor::new(f.os.clone(), None);
        let (mut ctx, _out, _err) = ctx(&f.root);
        let (input, output) = crate::io::pipe().unwrap();
        ctx.stdio.stdout = output;

        let reader = std::thread::spawn(move || input.read_all().unwrap());
        let run = sup
            .supervise(&ctx, &args(&["sh", "-c", "echo through"]))
            .await;
        assert!(matches!(run.result, Ok(ExitStatus(0))));
        drop(ctx);
        assert_eq!(reader.join().unwrap(), b"through\n");
    }

    #[test]
    fn test_wait_failure_becomes_status() {
        let (stderr, err) = Output::buffer();
        let (state, result) = translate(
            "tool",
            Err(std::io::Error::other("no child")),
            None,
            &stderr,
        );
        assert_eq!(state, ProcessState::Completed);
        assert!(matches!(result, Ok(ExitStatus::FAILURE)));
        assert_eq!(err.to_string_lossy(), "tool: lost track of process\n");
    }

    #[test]
    fn test_translate_exit_forms() {
        use std::os::unix::process::ExitStatusExt;

        let stderr = Output::null();
        let exited = std::process::ExitStatus::from_raw(2 << 8);
        let (state, result) = translate("tool", Ok(exited), None, &stderr);
        assert_eq!(state, ProcessState::Completed);
        assert!(matches!(result, Ok(ExitStatus(2))));

        let killed = std::process::ExitStatus::from_raw(libc::SIGKILL);
        let (state, result) = translate("tool", Ok(killed), Some(ProcessState::Killed), &stderr);
        assert_eq!(state, ProcessState::Killed);
        assert!(matches!(result, Err(ExecError::Cancelled)));
    }

    #[tokio::test]
    async fn test_default_grace() {
        let f = fixture();
        assert_eq!(
            ExecSupervisor::new(f.os.clone(), None).kill_timeout(),
            DEFAULT_KILL_TIMEOUT
        );
    }
}
