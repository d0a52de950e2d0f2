//! Statement execution against the four interpreter hooks.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use super::parser::{Program, Redirect, RedirectOp, SimpleCommand, Stmt, Word, WordPart, is_glob};
use crate::cancel::CancelToken;
use crate::exec::{ExecError, ExitStatus};
use crate::handler::{
    ExecHandler, FsHooks, HandlerContext, OpenHandler, Outcome, ReadDirHandler, StatHandler,
};
use crate::io::{Input, Output, Stdio, pipe};
use crate::vfs::OpenFlags;

/// Redirections to this path never reach the open hook.
const DEV_NULL: &str = "/dev/null";

/// Why a run stopped before its last statement.
#[derive(Debug, Error)]
pub enum RunError {
    /// `exit` was called
    #[error("exit {0}")]
    Exit(ExitStatus),
    /// The run's cancellation token fired
    #[error("run cancelled")]
    Cancelled,
    /// Writing to a stream failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The hooks through which the interpreter touches the outside world.
#[derive(Clone)]
pub struct Hooks {
    /// Opens redirection targets
    pub open: Arc<dyn OpenHandler>,
    /// Lists directories for pathname expansion
    pub read_dir: Arc<dyn ReadDirHandler>,
    /// Stats paths for `cd` and `test`
    pub stat: Arc<dyn StatHandler>,
    /// Runs every command that is not an interpreter builtin
    pub exec: Arc<dyn ExecHandler>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

impl Hooks {
    /// Filesystem hooks from `fs`, commands through `exec`.
    pub fn new(fs: FsHooks, exec: Arc<dyn ExecHandler>) -> Self {
        let fs = Arc::new(fs);
        Self {
            open: fs.clone(),
            read_dir: fs.clone(),
            stat: fs,
            exec,
        }
    }
}

#[derive(Debug, Clone)]
struct Var {
    value: String,
    exported: bool,
}

/// Text produced by expanding a word, split into runs that are or are not
/// subject to pathname expansion.
#[derive(Debug, Default)]
struct Expansion {
    segments: Vec<(String, bool)>,
}

impl Expansion {
    fn push(&mut self, text: String, glob_active: bool) {
        self.segments.push((text, glob_active));
    }

    fn text(&self) -> String {
        self.segments.iter().map(|(s, _)| s.as_str()).collect()
    }

    /// Split at the last `/` into the directory text and a pattern for the
    /// final component. `None` when an earlier component holds an active
    /// glob character.
    fn split_glob(&self) -> Option<(String, String)> {
        let text = self.text();
        let cut = text.rfind('/').map(|i| i + 1).unwrap_or(0);
        let meta = ['*', '?', '['];
        let mut pattern = String::new();
        let mut offset = 0;
        for (segment, active) in &self.segments {
            let start = offset;
            offset += segment.len();
            let (head, tail) = segment.split_at(cut.saturating_sub(start).min(segment.len()));
            if *active && head.contains(meta) {
                return None;
            }
            if *active {
                pattern.push_str(tail);
            } else {
                pattern.push_str(&glob::Pattern::escape(tail));
            }
        }
        Some((text[..cut].to_string(), pattern))
    }
}

/// Executes parsed programs.
///
/// A runner owns the interpreter state of one run: working directory,
/// variables and the last exit status. Subshells, pipeline stages and
/// command substitutions run on a clone, so their changes do not leak.
#[derive(Clone)]
pub struct Runner {
    hooks: Hooks,
    dir: PathBuf,
    vars: HashMap<String, Var>,
    last_status: ExitStatus,
    cancel: CancelToken,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("dir", &self.dir)
            .field("vars", &self.vars.len())
            .field("last_status", &self.last_status)
            .finish()
    }
}

impl Runner {
    /// A runner in `dir` whose variables are seeded from `NAME=value`
    /// strings, all exported.
    pub fn new(
        hooks: Hooks,
        dir: impl Into<PathBuf>,
        env: impl IntoIterator<Item = String>,
        cancel: CancelToken,
    ) -> Self {
        let vars = env
            .into_iter()
            .filter_map(|entry| {
                let (name, value) = entry.split_once('=')?;
                Some((
                    name.to_string(),
                    Var {
                        value: value.to_string(),
                        exported: true,
                    },
                ))
            })
            .collect();
        Self {
            hooks,
            dir: dir.into(),
            vars,
            last_status: ExitStatus::SUCCESS,
            cancel,
        }
    }

    /// Current working directory of the run.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Status of the last completed statement.
    pub fn last_status(&self) -> ExitStatus {
        self.last_status
    }

    /// Value of a shell variable.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|v| v.value.as_str())
    }

    /// Run a program, returning the status of its last statement.
    pub async fn run(&mut self, program: &Program, io: &Stdio) -> Result<ExitStatus, RunError> {
        self.exec_stmts(&program.body, io).await
    }

    fn exec_stmts<'a>(
        &'a mut self,
        stmts: &'a [Stmt],
        io: &'a Stdio,
    ) -> BoxFuture<'a, Result<ExitStatus, RunError>> {
        async move {
            let mut status = ExitStatus::SUCCESS;
            for stmt in stmts {
                status = self.exec_stmt(stmt, io).await?;
            }
            Ok(status)
        }
        .boxed()
    }

    fn exec_stmt<'a>(
        &'a mut self,
        stmt: &'a Stmt,
        io: &'a Stdio,
    ) -> BoxFuture<'a, Result<ExitStatus, RunError>> {
        async move {
            if self.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            let status = match stmt {
                Stmt::Simple(cmd) => self.exec_simple(cmd, io).await?,
                Stmt::Pipeline(stages) => self.exec_pipeline(stages, io).await?,
                Stmt::And(left, right) => {
                    let status = self.exec_stmt(left, io).await?;
                    if status.is_success() {
                        self.exec_stmt(right, io).await?
                    } else {
                        status
                    }
                }
                Stmt::Or(left, right) => {
                    let status = self.exec_stmt(left, io).await?;
                    if status.is_success() {
                        status
                    } else {
                        self.exec_stmt(right, io).await?
                    }
                }
                Stmt::Not(inner) => {
                    ExitStatus::from(!self.exec_stmt(inner, io).await?.is_success())
                }
                Stmt::Redirected { body, redirects } => match self.redirect(redirects, io).await? {
                    Ok(redirected) => self.exec_stmt(body, &redirected).await?,
                    Err(status) => status,
                },
                Stmt::Subshell(stmts) => {
                    let mut sub = self.clone();
                    contain_exit(sub.exec_stmts(stmts, io).await)?
                }
                Stmt::Group(stmts) => self.exec_stmts(stmts, io).await?,
                Stmt::If {
                    branches,
                    otherwise,
                } => self.exec_if(branches, otherwise.as_deref(), io).await?,
                Stmt::While {
                    until,
                    condition,
                    body,
                } => {
                    let mut status = ExitStatus::SUCCESS;
                    loop {
                        // Let the other pipeline stages run between iterations.
                        tokio::task::yield_now().await;
                        if self.cancel.is_cancelled() {
                            return Err(RunError::Cancelled);
                        }
                        if self.exec_stmts(condition, io).await?.is_success() == *until {
                            break;
                        }
                        status = self.exec_stmts(body, io).await?;
                    }
                    status
                }
                Stmt::For { var, items, body } => {
                    let mut values = Vec::new();
                    for item in items {
                        values.extend(self.fields(item, io).await?);
                    }
                    let mut status = ExitStatus::SUCCESS;
                    for value in values {
                        tokio::task::yield_now().await;
                        self.set_var(var, value);
                        status = self.exec_stmts(body, io).await?;
                    }
                    status
                }
            };
            self.last_status = status;
            Ok(status)
        }
        .boxed()
    }

    async fn exec_if(
        &mut self,
        branches: &[(Vec<Stmt>, Vec<Stmt>)],
        otherwise: Option<&[Stmt]>,
        io: &Stdio,
    ) -> Result<ExitStatus, RunError> {
        for (condition, body) in branches {
            if self.exec_stmts(condition, io).await?.is_success() {
                return self.exec_stmts(body, io).await;
            }
        }
        match otherwise {
            Some(body) => self.exec_stmts(body, io).await,
            None => Ok(ExitStatus::SUCCESS),
        }
    }

    /// Stages run concurrently, each in its own subshell, connected by
    /// pipes. The status is that of the last stage.
    async fn exec_pipeline(&mut self, stages: &[Stmt], io: &Stdio) -> Result<ExitStatus, RunError> {
        let mut runs = Vec::with_capacity(stages.len());
        let mut stdout = io.stdout.clone();
        // Built last stage first, so every reader is running before the
        // stage feeding it can fill the pipe.
        for (i, stage) in stages.iter().enumerate().rev() {
            let (stdin, upstream) = if i == 0 {
                (io.stdin.clone(), Output::null())
            } else {
                pipe()?
            };
            let stage_io = Stdio {
                stdin,
                stdout: std::mem::replace(&mut stdout, upstream),
                stderr: io.stderr.clone(),
            };
            let piped = i + 1 < stages.len();
            let mut sub = self.clone();
            runs.push(async move {
                match contain_exit(sub.exec_stmt(stage, &stage_io).await) {
                    Err(RunError::Io(e))
                        if piped && e.kind() == std::io::ErrorKind::BrokenPipe =>
                    {
                        Ok(ExitStatus::BROKEN_PIPE)
                    }
                    other => other,
                }
            });
        }

        let mut statuses = Vec::with_capacity(stages.len());
        for result in futures::future::join_all(runs).await {
            statuses.push(result?);
        }
        Ok(statuses.first().copied().unwrap_or_default())
    }

    async fn exec_simple(
        &mut self,
        cmd: &SimpleCommand,
        io: &Stdio,
    ) -> Result<ExitStatus, RunError> {
        let mut args = Vec::new();
        for word in &cmd.words {
            args.extend(self.fields(word, io).await?);
        }
        let mut assignments = Vec::with_capacity(cmd.assignments.len());
        for (name, value) in &cmd.assignments {
            let value = self.expand(value, io).await?.text();
            assignments.push((name.clone(), value));
        }
        let io = match self.redirect(&cmd.redirects, io).await? {
            Ok(io) => io,
            Err(status) => return Ok(status),
        };

        let Some(name) = args.first().cloned() else {
            for (name, value) in assignments {
                self.set_var(&name, value);
            }
            return Ok(ExitStatus::SUCCESS);
        };

        if let Some(status) = self.builtin(&args, &io)? {
            return Ok(status);
        }

        let ctx = HandlerContext {
            dir: self.dir.clone(),
            env: self.exported_env(assignments),
            stdio: io,
            cancel: self.cancel.clone(),
        };
        debug!(command = %name, "exec");
        match self.hooks.exec.handle(&ctx, &args).await {
            Outcome::Handled(Ok(status)) => Ok(status),
            Outcome::Handled(Err(ExecError::Cancelled)) => Err(RunError::Cancelled),
            Outcome::Handled(Err(e)) => {
                writeln!(ctx.stdio.stderr.clone(), "{name}: {e}")?;
                Ok(ExitStatus::FAILURE)
            }
            Outcome::Pass => {
                writeln!(ctx.stdio.stderr.clone(), "{name}: command not found")?;
                Ok(ExitStatus::NOT_FOUND)
            }
        }
    }

    fn exported_env(&self, assignments: Vec<(String, String)>) -> Vec<(String, String)> {
        let mut env: BTreeMap<String, String> = self
            .vars
            .iter()
            .filter(|(_, v)| v.exported)
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect();
        env.extend(assignments);
        env.into_iter().collect()
    }

    fn set_var(&mut self, name: &str, value: String) {
        match self.vars.get_mut(name) {
            Some(var) => var.value = value,
            None => {
                self.vars.insert(
                    name.to_string(),
                    Var {
                        value,
                        exported: false,
                    },
                );
            }
        }
    }

    fn param(&self, name: &str) -> String {
        match name {
            "?" => self.last_status.code().to_string(),
            "$" => std::process::id().to_string(),
            "#" => "0".to_string(),
            _ => self.var(name).unwrap_or_default().to_string(),
        }
    }

    fn expand<'a>(
        &'a mut self,
        word: &'a Word,
        io: &'a Stdio,
    ) -> BoxFuture<'a, Result<Expansion, RunError>> {
        async move {
            let mut expansion = Expansion::default();
            for part in &word.parts {
                match part {
                    WordPart::Literal(s) => expansion.push(s.clone(), true),
                    WordPart::Quoted(s) => expansion.push(s.clone(), false),
                    WordPart::Param { name, default } => {
                        let value = self.param(name);
                        match default {
                            Some(default) if value.is_empty() => {
                                let text = self.expand(default, io).await?.text();
                                expansion.push(text, false);
                            }
                            _ => expansion.push(value, false),
                        }
                    }
                    WordPart::CommandSub(stmts) => {
                        let output = self.substitute(stmts, io).await?;
                        expansion.push(output, false);
                    }
                }
            }
            Ok(expansion)
        }
        .boxed()
    }

    /// Expand a word into zero or more arguments.
    async fn fields(&mut self, word: &Word, io: &Stdio) -> Result<Vec<String>, RunError> {
        let expansion = self.expand(word, io).await?;
        let text = expansion.text();
        let only_expansions = word
            .parts
            .iter()
            .all(|p| matches!(p, WordPart::Param { .. } | WordPart::CommandSub(_)));
        if text.is_empty() && only_expansions {
            return Ok(Vec::new());
        }
        if is_glob(word) {
            return Ok(self.glob(&expansion));
        }
        Ok(vec![text])
    }

    /// Pathname expansion of the final component through the read-dir hook.
    /// Words that match nothing are kept as written.
    fn glob(&self, expansion: &Expansion) -> Vec<String> {
        let text = expansion.text();
        let Some((dir, pattern)) = expansion.split_glob() else {
            return vec![text];
        };
        let Ok(pattern) = glob::Pattern::new(&pattern) else {
            return vec![text];
        };
        let listed = if dir.is_empty() { "." } else { dir.as_str() };
        let entries = match self.hooks.read_dir.read_dir(&self.dir, Path::new(listed)) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %listed, error = %e, "glob: cannot list directory");
                return vec![text];
            }
        };
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: true,
        };
        let mut matches: Vec<String> = entries
            .iter()
            .filter(|e| pattern.matches_with(&e.name, options))
            .map(|e| format!("{dir}{}", e.name))
            .collect();
        if matches.is_empty() {
            return vec![text];
        }
        matches.sort();
        matches
    }

    async fn substitute(&mut self, stmts: &[Stmt], io: &Stdio) -> Result<String, RunError> {
        let (stdout, buf) = Output::buffer();
        let sub_io = Stdio {
            stdin: io.stdin.clone(),
            stdout,
            stderr: io.stderr.clone(),
        };
        let mut sub = self.clone();
        self.last_status = contain_exit(sub.exec_stmts(stmts, &sub_io).await)?;
        let mut output = buf.to_string_lossy();
        while output.ends_with('\n') {
            output.pop();
        }
        Ok(output)
    }

    /// Apply redirections to a copy of `io`. A failed redirection prints a
    /// diagnostic and yields the status to use instead of running anything.
    async fn redirect(
        &mut self,
        redirects: &[Redirect],
        io: &Stdio,
    ) -> Result<Result<Stdio, ExitStatus>, RunError> {
        let mut io = io.clone();
        for redirect in redirects {
            let target = self.expand(&redirect.target, &io).await?.text();
            if let Err(msg) = self.apply_redirect(redirect, &target, &mut io) {
                writeln!(io.stderr.clone(), "{msg}")?;
                return Ok(Err(ExitStatus::FAILURE));
            }
        }
        Ok(Ok(io))
    }

    fn apply_redirect(
        &self,
        redirect: &Redirect,
        target: &str,
        io: &mut Stdio,
    ) -> Result<(), String> {
        let fd = redirect.fd;
        match redirect.op {
            RedirectOp::Read => {
                input_fd(fd)?;
                io.stdin = self.read_target(target)?;
            }
            RedirectOp::HereString => {
                input_fd(fd)?;
                io.stdin = Input::bytes(format!("{target}\n"));
            }
            RedirectOp::DupIn => {
                input_fd(fd)?;
                if target != "0" {
                    return Err(format!("{target}: bad file descriptor"));
                }
            }
            RedirectOp::Write | RedirectOp::Append => {
                let out = self.open_target(target, redirect.op == RedirectOp::Append)?;
                set_output(io, fd.unwrap_or(1), out)?;
            }
            RedirectOp::WriteAll | RedirectOp::AppendAll => {
                let out = self.open_target(target, redirect.op == RedirectOp::AppendAll)?;
                io.stdout = out.clone();
                io.stderr = out;
            }
            RedirectOp::DupOut => match target {
                "1" => {
                    let out = io.stdout.clone();
                    set_output(io, fd.unwrap_or(1), out)?;
                }
                "2" => {
                    let out = io.stderr.clone();
                    set_output(io, fd.unwrap_or(1), out)?;
                }
                "-" => set_output(io, fd.unwrap_or(1), Output::null())?,
                file if fd.is_none() => {
                    let out = self.open_target(file, false)?;
                    io.stdout = out.clone();
                    io.stderr = out;
                }
                other => return Err(format!("{other}: ambiguous redirect")),
            },
        }
        Ok(())
    }

    fn open_target(&self, target: &str, append: bool) -> Result<Output, String> {
        if target == DEV_NULL {
            return Ok(Output::null());
        }
        let flags = if append {
            OpenFlags::append()
        } else {
            OpenFlags::write()
        };
        self.hooks
            .open
            .open(&self.dir, Path::new(target), flags)
            .map(Output::new)
            .map_err(|e| format!("{target}: {e}"))
    }

    fn read_target(&self, target: &str) -> Result<Input, String> {
        if target == DEV_NULL {
            return Ok(Input::Null);
        }
        let mut file = self
            .hooks
            .open
            .open(&self.dir, Path::new(target), OpenFlags::read())
            .map_err(|e| format!("{target}: {e}"))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| format!("{target}: {e}"))?;
        Ok(Input::bytes(data))
    }

    /// Interpreter builtins; `None` when `args[0]` is not one of them.
    fn builtin(&mut self, args: &[String], io: &Stdio) -> Result<Option<ExitStatus>, RunError> {
        let mut out = io.stdout.clone();
        let mut err = io.stderr.clone();
        let status = match args[0].as_str() {
            "true" | ":" => ExitStatus::SUCCESS,
            "false" => ExitStatus::FAILURE,
            "pwd" => {
                writeln!(out, "{}", self.dir.display())?;
                ExitStatus::SUCCESS
            }
            "echo" => {
                echo(&mut out, &args[1..])?;
                ExitStatus::SUCCESS
            }
            "cd" => self.cd(args.get(1).map(String::as_str), &mut err)?,
            "export" => {
                if args.len() == 1 {
                    let mut exported: Vec<_> =
                        self.vars.iter().filter(|(_, v)| v.exported).collect();
                    exported.sort_by(|a, b| a.0.cmp(b.0));
                    for (name, var) in exported {
                        writeln!(out, "export {name}='{}'", var.value)?;
                    }
                }
                for arg in &args[1..] {
                    let (name, value) = match arg.split_once('=') {
                        Some((name, value)) => (name, Some(value.to_string())),
                        None => (arg.as_str(), None),
                    };
                    let var = self.vars.entry(name.to_string()).or_insert(Var {
                        value: String::new(),
                        exported: true,
                    });
                    var.exported = true;
                    if let Some(value) = value {
                        var.value = value;
                    }
                }
                ExitStatus::SUCCESS
            }
            "unset" => {
                for name in args[1..].iter().filter(|a| !a.starts_with('-')) {
                    self.vars.remove(name);
                }
                ExitStatus::SUCCESS
            }
            "exit" => {
                let status = match args.get(1) {
                    None => self.last_status,
                    Some(arg) => match arg.parse::<i32>() {
                        Ok(code) => ExitStatus(code & 0xff),
                        Err(_) => {
                            writeln!(err, "exit: {arg}: numeric argument required")?;
                            ExitStatus(2)
                        }
                    },
                };
                return Err(RunError::Exit(status));
            }
            "test" | "[" => {
                let mut operands: Vec<&str> = args[1..].iter().map(String::as_str).collect();
                if args[0] == "[" {
                    if operands.last() != Some(&"]") {
                        writeln!(err, "[: missing ']'")?;
                        return Ok(Some(ExitStatus(2)));
                    }
                    operands.pop();
                }
                match self.eval_test(&operands) {
                    Ok(result) => ExitStatus::from(result),
                    Err(msg) => {
                        writeln!(err, "{}: {msg}", args[0])?;
                        ExitStatus(2)
                    }
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(status))
    }

    fn cd(&mut self, target: Option<&str>, err: &mut Output) -> Result<ExitStatus, RunError> {
        let target = match target {
            Some("-") => self.var("OLDPWD").map(str::to_string),
            Some(t) => Some(t.to_string()),
            None => self.var("HOME").map(str::to_string),
        };
        let Some(target) = target.filter(|t| !t.is_empty()) else {
            writeln!(err, "cd: HOME not set")?;
            return Ok(ExitStatus::FAILURE);
        };
        match self.hooks.stat.stat(&self.dir, Path::new(&target), true) {
            Ok(info) if info.is_dir => {
                let old = std::mem::replace(&mut self.dir, info.path);
                self.set_var("OLDPWD", old.display().to_string());
                self.set_var("PWD", self.dir.display().to_string());
                Ok(ExitStatus::SUCCESS)
            }
            Ok(_) => {
                writeln!(err, "cd: {target}: not a directory")?;
                Ok(ExitStatus::FAILURE)
            }
            Err(e) => {
                writeln!(err, "cd: {target}: {e}")?;
                Ok(ExitStatus::FAILURE)
            }
        }
    }

    fn eval_test(&self, args: &[&str]) -> Result<bool, String> {
        match args {
            [] => Ok(false),
            [s] => Ok(!s.is_empty()),
            [left, op, right] if is_binary_test(op) => binary_test(left, op, right),
            ["!", rest @ ..] => self.eval_test(rest).map(|b| !b),
            ["(", inner @ .., ")"] => self.eval_test(inner),
            [op, operand] => self.unary_test(op, operand),
            _ => Err("too many arguments".into()),
        }
    }

    fn unary_test(&self, op: &str, operand: &str) -> Result<bool, String> {
        match op {
            "-n" => return Ok(!operand.is_empty()),
            "-z" => return Ok(operand.is_empty()),
            "-e" | "-f" | "-d" | "-s" | "-r" | "-w" | "-x" | "-L" | "-h" => {}
            _ => return Err(format!("{op}: unary operator expected")),
        }
        let follow = !matches!(op, "-L" | "-h");
        let Ok(info) = self.hooks.stat.stat(&self.dir, Path::new(operand), follow) else {
            return Ok(false);
        };
        Ok(match op {
            "-f" => info.is_file,
            "-d" => info.is_dir,
            "-s" => info.size > 0,
            "-r" => info.mode & 0o444 != 0,
            "-w" => info.mode & 0o222 != 0,
            "-x" => info.mode & 0o111 != 0,
            "-L" | "-h" => info.is_symlink,
            _ => true,
        })
    }
}

/// An `exit` inside a subshell ends only the subshell.
fn contain_exit(result: Result<ExitStatus, RunError>) -> Result<ExitStatus, RunError> {
    match result {
        Err(RunError::Exit(status)) => Ok(status),
        other => other,
    }
}

fn input_fd(fd: Option<u32>) -> Result<(), String> {
    match fd {
        None | Some(0) => Ok(()),
        Some(other) => Err(format!("{other}: bad file descriptor")),
    }
}

fn set_output(io: &mut Stdio, fd: u32, out: Output) -> Result<(), String> {
    match fd {
        1 => io.stdout = out,
        2 => io.stderr = out,
        other => return Err(format!("{other}: bad file descriptor")),
    }
    Ok(())
}

fn echo(out: &mut Output, args: &[String]) -> io::Result<()> {
    let (newline, rest) = match args.split_first() {
        Some((flag, rest)) if flag == "-n" => (false, rest),
        _ => (true, args),
    };
    let mut line = rest.join(" ");
    if newline {
        line.push('\n');
    }
    out.write_all(line.as_bytes())?;
    out.flush()
}

fn is_binary_test(op: &str) -> bool {
    matches!(
        op,
        "=" | "==" | "!=" | "-eq" | "-ne" | "-lt" | "-le" | "-gt" | "-ge"
    )
}

fn binary_test(left: &str, op: &str, right: &str) -> Result<bool, String> {
    match op {
        "=" | "==" => return Ok(left == right),
        "!=" => return Ok(left != right),
        _ => {}
    }
    let parse = |s: &str| {
        s.trim()
            .parse::<i64>()
            .map_err(|_| format!("{s}: integer expression expected"))
    };
    let (l, r) = (parse(left)?, parse(right)?);
    Ok(match op {
        "-eq" => l == r,
        "-ne" => l != r,
        "-lt" => l < r,
        "-le" => l <= r,
        "-gt" => l > r,
        _ => l >= r,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::io::BufRead as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::interp::parse;
    use crate::io::SharedBuffer;
    use crate::vfs::{LocalFs, PathJail, WorkDir};

    /// Exec stage echoing its arguments, counting calls.
    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExecHandler for Recorder {
        async fn handle(&self, ctx: &HandlerContext, args: &[String]) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match args[0].as_str() {
                "args" => {
                    let line = format!("{}\n", args[1..].join("|"));
                    Outcome::status(ExitStatus::from(ctx.stdio.stdout.write_bytes(line.as_bytes()).is_ok()))
                }
                "env" => {
                    let mut out = String::new();
                    for (k, v) in &ctx.env {
                        out.push_str(&format!("{k}={v}\n"));
                    }
                    Outcome::status(ExitStatus::from(ctx.stdio.stdout.write_bytes(out.as_bytes()).is_ok()))
                }
                "upper" => {
                    let stdin = ctx.stdio.stdin.clone();
                    let data = tokio::task::spawn_blocking(move || stdin.read_all())
                        .await
                        .unwrap()
                        .unwrap_or_default();
                    let upper = String::from_utf8_lossy(&data).to_uppercase();
                    Outcome::status(ExitStatus::from(ctx.stdio.stdout.write_bytes(upper.as_bytes()).is_ok()))
                }
                "line" => {
                    let stdin = ctx.stdio.stdin.clone();
                    let line = tokio::task::spawn_blocking(move || {
                        let mut line = String::new();
                        std::io::BufReader::new(stdin.reader()).read_line(&mut line).map(|_| line)
                    })
                    .await
                    .unwrap()
                    .unwrap_or_default();
                    Outcome::status(ExitStatus::from(ctx.stdio.stdout.write_bytes(line.as_bytes()).is_ok()))
                }
                "endless" => {
                    let out = ctx.stdio.stdout.clone();
                    let writes = tokio::task::spawn_blocking(move || {
                        let mut count = 0usize;
                        while out.write_bytes(b"y\n").is_ok() {
                            count += 1;
                        }
                        count
                    });
                    Outcome::status(ExitStatus::from(writes.await.unwrap() > 0))
                }
                "fail" => Outcome::status(ExitStatus(3)),
                _ => Outcome::Pass,
            }
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        recorder: Arc<Recorder>,
        runner: Runner,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = std::fs::canonicalize(tmp.path()).unwrap();
            let jail = Arc::new(PathJail::new([&root]).unwrap());
            let fs = LocalFs::new(jail, Arc::new(WorkDir::new(&root)));
            let recorder = Arc::new(Recorder::default());
            let hooks = Hooks::new(FsHooks::new(fs), recorder.clone());
            let runner = Runner::new(hooks, &root, ["GREETING=hi".to_string()], CancelToken::new());
            Self {
                _tmp: tmp,
                root,
                recorder,
                runner,
            }
        }

        async fn run(&mut self, source: &str) -> (Result<ExitStatus, RunError>, String, String) {
            let program = parse(source).unwrap();
            let (io, out, err): (Stdio, SharedBuffer, SharedBuffer) = Stdio::captured();
            let result = self.runner.run(&program, &io).await;
            (result, out.to_string_lossy(), err.to_string_lossy())
        }
    }

    #[tokio::test]
    async fn test_variables_and_quoting() {
        let mut h = Harness::new();
        let (status, out, _) = h
            .run("name=world; echo \"$GREETING $name\" '$name' ${missing:-dflt} $?")
            .await;
        assert_eq!(status.unwrap(), ExitStatus::SUCCESS);
        assert_eq!(out, "hi world $name dflt 0\n");
    }

    #[tokio::test]
    async fn test_unset_and_echo_without_newline() {
        let mut h = Harness::new();
        let (_, out, _) = h
            .run("x=1; unset x; echo -n \"[${x:-gone}]\"; echo -n; echo")
            .await;
        assert_eq!(out, "[gone]\n");
        assert_eq!(h.runner.var("x"), None);
    }

    #[tokio::test]
    async fn test_exit_status_logic() {
        let mut h = Harness::new();
        let (_, out, _) = h
            .run("fail || echo recovered; fail && echo skipped; ! fail && echo negated; fail; echo $?")
            .await;
        assert_eq!(out, "recovered\nnegated\n3\n");
    }

    #[tokio::test]
    async fn test_pipeline_and_substitution() {
        let mut h = Harness::new();
        let (_, out, _) = h.run("echo abc | upper; args \"$(echo one; echo)\" x").await;
        assert_eq!(out, "ABC\none|x\n");
    }

    #[tokio::test]
    async fn test_pipeline_stops_endless_producer() {
        let mut h = Harness::new();
        let run = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            h.run("endless | line; echo $?; while true; do echo loop; done | line"),
        )
        .await
        .unwrap();
        assert_eq!(run.0.unwrap(), ExitStatus::SUCCESS);
        assert_eq!(run.1, "y\n0\nloop\n");
    }

    #[tokio::test]
    async fn test_pipeline_status_is_last_stage() {
        let mut h = Harness::new();
        let (_, out, _) = h
            .run("fail | args a; echo $?; args b | fail; echo $?")
            .await;
        assert_eq!(out, "a\n0\n3\n");
    }

    #[tokio::test]
    async fn test_prefix_assignment_only_exported_to_command() {
        let mut h = Harness::new();
        let (_, out, _) = h.run("plain=1; export shared=2; EXTRA=3 env").await;
        assert_eq!(out, "EXTRA=3\nGREETING=hi\nshared=2\n");
        assert_eq!(h.runner.var("plain"), Some("1"));
        assert_eq!(h.runner.var("EXTRA"), None);
    }

    #[tokio::test]
    async fn test_redirections_go_through_jail() {
        let mut h = Harness::new();
        let (status, _, _) = h
            .run("echo first > out.txt; echo second >> out.txt; upper < out.txt > up.txt")
            .await;
        assert_eq!(status.unwrap(), ExitStatus::SUCCESS);
        assert_eq!(std::fs::read_to_string(h.root.join("up.txt")).unwrap(), "FIRST\nSECOND\n");

        let (status, _, err) = h.run("echo nope > ../../escape.txt").await;
        assert_eq!(status.unwrap(), ExitStatus::FAILURE);
        assert!(err.contains("access denied"));

        let (status, out, _) = h.run("echo gone > /dev/null; upper <<< quiet 2>&1").await;
        assert_eq!(status.unwrap(), ExitStatus::SUCCESS);
        assert_eq!(out, "QUIET\n");
    }

    #[tokio::test]
    async fn test_cd_is_jailed() {
        let mut h = Harness::new();
        std::fs::create_dir(h.root.join("sub")).unwrap();
        let (_, out, _) = h.run("cd sub && pwd").await;
        assert_eq!(out, format!("{}\n", h.root.join("sub").display()));

        let (status, _, err) = h.run("cd /").await;
        assert_eq!(status.unwrap(), ExitStatus::FAILURE);
        assert!(err.starts_with("cd: /:"));
        assert_eq!(h.runner.dir(), h.root.join("sub"));

        // Subshells keep their own directory.
        let (_, out, _) = h.run("(cd ..; pwd); pwd").await;
        let sub = h.root.join("sub");
        assert_eq!(out, format!("{}\n{}\n", h.root.display(), sub.display()));
    }

    #[tokio::test]
    async fn test_control_flow() {
        let mut h = Harness::new();
        let (_, out, _) = h
            .run(
                "for i in a b c; do if [ $i = b ]; then echo bee; elif test $i = c; then echo sea; else echo $i; fi; done",
            )
            .await;
        assert_eq!(out, "a\nbee\nsea\n");

        let (_, out, _) = h
            .run("n=; while [ \"$n\" != xxx ]; do n=${n}x; echo $n; done; until true; do echo no; done")
            .await;
        assert_eq!(out, "x\nxx\nxxx\n");
    }

    #[tokio::test]
    async fn test_glob_uses_read_dir() {
        let mut h = Harness::new();
        std::fs::write(h.root.join("b.txt"), "").unwrap();
        std::fs::write(h.root.join("a.txt"), "").unwrap();
        std::fs::write(h.root.join(".hidden.txt"), "").unwrap();
        std::fs::write(h.root.join("c.md"), "").unwrap();
        let (_, out, _) = h.run("args *.txt '*.txt' *.none").await;
        assert_eq!(out, "a.txt|b.txt|*.txt|*.none\n");
    }

    #[tokio::test]
    async fn test_exit_and_not_found() {
        let mut h = Harness::new();
        let (result, out, _) = h.run("echo before; (exit 4); echo $?; exit 7; echo after").await;
        assert!(matches!(result, Err(RunError::Exit(ExitStatus(7)))));
        assert_eq!(out, "before\n4\n");

        let (status, _, err) = h.run("no-such-command").await;
        assert_eq!(status.unwrap(), ExitStatus::NOT_FOUND);
        assert_eq!(err, "no-such-command: command not found\n");
    }

    #[tokio::test]
    async fn test_cancelled_run_stops() {
        let mut h = Harness::new();
        h.runner.cancel.cancel();
        let (result, out, _) = h.run("echo never").await;
        assert!(matches!(result, Err(RunError::Cancelled)));
        assert!(out.is_empty());
        assert_eq!(h.recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_file_tests() {
        let mut h = Harness::new();
        std::fs::write(h.root.join("f"), "data").unwrap();
        std::fs::create_dir(h.root.join("d")).unwrap();
        let (_, out, _) = h
            .run("[ -f f ] && echo file; [ -d d ] && echo dir; [ -e missing ] || echo none; [ -s f ] && echo nonempty; [ 3 -lt 10 ] && echo less")
            .await;
        assert_eq!(out, "file\ndir\nnone\nnonempty\nless\n");
    }
}
