//! basename and dirname builtins

use std::io::{self, Write};

use super::{Builtin, BuiltinContext};
use crate::exec::ExitStatus;

fn trim_slashes(s: &str) -> &str {
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() && s.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

fn basename<'a>(path: &'a str, suffix: Option<&str>) -> &'a str {
    let path = trim_slashes(path);
    if path == "/" {
        return path;
    }
    let name = path.rsplit('/').next().unwrap_or(path);
    match suffix.and_then(|s| name.strip_suffix(s)) {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => name,
    }
}

fn dirname(path: &str) -> &str {
    let path = trim_slashes(path);
    match path.rfind('/') {
        None => ".",
        Some(idx) => match trim_slashes(&path[..idx]) {
            "" => "/",
            dir => dir,
        },
    }
}

/// `basename NAME [SUFFIX]`
#[derive(Debug, Clone, Copy)]
pub struct BasenameCommand;

impl Builtin for BasenameCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        match args {
            [_, name] => writeln!(ctx.stdout(), "{}", basename(name, None))?,
            [_, name, suffix] => writeln!(ctx.stdout(), "{}", basename(name, Some(suffix)))?,
            _ => {
                writeln!(ctx.stderr(), "usage: basename NAME [SUFFIX]")?;
                return Ok(ExitStatus::FAILURE);
            }
        }
        Ok(ExitStatus::SUCCESS)
    }
}

/// `dirname NAME...`
#[derive(Debug, Clone, Copy)]
pub struct DirnameCommand;

impl Builtin for DirnameCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        if args.len() < 2 {
            writeln!(ctx.stderr(), "dirname: missing operand")?;
            return Ok(ExitStatus::FAILURE);
        }
        let mut stdout = ctx.stdout();
        for name in &args[1..] {
            writeln!(stdout, "{}", dirname(name))?;
        }
        Ok(ExitStatus::SUCCESS)
    }
}
