//! mkdir, rm, mv, cp and touch builtins

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{Builtin, BuiltinContext, split_flags};
use crate::exec::ExitStatus;
use crate::vfs::{FsError, OpenFlags};

fn unknown_option(ctx: &BuiltinContext<'_>, command: &str, c: char) -> io::Result<ExitStatus> {
    writeln!(ctx.stderr(), "{command}: unknown option: -{c}")?;
    Ok(ExitStatus::FAILURE)
}

fn missing_operand(ctx: &BuiltinContext<'_>, command: &str) -> io::Result<ExitStatus> {
    writeln!(ctx.stderr(), "{command}: missing operand")?;
    Ok(ExitStatus::FAILURE)
}

/// Where `src` lands when copied or moved to `dst`: inside `dst` when it is
/// an existing directory, `dst` itself otherwise.
fn destination(ctx: &BuiltinContext<'_>, src: &Path, dst: &Path) -> PathBuf {
    let into_dir = ctx.fs.stat(dst).map(|info| info.is_dir).unwrap_or(false);
    match (into_dir, src.file_name()) {
        (true, Some(name)) => dst.join(name),
        _ => dst.to_path_buf(),
    }
}

/// `mkdir [-p] DIR...`
#[derive(Debug, Clone, Copy)]
pub struct MkdirCommand;

impl Builtin for MkdirCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let mut parents = false;
        let (flags, dirs) = split_flags(args);
        for c in flags {
            match c {
                'p' => parents = true,
                _ => return unknown_option(ctx, "mkdir", c),
            }
        }
        if dirs.is_empty() {
            return missing_operand(ctx, "mkdir");
        }

        let mut status = ExitStatus::SUCCESS;
        for dir in &dirs {
            let path = ctx.path(dir);
            let result = match ctx.fs.stat(&path) {
                Ok(info) if parents && info.is_dir => Ok(()),
                Ok(_) => Err(FsError::AlreadyExists(path)),
                Err(_) if !parents => {
                    // Without -p the parent must already exist.
                    let parent = path.parent().unwrap_or(Path::new("/"));
                    match ctx.fs.stat(parent) {
                        Ok(info) if info.is_dir => ctx.fs.create_dir(&path),
                        Ok(_) => Err(FsError::NotADirectory(parent.to_path_buf())),
                        Err(e) => Err(e),
                    }
                }
                Err(_) => ctx.fs.create_dir(&path),
            };
            if let Err(e) = result {
                ctx.report("mkdir", dir, e)?;
                status = ExitStatus::FAILURE;
            }
        }
        Ok(status)
    }
}

/// `rm [-rRf] FILE...`
#[derive(Debug, Clone, Copy)]
pub struct RmCommand;

impl Builtin for RmCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let mut recursive = false;
        let mut force = false;
        let (flags, targets) = split_flags(args);
        for c in flags {
            match c {
                'r' | 'R' => recursive = true,
                'f' => force = true,
                _ => return unknown_option(ctx, "rm", c),
            }
        }
        if targets.is_empty() && !force {
            return missing_operand(ctx, "rm");
        }

        let mut status = ExitStatus::SUCCESS;
        for target in &targets {
            let path = ctx.path(target);
            let result = match ctx.fs.lstat(&path) {
                Ok(info) if info.is_dir && !recursive => {
                    Err(FsError::NotEmptyOrNotRecursive(info.path))
                }
                Ok(_) => ctx.fs.delete(&path, recursive),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(FsError::NotFound(_)) if force => {}
                Err(e) => {
                    ctx.report("rm", target, e)?;
                    status = ExitStatus::FAILURE;
                }
            }
        }
        Ok(status)
    }
}

/// `mv SOURCE... DEST`
#[derive(Debug, Clone, Copy)]
pub struct MvCommand;

impl Builtin for MvCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let (flags, operands) = split_flags(args);
        // -f is accepted for compatibility; nothing ever prompts.
        if let Some(c) = flags.into_iter().find(|&c| c != 'f') {
            return unknown_option(ctx, "mv", c);
        }
        let Some((dst, sources)) = operands.split_last().filter(|(_, s)| !s.is_empty()) else {
            return missing_operand(ctx, "mv");
        };

        let dst = ctx.path(dst);
        let mut status = ExitStatus::SUCCESS;
        for src in sources {
            let src_path = ctx.path(src);
            let target = destination(ctx, &src_path, &dst);
            if let Err(e) = ctx.fs.rename(&src_path, &target) {
                ctx.report("mv", src, e)?;
                status = ExitStatus::FAILURE;
            }
        }
        Ok(status)
    }
}

/// `cp [-rR] SOURCE... DEST`
#[derive(Debug, Clone, Copy)]
pub struct CpCommand;

impl Builtin for CpCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let mut recursive = false;
        let (flags, operands) = split_flags(args);
        for c in flags {
            match c {
                'r' | 'R' | 'a' => recursive = true,
                'f' | 'p' => {}
                _ => return unknown_option(ctx, "cp", c),
            }
        }
        let Some((dst, sources)) = operands.split_last().filter(|(_, s)| !s.is_empty()) else {
            return missing_operand(ctx, "cp");
        };

        let dst = ctx.path(dst);
        let mut status = ExitStatus::SUCCESS;
        for src in sources {
            let src_path = ctx.path(src);
            let result = match ctx.fs.stat(&src_path) {
                Ok(info) if info.is_dir && !recursive => {
                    writeln!(ctx.stderr(), "cp: -r not specified; omitting directory '{src}'")?;
                    status = ExitStatus::FAILURE;
                    continue;
                }
                Ok(_) => ctx.fs.copy(&src_path, destination(ctx, &src_path, &dst)),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                ctx.report("cp", src, e)?;
                status = ExitStatus::FAILURE;
            }
        }
        Ok(status)
    }
}

/// `touch FILE...`
#[derive(Debug, Clone, Copy)]
pub struct TouchCommand;

impl Builtin for TouchCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let (flags, files) = split_flags(args);
        if let Some(c) = flags.into_iter().next() {
            return unknown_option(ctx, "touch", c);
        }
        if files.is_empty() {
            return missing_operand(ctx, "touch");
        }

        let mut status = ExitStatus::SUCCESS;
        for file in &files {
            let flags = OpenFlags {
                write: true,
                append: true,
                create: true,
                ..Default::default()
            };
            let result = ctx
                .fs
                .open(ctx.path(file), flags)
                .and_then(|f| Ok(f.set_modified(SystemTime::now())?));
            if let Err(e) = result {
                ctx.report("touch", file, e)?;
                status = ExitStatus::FAILURE;
            }
        }
        Ok(status)
    }
}
