//! ls builtin - list directory contents

use std::io::{self, Write};

use super::{Builtin, BuiltinContext, split_flags};
use crate::exec::ExitStatus;
use crate::io::Output;
use crate::vfs::FileInfo;

/// `ls [-1aAl] [FILE]...`
#[derive(Debug, Clone, Copy)]
pub struct LsCommand;

#[derive(Debug, Default, Clone, Copy)]
struct LsOpts {
    all: bool,
    long: bool,
}

fn mode_string(info: &FileInfo) -> String {
    let kind = if info.is_symlink {
        'l'
    } else if info.is_dir {
        'd'
    } else {
        '-'
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (info.mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn print_entry(
    out: &mut Output,
    opts: LsOpts,
    name: &str,
    info: Option<&FileInfo>,
) -> io::Result<()> {
    match (opts.long, info) {
        (true, Some(info)) => writeln!(out, "{} {:>8} {name}", mode_string(info), info.size),
        _ => writeln!(out, "{name}"),
    }
}

impl Builtin for LsCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let mut opts = LsOpts::default();
        let (flags, mut targets) = split_flags(args);
        for c in flags {
            match c {
                'a' | 'A' => opts.all = true,
                'l' => opts.long = true,
                '1' => {}
                _ => {
                    writeln!(ctx.stderr(), "ls: unknown option: -{c}")?;
                    return Ok(ExitStatus::FAILURE);
                }
            }
        }
        if targets.is_empty() {
            targets.push(".".to_string());
        }

        let mut stdout = ctx.stdout();
        let mut status = ExitStatus::SUCCESS;
        let show_headers = targets.len() > 1;

        for (i, target) in targets.iter().enumerate() {
            let path = ctx.path(target);
            let info = match ctx.fs.stat(&path) {
                Ok(info) => info,
                Err(e) => {
                    ctx.report("ls", target, e)?;
                    status = ExitStatus::FAILURE;
                    continue;
                }
            };

            if !info.is_dir {
                print_entry(&mut stdout, opts, target, Some(&info))?;
                continue;
            }

            let entries = match ctx.fs.list(&path) {
                Ok(entries) => entries,
                Err(e) => {
                    ctx.report("ls", target, e)?;
                    status = ExitStatus::FAILURE;
                    continue;
                }
            };
            if show_headers {
                if i > 0 {
                    writeln!(stdout)?;
                }
                writeln!(stdout, "{target}:")?;
            }
            for entry in entries {
                if !opts.all && entry.name.starts_with('.') {
                    continue;
                }
                let info = if opts.long {
                    ctx.fs.lstat(path.join(&entry.name)).ok()
                } else {
                    None
                };
                print_entry(&mut stdout, opts, &entry.name, info.as_ref())?;
            }
        }

        stdout.flush()?;
        Ok(status)
    }
}
