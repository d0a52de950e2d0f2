//! head builtin - output the first part of files

use std::io::{self, BufRead, BufReader, Read, Write};

use super::{Builtin, BuiltinContext};
use crate::exec::ExitStatus;

/// `head [-n N | -N | -c N] [FILE]...`
#[derive(Debug, Clone, Copy)]
pub struct HeadCommand;

impl Builtin for HeadCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let mut num_lines: usize = 10;
        let mut num_bytes: Option<usize> = None;
        let mut files = Vec::new();

        let mut args_iter = args.iter().skip(1);
        while let Some(arg) = args_iter.next() {
            let parsed = if arg == "-n" || arg == "--lines" {
                args_iter.next().and_then(|n| n.parse().ok()).map(|n| num_lines = n)
            } else if let Some(n) = arg.strip_prefix("-n") {
                n.parse().ok().map(|n| num_lines = n)
            } else if arg == "-c" || arg == "--bytes" {
                args_iter.next().and_then(|n| n.parse().ok()).map(|n| num_bytes = Some(n))
            } else if let Some(n) = arg.strip_prefix("-c") {
                n.parse().ok().map(|n| num_bytes = Some(n))
            } else if arg != "-"
                && let Some(n) = arg.strip_prefix('-')
            {
                // -N shorthand for -n N
                n.parse().ok().map(|n| num_lines = n)
            } else {
                files.push(arg.clone());
                Some(())
            };
            if parsed.is_none() {
                writeln!(ctx.stderr(), "head: invalid option or count: {arg}")?;
                return Ok(ExitStatus::FAILURE);
            }
        }

        // If no files, read from stdin
        if files.is_empty() {
            files.push("-".to_string());
        }

        let mut stdout = ctx.stdout();
        let mut status = ExitStatus::SUCCESS;
        let show_headers = files.len() > 1;

        for (i, file) in files.iter().enumerate() {
            let reader = match ctx.open_input(file) {
                Ok(reader) => reader,
                Err(e) => {
                    ctx.report("head", file, e)?;
                    status = ExitStatus::FAILURE;
                    continue;
                }
            };

            if show_headers {
                if i > 0 {
                    writeln!(stdout)?;
                }
                writeln!(stdout, "==> {file} <==")?;
            }

            // Stop reading once enough is copied.
            match num_bytes {
                Some(bytes) => {
                    io::copy(&mut reader.take(bytes as u64), &mut stdout)?;
                }
                None => {
                    let mut reader = BufReader::new(reader);
                    let mut line = Vec::new();
                    for _ in 0..num_lines {
                        line.clear();
                        if reader.read_until(b'\n', &mut line)? == 0 {
                            break;
                        }
                        stdout.write_all(&line)?;
                    }
                }
            }
        }

        stdout.flush()?;
        Ok(status)
    }
}
