//! cat builtin - concatenate files and print on the standard output

use std::io::{self, Read, Write};

use super::{Builtin, BuiltinContext, split_flags};
use crate::exec::ExitStatus;

/// `cat [-nEs] [FILE]...`
#[derive(Debug, Clone, Copy)]
pub struct CatCommand;

impl Builtin for CatCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let mut show_line_numbers = false;
        let mut show_ends = false;
        let mut squeeze_blank = false;

        let (flags, mut files) = split_flags(args);
        for c in flags {
            match c {
                'n' => show_line_numbers = true,
                'E' => show_ends = true,
                's' => squeeze_blank = true,
                _ => {
                    writeln!(ctx.stderr(), "cat: unknown option: -{c}")?;
                    return Ok(ExitStatus::FAILURE);
                }
            }
        }

        // If no files specified, read from stdin
        if files.is_empty() {
            files.push("-".to_string());
        }

        let mut stdout = ctx.stdout();
        let mut status = ExitStatus::SUCCESS;
        let mut line_number = 1;
        let mut last_was_blank = false;

        for file in &files {
            let mut reader = match ctx.open_input(file) {
                Ok(reader) => reader,
                Err(e) => {
                    ctx.report("cat", file, e)?;
                    status = ExitStatus::FAILURE;
                    continue;
                }
            };

            if !show_line_numbers && !show_ends && !squeeze_blank {
                io::copy(&mut reader, &mut stdout)?;
                continue;
            }
            let mut contents = Vec::new();
            reader.read_to_end(&mut contents)?;

            if contents.is_empty() {
                continue;
            }
            let body = contents.strip_suffix(b"\n").unwrap_or(&contents[..]);
            for line in body.split(|&b| b == b'\n') {
                let is_blank = line.iter().all(|b| b.is_ascii_whitespace());
                if squeeze_blank && is_blank && last_was_blank {
                    continue;
                }
                last_was_blank = is_blank;

                if show_line_numbers {
                    write!(stdout, "{line_number:6}\t")?;
                    line_number += 1;
                }
                stdout.write_all(line)?;
                if show_ends {
                    stdout.write_all(b"$")?;
                }
                stdout.write_all(b"\n")?;
            }
        }

        stdout.flush()?;
        Ok(status)
    }
}
