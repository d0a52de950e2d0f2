//! tail builtin - output the last part of files

use std::io::{self, Write};

use super::{Builtin, BuiltinContext};
use crate::exec::ExitStatus;

/// A count that is either from the end (`N`) or from the start (`+N`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Count {
    Last(usize),
    From(usize),
}

impl Count {
    fn parse(s: &str) -> Option<Self> {
        match s.strip_prefix('+') {
            Some(rest) => rest.parse().ok().map(Self::From),
            None => s.parse().ok().map(Self::Last),
        }
    }
}

/// `tail [-n [+]N | -N | +N | -c [+]N] [FILE]...`
#[derive(Debug, Clone, Copy)]
pub struct TailCommand;

impl Builtin for TailCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let mut lines = Count::Last(10);
        let mut bytes: Option<Count> = None;
        let mut files = Vec::new();

        let mut args_iter = args.iter().skip(1);
        while let Some(arg) = args_iter.next() {
            let parsed = if arg == "-n" || arg == "--lines" {
                args_iter.next().and_then(|n| Count::parse(n)).map(|c| lines = c)
            } else if let Some(n) = arg.strip_prefix("-n") {
                Count::parse(n).map(|c| lines = c)
            } else if arg == "-c" || arg == "--bytes" {
                args_iter.next().and_then(|n| Count::parse(n)).map(|c| bytes = Some(c))
            } else if let Some(n) = arg.strip_prefix("-c") {
                Count::parse(n).map(|c| bytes = Some(c))
            } else if arg.starts_with('+') {
                // +N means from line N
                Count::parse(arg).map(|c| lines = c)
            } else if arg != "-"
                && let Some(n) = arg.strip_prefix('-')
            {
                n.parse().ok().map(|n| lines = Count::Last(n))
            } else {
                files.push(arg.clone());
                Some(())
            };
            if parsed.is_none() {
                writeln!(ctx.stderr(), "tail: invalid option or count: {arg}")?;
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
            let contents = match ctx.read_input(file) {
                Ok(data) => data,
                Err(e) => {
                    ctx.report("tail", file, e)?;
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

            let start = match bytes {
                Some(Count::Last(n)) => contents.len().saturating_sub(n),
                Some(Count::From(n)) => n.saturating_sub(1).min(contents.len()),
                None => line_start(&contents, lines),
            };
            stdout.write_all(&contents[start..])?;
        }

        stdout.flush()?;
        Ok(status)
    }
}

/// Byte offset where the requested lines begin.
fn line_start(contents: &[u8], count: Count) -> usize {
    // Offsets just past each newline, i.e. the start of every following line.
    let mut starts: Vec<usize> = vec![0];
    starts.extend(
        contents
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .map(|(idx, _)| idx + 1)
            .filter(|&s| s < contents.len()),
    );

    match count {
        Count::From(n) => starts
            .get(n.saturating_sub(1))
            .copied()
            .unwrap_or(contents.len()),
        Count::Last(0) => contents.len(),
        Count::Last(n) => starts[starts.len().saturating_sub(n)],
    }
}
