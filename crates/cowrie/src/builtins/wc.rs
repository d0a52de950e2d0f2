//! wc builtin - print newline, word, and byte counts

use std::io::{self, Write};

use super::{Builtin, BuiltinContext, split_flags};
use crate::exec::ExitStatus;

/// `wc [-lwmc] [FILE]...`
#[derive(Debug, Clone, Copy)]
pub struct WcCommand;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    lines: usize,
    words: usize,
    chars: usize,
    bytes: usize,
}

impl Counts {
    fn of(data: &[u8]) -> Self {
        let mut words = 0;
        let mut in_word = false;
        for &b in data {
            let is_ws = b.is_ascii_whitespace();
            if !in_word && !is_ws {
                words += 1;
            }
            in_word = !is_ws;
        }

        Self {
            lines: data.iter().filter(|&&b| b == b'\n').count(),
            words,
            chars: String::from_utf8_lossy(data).chars().count(),
            bytes: data.len(),
        }
    }

    fn add(&mut self, other: Self) {
        self.lines += other.lines;
        self.words += other.words;
        self.chars += other.chars;
        self.bytes += other.bytes;
    }
}

#[derive(Debug, Clone, Copy)]
struct Columns {
    lines: bool,
    words: bool,
    chars: bool,
    bytes: bool,
}

impl Columns {
    fn render(&self, counts: Counts) -> String {
        [
            (self.lines, counts.lines),
            (self.words, counts.words),
            (self.chars, counts.chars),
            (self.bytes, counts.bytes),
        ]
        .iter()
        .filter(|(shown, _)| *shown)
        .map(|(_, n)| format!("{n:8}"))
        .collect()
    }
}

impl Builtin for WcCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let mut columns = Columns {
            lines: false,
            words: false,
            chars: false,
            bytes: false,
        };

        let (flags, mut files) = split_flags(args);
        for c in flags {
            match c {
                'l' => columns.lines = true,
                'w' => columns.words = true,
                'm' => columns.chars = true,
                'c' => columns.bytes = true,
                _ => {
                    writeln!(ctx.stderr(), "wc: unknown option: -{c}")?;
                    return Ok(ExitStatus::FAILURE);
                }
            }
        }

        // Default: lines, words and bytes
        if !columns.lines && !columns.words && !columns.chars && !columns.bytes {
            columns.lines = true;
            columns.words = true;
            columns.bytes = true;
        }

        if files.is_empty() {
            files.push("-".to_string());
        }

        let mut stdout = ctx.stdout();
        let mut status = ExitStatus::SUCCESS;
        let mut total = Counts::default();

        for file in &files {
            let contents = match ctx.read_input(file) {
                Ok(data) => data,
                Err(e) => {
                    ctx.report("wc", file, e)?;
                    status = ExitStatus::FAILURE;
                    continue;
                }
            };
            let counts = Counts::of(&contents);
            total.add(counts);

            let row = columns.render(counts);
            if file == "-" {
                writeln!(stdout, "{row}")?;
            } else {
                writeln!(stdout, "{row} {file}")?;
            }
        }

        if files.len() > 1 {
            writeln!(stdout, "{} total", columns.render(total))?;
        }

        stdout.flush()?;
        Ok(status)
    }
}
