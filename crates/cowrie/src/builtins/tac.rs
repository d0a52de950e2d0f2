//! tac builtin - concatenate and print files in reverse

use std::io::{self, Write};

use super::{Builtin, BuiltinContext};
use crate::exec::ExitStatus;

/// `tac [FILE]...`
#[derive(Debug, Clone, Copy)]
pub struct TacCommand;

impl Builtin for TacCommand {
    fn run(&self, ctx: &BuiltinContext<'_>, args: &[String]) -> io::Result<ExitStatus> {
        let mut files: Vec<String> = args.iter().skip(1).cloned().collect();
        if files.is_empty() {
            files.push("-".to_string());
        }

        let mut stdout = ctx.stdout();
        let mut status = ExitStatus::SUCCESS;
        for file in &files {
            match ctx.read_input(file) {
                Ok(contents) => {
                    let body = contents.strip_suffix(b"\n").unwrap_or(&contents[..]);
                    if contents.is_empty() {
                        continue;
                    }
                    for line in body.rsplit(|&b| b == b'\n') {
                        stdout.write_all(line)?;
                        stdout.write_all(b"\n")?;
                    }
                }
                Err(e) => {
                    ctx.report("tac", file, e)?;
                    status = ExitStatus::FAILURE;
                }
            }
        }
        stdout.flush()?;
        Ok(status)
    }
}
