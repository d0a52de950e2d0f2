//! Reference shell interpreter.
//!
//! Parses a subset of the bash language with tree-sitter and executes it.
//! The interpreter never touches the host directly: files are opened,
//! listed and stat'ed through the hooks in [`Hooks`], and every command
//! that is not an interpreter builtin goes to the exec hook.
//!
//! Supported: simple commands with prefix assignments, lists, `&&`, `||`,
//! `!`, pipelines, subshells, groups, `if`, `while`, `until`, `for ... in`,
//! redirections, quoting, `$name`, `${name:-default}`, `$?`, command
//! substitution and globbing of the final path component. Expansions are
//! not field-split.

mod parser;
mod runner;

pub use parser::{
    ParseError, Program, Redirect, RedirectOp, SimpleCommand, Stmt, Word, WordPart, parse,
};
pub use runner::{Hooks, RunError, Runner};
