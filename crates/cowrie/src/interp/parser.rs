//! Shell source to statement tree, via the tree-sitter bash grammar.
//!
//! The syntax tree borrows the source, so everything is converted into the
//! owned [`Program`] before the tree is dropped.

use thiserror::Error;
use tree_sitter::{Node, Parser};

/// Errors produced while parsing shell source.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Input ended inside an unterminated construct
    #[error("unexpected end of input")]
    Incomplete,
    /// Syntax error at a 0-indexed position
    #[error("syntax error at line {}, column {}", .row + 1, .column + 1)]
    Syntax {
        /// Line of the first error
        row: usize,
        /// Column of the first error
        column: usize,
    },
    /// Valid shell, but outside the supported subset
    #[error("unsupported syntax: {0}")]
    Unsupported(String),
    /// The grammar could not be loaded
    #[error("failed to load bash grammar: {0}")]
    Language(String),
}

/// A parsed script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    /// Top-level statements in order
    pub body: Vec<Stmt>,
}

/// One statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    /// `name args...` with optional prefix assignments
    Simple(SimpleCommand),
    /// `a | b | c`
    Pipeline(Vec<Stmt>),
    /// `a && b`
    And(Box<Stmt>, Box<Stmt>),
    /// `a || b`
    Or(Box<Stmt>, Box<Stmt>),
    /// `! a`
    Not(Box<Stmt>),
    /// A compound statement with redirections, e.g. `{ a; b; } > out`
    Redirected {
        /// Statement the redirections apply to
        body: Box<Stmt>,
        /// Redirections in source order
        redirects: Vec<Redirect>,
    },
    /// `( ... )`
    Subshell(Vec<Stmt>),
    /// `{ ...; }`
    Group(Vec<Stmt>),
    /// `if/elif/else`
    If {
        /// `(condition, body)` per `if` and `elif`
        branches: Vec<(Vec<Stmt>, Vec<Stmt>)>,
        /// `else` body
        otherwise: Option<Vec<Stmt>>,
    },
    /// `while` and `until` loops
    While {
        /// Loop while the condition fails instead
        until: bool,
        /// Condition list
        condition: Vec<Stmt>,
        /// Loop body
        body: Vec<Stmt>,
    },
    /// `for name in words; do ...; done`
    For {
        /// Loop variable
        var: String,
        /// Words to iterate over
        items: Vec<Word>,
        /// Loop body
        body: Vec<Stmt>,
    },
}

/// A simple command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleCommand {
    /// `NAME=value` prefixes
    pub assignments: Vec<(String, Word)>,
    /// Command name and arguments
    pub words: Vec<Word>,
    /// Redirections
    pub redirects: Vec<Redirect>,
}

/// A word, made of parts expanded and joined at run time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Word {
    /// Parts in order
    pub parts: Vec<WordPart>,
}

impl Word {
    /// A word holding a single unquoted literal.
    pub fn literal(s: impl Into<String>) -> Self {
        Self {
            parts: vec![WordPart::Literal(s.into())],
        }
    }
}

/// Part of a [`Word`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WordPart {
    /// Unquoted text; glob characters are active
    Literal(String),
    /// Quoted or escaped text
    Quoted(String),
    /// `$name`, `${name}` or `${name:-default}`
    Param {
        /// Variable name, or a special parameter such as `?`
        name: String,
        /// Fallback used when the variable is unset or empty
        default: Option<Word>,
    },
    /// `$(...)` or backticks
    CommandSub(Vec<Stmt>),
}

/// A redirection operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOp {
    /// `<`
    Read,
    /// `>` and `>|`
    Write,
    /// `>>`
    Append,
    /// `&>`
    WriteAll,
    /// `&>>`
    AppendAll,
    /// `>&`
    DupOut,
    /// `<&`
    DupIn,
    /// `<<<`
    HereString,
}

/// One redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Explicit file descriptor, e.g. the `2` in `2>err`
    pub fd: Option<u32>,
    /// Operator
    pub op: RedirectOp,
    /// File name, descriptor or here-string
    pub target: Word,
}

/// Parse shell source.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_bash::LANGUAGE.into())
        .map_err(|e| ParseError::Language(e.to_string()))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| ParseError::Language("parser returned no tree".into()))?;

    let root = tree.root_node();
    if root.has_error() {
        return Err(syntax_error(root, source));
    }
    let converter = Converter { src: source };
    Ok(Program {
        body: converter.stmts(root)?,
    })
}

fn syntax_error(root: Node<'_>, source: &str) -> ParseError {
    let Some(err) = first_error(root) else {
        return ParseError::Incomplete;
    };
    // An error that runs into the end of the input means more input could
    // still complete the construct.
    if err.is_missing() || err.end_byte() >= source.trim_end().len() {
        return ParseError::Incomplete;
    }
    let pos = err.start_position();
    ParseError::Syntax {
        row: pos.row,
        column: pos.column,
    }
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    children(node)
        .into_iter()
        .filter(|c| c.has_error() || c.is_missing())
        .find_map(first_error)
}

fn children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

fn unsupported(what: impl Into<String>) -> ParseError {
    ParseError::Unsupported(what.into())
}

struct Converter<'s> {
    src: &'s str,
}

impl<'s> Converter<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        self.src.get(node.byte_range()).unwrap_or_default()
    }

    /// Statements among the children of `node`.
    fn stmts(&self, node: Node<'_>) -> Result<Vec<Stmt>, ParseError> {
        let mut out = Vec::new();
        for child in children(node) {
            if child.kind() == "&" {
                return Err(unsupported("background jobs"));
            }
            if child.is_named() && child.kind() != "comment" {
                out.push(self.stmt(child)?);
            }
        }
        Ok(out)
    }

    fn stmt(&self, node: Node<'_>) -> Result<Stmt, ParseError> {
        match node.kind() {
            "command" => self.command(node).map(Stmt::Simple),
            "variable_assignment" => Ok(Stmt::Simple(SimpleCommand {
                assignments: vec![self.assignment(node)?],
                ..Default::default()
            })),
            "variable_assignments" => {
                let assignments = named_children(node)
                    .into_iter()
                    .map(|n| self.assignment(n))
                    .collect::<Result<_, _>>()?;
                Ok(Stmt::Simple(SimpleCommand {
                    assignments,
                    ..Default::default()
                }))
            }
            "declaration_command" | "unset_command" => self.declaration(node),
            "test_command" => self.test_command(node),
            "pipeline" => {
                if children(node).iter().any(|c| c.kind() == "|&") {
                    return Err(unsupported("|&"));
                }
                let stages = named_children(node)
                    .into_iter()
                    .filter(|c| c.kind() != "comment")
                    .map(|c| self.stmt(c))
                    .collect::<Result<_, _>>()?;
                Ok(Stmt::Pipeline(stages))
            }
            "list" => self.list(node),
            "negated_command" => {
                let inner = named_children(node)
                    .into_iter()
                    .next()
                    .ok_or_else(|| unsupported("empty negation"))?;
                Ok(Stmt::Not(Box::new(self.stmt(inner)?)))
            }
            "redirected_statement" => self.redirected(node),
            "subshell" => Ok(Stmt::Subshell(self.stmts(node)?)),
            "compound_statement" => Ok(Stmt::Group(self.stmts(node)?)),
            "if_statement" => self.if_statement(node),
            "while_statement" => self.while_statement(node),
            "for_statement" => self.for_statement(node),
            other => Err(unsupported(other)),
        }
    }

    fn command(&self, node: Node<'_>) -> Result<SimpleCommand, ParseError> {
        let mut cmd = SimpleCommand::default();
        for child in children(node) {
            match child.kind() {
                "variable_assignment" => cmd.assignments.push(self.assignment(child)?),
                "file_redirect" | "herestring_redirect" | "heredoc_redirect" => {
                    cmd.redirects.push(self.redirect(child)?)
                }
                "command_name" => {
                    let name = named_children(child)
                        .into_iter()
                        .next()
                        .ok_or_else(|| unsupported("empty command name"))?;
                    cmd.words.push(self.word(name)?);
                }
                "comment" => {}
                _ if child.is_named() => cmd.words.push(self.word(child)?),
                // Operators kept as arguments, such as `==` after `test`
                op => cmd.words.push(Word::literal(op)),
            }
        }
        Ok(cmd)
    }

    fn assignment(&self, node: Node<'_>) -> Result<(String, Word), ParseError> {
        let name = node
            .child_by_field_name("name")
            .map(|n| self.text(n).to_string())
            .ok_or_else(|| unsupported("assignment without a name"))?;
        if children(node).iter().any(|c| c.kind() == "+=") {
            return Err(unsupported("+="));
        }
        let value = match node.child_by_field_name("value") {
            Some(v) if v.kind() == "array" => return Err(unsupported("arrays")),
            Some(v) => self.word(v)?,
            None => Word::default(),
        };
        Ok((name, value))
    }

    /// `export`/`unset` style commands become simple commands; assignments
    /// are kept as `NAME=value` arguments.
    fn declaration(&self, node: Node<'_>) -> Result<Stmt, ParseError> {
        let mut cmd = SimpleCommand::default();
        for child in children(node) {
            match child.kind() {
                "variable_assignment" => {
                    let (name, value) = self.assignment(child)?;
                    let mut word = Word::literal(format!("{name}="));
                    word.parts.extend(value.parts);
                    cmd.words.push(word);
                }
                "comment" => {}
                _ if child.is_named() => cmd.words.push(self.word(child)?),
                keyword => cmd.words.push(Word::literal(keyword)),
            }
        }
        Ok(Stmt::Simple(cmd))
    }

    /// `[ expr ]` flattened back into the argument list of `[`.
    fn test_command(&self, node: Node<'_>) -> Result<Stmt, ParseError> {
        let mut words = Vec::new();
        for child in children(node) {
            match child.kind() {
                "[" => words.push(Word::literal("[")),
                "]" => words.push(Word::literal("]")),
                "[[" | "((" => return Err(unsupported(child.kind())),
                _ => self.flatten_test(child, &mut words)?,
            }
        }
        Ok(Stmt::Simple(SimpleCommand {
            words,
            ..Default::default()
        }))
    }

    fn flatten_test(&self, node: Node<'_>, words: &mut Vec<Word>) -> Result<(), ParseError> {
        if !node.is_named() {
            words.push(Word::literal(node.kind()));
        } else if node.kind().ends_with("_expression") {
            for child in children(node) {
                self.flatten_test(child, words)?;
            }
        } else if node.kind() != "comment" {
            words.push(self.word(node)?);
        }
        Ok(())
    }

    fn list(&self, node: Node<'_>) -> Result<Stmt, ParseError> {
        let mut acc: Option<Stmt> = None;
        let mut op: Option<&str> = None;
        for child in children(node) {
            match child.kind() {
                "&&" | "||" => op = Some(child.kind()),
                "comment" => {}
                _ if child.is_named() => {
                    let stmt = self.stmt(child)?;
                    acc = Some(match (acc.take(), op.take()) {
                        (None, _) => stmt,
                        (Some(left), Some("||")) => Stmt::Or(Box::new(left), Box::new(stmt)),
                        (Some(left), _) => Stmt::And(Box::new(left), Box::new(stmt)),
                    });
                }
                _ => {}
            }
        }
        acc.ok_or_else(|| unsupported("empty list"))
    }

    fn redirected(&self, node: Node<'_>) -> Result<Stmt, ParseError> {
        let body_node = node.child_by_field_name("body");
        let mut redirects = Vec::new();
        for child in named_children(node) {
            if Some(child) == body_node || child.kind() == "comment" {
                continue;
            }
            redirects.push(self.redirect(child)?);
        }
        let body = match body_node {
            Some(b) => self.stmt(b)?,
            None => Stmt::Simple(SimpleCommand::default()),
        };
        // Simple commands carry their own redirections.
        Ok(match body {
            Stmt::Simple(mut cmd) => {
                cmd.redirects.extend(redirects);
                Stmt::Simple(cmd)
            }
            body => Stmt::Redirected {
                body: Box::new(body),
                redirects,
            },
        })
    }

    fn redirect(&self, node: Node<'_>) -> Result<Redirect, ParseError> {
        if node.kind() == "heredoc_redirect" {
            return Err(unsupported("here-documents"));
        }
        let mut fd = None;
        let mut op = None;
        let mut target = Word::default();
        for child in children(node) {
            match child.kind() {
                "file_descriptor" => {
                    fd = Some(
                        self.text(child)
                            .parse()
                            .map_err(|_| unsupported(self.text(child)))?,
                    )
                }
                "<" => op = Some(RedirectOp::Read),
                ">" | ">|" => op = Some(RedirectOp::Write),
                ">>" => op = Some(RedirectOp::Append),
                "&>" => op = Some(RedirectOp::WriteAll),
                "&>>" => op = Some(RedirectOp::AppendAll),
                ">&" => op = Some(RedirectOp::DupOut),
                "<&" => op = Some(RedirectOp::DupIn),
                "<<<" => op = Some(RedirectOp::HereString),
                "comment" => {}
                _ if child.is_named() => target.parts.extend(self.word(child)?.parts),
                other => return Err(unsupported(format!("redirection {other}"))),
            }
        }
        let op = op.ok_or_else(|| unsupported(self.text(node)))?;
        Ok(Redirect { fd, op, target })
    }

    fn if_statement(&self, node: Node<'_>) -> Result<Stmt, ParseError> {
        let mut branches = Vec::new();
        let mut otherwise = None;
        let (mut condition, mut body) = (Vec::new(), Vec::new());
        let mut in_body = false;
        for child in children(node) {
            match child.kind() {
                "then" => in_body = true,
                "elif_clause" => branches.push(self.clause(child)?),
                "else_clause" => otherwise = Some(self.stmts(child)?),
                "comment" => {}
                _ if child.is_named() => {
                    let stmt = self.stmt(child)?;
                    if in_body {
                        body.push(stmt);
                    } else {
                        condition.push(stmt);
                    }
                }
                _ => {}
            }
        }
        branches.insert(0, (condition, body));
        Ok(Stmt::If {
            branches,
            otherwise,
        })
    }

    fn clause(&self, node: Node<'_>) -> Result<(Vec<Stmt>, Vec<Stmt>), ParseError> {
        let (mut condition, mut body) = (Vec::new(), Vec::new());
        let mut in_body = false;
        for child in children(node) {
            match child.kind() {
                "then" => in_body = true,
                "comment" => {}
                _ if child.is_named() => {
                    let stmt = self.stmt(child)?;
                    if in_body {
                        body.push(stmt);
                    } else {
                        condition.push(stmt);
                    }
                }
                _ => {}
            }
        }
        Ok((condition, body))
    }

    fn while_statement(&self, node: Node<'_>) -> Result<Stmt, ParseError> {
        let mut until = false;
        let mut condition = Vec::new();
        let mut body = Vec::new();
        for child in children(node) {
            match child.kind() {
                "until" => until = true,
                "do_group" => body = self.stmts(child)?,
                "comment" => {}
                _ if child.is_named() => condition.push(self.stmt(child)?),
                _ => {}
            }
        }
        Ok(Stmt::While {
            until,
            condition,
            body,
        })
    }

    fn for_statement(&self, node: Node<'_>) -> Result<Stmt, ParseError> {
        let all = children(node);
        if all.first().is_some_and(|c| c.kind() == "select") {
            return Err(unsupported("select"));
        }
        if !all.iter().any(|c| c.kind() == "in") {
            return Err(unsupported("for without in"));
        }
        let var = node
            .child_by_field_name("variable")
            .map(|n| self.text(n).to_string())
            .ok_or_else(|| unsupported("for without a variable"))?;
        let mut cursor = node.walk();
        let items = node
            .children_by_field_name("value", &mut cursor)
            .map(|n| self.word(n))
            .collect::<Result<_, _>>()?;
        let body = match node.child_by_field_name("body") {
            Some(b) => self.stmts(b)?,
            None => Vec::new(),
        };
        Ok(Stmt::For { var, items, body })
    }

    fn word(&self, node: Node<'_>) -> Result<Word, ParseError> {
        let mut word = Word::default();
        self.word_parts(node, &mut word.parts)?;
        Ok(word)
    }

    fn word_parts(&self, node: Node<'_>, parts: &mut Vec<WordPart>) -> Result<(), ParseError> {
        match node.kind() {
            "word" => unescape_word(self.text(node), parts),
            "number" | "variable_name" | "test_operator" | "regex" | "extglob_pattern" => {
                parts.push(WordPart::Literal(self.text(node).to_string()))
            }
            "raw_string" => {
                let text = self.text(node);
                let inner = text
                    .strip_prefix('\'')
                    .and_then(|t| t.strip_suffix('\''))
                    .unwrap_or(text);
                parts.push(WordPart::Quoted(inner.to_string()));
            }
            "ansi_c_string" => return Err(unsupported("ANSI-C quoting")),
            "string" => self.string(node, parts)?,
            "simple_expansion" => {
                let name = self.text(node).trim_start_matches('$').to_string();
                parts.push(WordPart::Param {
                    name,
                    default: None,
                });
            }
            "expansion" => parts.push(self.expansion(node)?),
            "command_substitution" => parts.push(WordPart::CommandSub(self.stmts(node)?)),
            "concatenation" => {
                for child in children(node) {
                    if child.is_named() {
                        self.word_parts(child, parts)?;
                    } else {
                        parts.push(WordPart::Literal(self.text(child).to_string()));
                    }
                }
            }
            other => return Err(unsupported(other)),
        }
        Ok(())
    }

    /// Double-quoted string: the text between expansions is taken straight
    /// from the source.
    fn string(&self, node: Node<'_>, parts: &mut Vec<WordPart>) -> Result<(), ParseError> {
        let end = node.end_byte().saturating_sub(1);
        let mut pos = node.start_byte() + 1;
        let first = parts.len();
        for child in named_children(node) {
            if !matches!(
                child.kind(),
                "simple_expansion" | "expansion" | "command_substitution"
            ) {
                if child.kind() == "arithmetic_expansion" {
                    return Err(unsupported("arithmetic expansion"));
                }
                continue;
            }
            let gap = self.src.get(pos..child.start_byte()).unwrap_or_default();
            // Always lead with a quoted part so `"$empty"` still yields a field.
            if !gap.is_empty() || parts.len() == first {
                parts.push(WordPart::Quoted(unescape_double(gap)));
            }
            self.word_parts(child, parts)?;
            pos = child.end_byte();
        }
        let tail = self.src.get(pos..end).unwrap_or_default();
        if !tail.is_empty() || parts.len() == first {
            parts.push(WordPart::Quoted(unescape_double(tail)));
        }
        Ok(())
    }

    fn expansion(&self, node: Node<'_>) -> Result<WordPart, ParseError> {
        let mut name = None;
        let mut default: Option<Word> = None;
        for child in children(node) {
            match child.kind() {
                "${" | "}" => {}
                "variable_name" | "special_variable_name" if name.is_none() => {
                    name = Some(self.text(child).to_string())
                }
                ":-" | "-" if name.is_some() && default.is_none() => {
                    default = Some(Word::default())
                }
                _ if child.is_named() && default.is_some() => {
                    if let Some(word) = default.as_mut() {
                        self.word_parts(child, &mut word.parts)?;
                    }
                }
                _ => return Err(unsupported(self.text(node))),
            }
        }
        let name = name.ok_or_else(|| unsupported(self.text(node)))?;
        Ok(WordPart::Param { name, default })
    }
}

fn has_glob_chars(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Split an unquoted word on backslash escapes; escaped characters lose
/// their glob meaning.
fn unescape_word(text: &str, parts: &mut Vec<WordPart>) {
    let mut literal = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            literal.push(c);
            continue;
        }
        match chars.next() {
            Some('\n') => {}
            Some(escaped) => {
                if !literal.is_empty() {
                    parts.push(WordPart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(WordPart::Quoted(escaped.to_string()));
            }
            None => literal.push('\\'),
        }
    }
    if !literal.is_empty() || parts.is_empty() {
        parts.push(WordPart::Literal(literal));
    }
}

fn unescape_double(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\'
            && let Some(&next) = chars.peek()
            && matches!(next, '"' | '\\' | '$' | '`' | '\n')
        {
            chars.next();
            if next != '\n' {
                out.push(next);
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// Whether the word contains unquoted glob characters.
pub(crate) fn is_glob(word: &Word) -> bool {
    word.parts
        .iter()
        .any(|p| matches!(p, WordPart::Literal(s) if has_glob_chars(s)))
}
