//! Command policy: a pre-handler that denies commands by name.

use std::io::Write as _;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ExecHandler, HandlerContext, Outcome};
use crate::exec::ExitStatus;

/// The result of a policy check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The command may run.
    Allow,
    /// The command is denied with a reason.
    Deny(String),
}

impl PolicyDecision {
    /// Returns true if the command is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    /// Returns the denial reason if denied, None if allowed.
    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny(reason) => Some(reason),
        }
    }
}

/// A rule in a command policy.
#[derive(Clone, Debug)]
struct CommandRule {
    /// Glob pattern matched against the command name
    pattern: glob::Pattern,
    /// Whether this rule allows or denies
    allow: bool,
}

/// Ordered glob rules over command names.
///
/// Rules are evaluated in order - the first matching rule determines the
/// decision. If no rule matches, the default decision is used. Used as a
/// pre-handler, a denied command is handled with exit status 126 and an
/// allowed one passes down the chain.
#[derive(Clone, Debug)]
pub struct CommandPolicy {
    rules: Vec<CommandRule>,
    default_allow: bool,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl CommandPolicy {
    /// A policy without rules that allows everything.
    pub fn allow_all() -> Self {
        Self {
            rules: Vec::new(),
            default_allow: true,
        }
    }

    /// Check a command name.
    ///
    /// Names containing `/` are matched on their last component too, so
    /// denying `rm` also denies `/bin/rm`.
    pub fn check(&self, command: &str) -> PolicyDecision {
        let base = command.rsplit('/').next().unwrap_or(command);
        for rule in &self.rules {
            if rule.pattern.matches(command) || rule.pattern.matches(base) {
                return if rule.allow {
                    PolicyDecision::Allow
                } else {
                    PolicyDecision::Deny(format!(
                        "{command}: denied by policy rule `{}`",
                        rule.pattern
                    ))
                };
            }
        }

        if self.default_allow {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny(format!("{command}: no matching policy rule"))
        }
    }
}

#[async_trait]
impl ExecHandler for CommandPolicy {
    async fn handle(&self, ctx: &HandlerContext, args: &[String]) -> Outcome {
        let Some(name) = args.first() else {
            return Outcome::Pass;
        };
        match self.check(name) {
            PolicyDecision::Allow => {
                debug!(command = %name, "policy: allowed");
                Outcome::Pass
            }
            PolicyDecision::Deny(reason) => {
                warn!(command = %name, "policy: denied");
                let mut stderr = ctx.stdio.stderr.clone();
                let _ = writeln!(stderr, "{reason}");
                Outcome::status(ExitStatus::NOT_EXECUTABLE)
            }
        }
    }
}

/// Builder for creating command policies with a fluent API.
///
/// # Example
///
/// ```rust
/// use cowrie::CommandPolicyBuilder;
///
/// let policy = CommandPolicyBuilder::new()
///     .deny("rm")
///     .deny("curl*")
///     .build();
///
/// assert!(!policy.check("rm").is_allowed());
/// assert!(policy.check("ls").is_allowed());
/// ```
#[derive(Clone, Debug)]
pub struct CommandPolicyBuilder {
    rules: Vec<CommandRule>,
    default_allow: bool,
}

impl Default for CommandPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandPolicyBuilder {
    /// Create a new policy builder with allow-by-default.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_allow: true,
        }
    }

    /// Create a new policy builder with deny-by-default.
    ///
    /// Use this to list only the commands that may run.
    pub fn deny_by_default() -> Self {
        Self {
            rules: Vec::new(),
            default_allow: false,
        }
    }

    /// Allow commands matching the given glob pattern.
    pub fn allow(self, pattern: &str) -> Self {
        self.rule(pattern, true)
    }

    /// Deny commands matching the given glob pattern.
    pub fn deny(self, pattern: &str) -> Self {
        self.rule(pattern, false)
    }

    fn rule(mut self, pattern: &str, allow: bool) -> Self {
        match glob::Pattern::new(pattern) {
            Ok(pattern) => self.rules.push(CommandRule { pattern, allow }),
            Err(e) => warn!(pattern, error = %e, "policy: ignoring invalid pattern"),
        }
        self
    }

    /// Build the policy.
    pub fn build(self) -> CommandPolicy {
        CommandPolicy {
            rules: self.rules,
            default_allow: self.default_allow,
        }
    }
}
