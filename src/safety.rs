//! Deletion safety guard.
//!
//! A deny-list policy over command text. The shell passthrough path is hard
//! gated by [`DeletionGuard::check`]; natural-language commands are checked
//! the same way and additionally carry [`STANDING_INSTRUCTION`] in the
//! interpreter's system context.

use std::borrow::Cow;

use regex::Regex;
use tracing::{debug, warn};

/// Reply sent when a command trips the guard.
pub const BLOCK_RESPONSE: &str =
    "🚫 File deletion commands are blocked by security policy. Moving files is allowed.";

/// Advisory rule injected into every natural-language invocation.
pub const STANDING_INSTRUCTION: &str = "NEVER delete files or directories. \
     Do not run rm, rmdir, unlink, trash, find -delete, truncate, shutil.rmtree, os.remove \
     or anything equivalent. Moving or renaming files is allowed. \
     If a task seems to require deletion, explain what you would delete and ask instead.";

/// Replacement used when a probable credential would otherwise be logged.
pub const REDACTED_CREDENTIAL: &str = "[REDACTED_CREDENTIAL]";

/// Default deletion rules: (name, case-insensitive pattern, reason).
const DEFAULT_RULES: &[(&str, &str, &str)] = &[
    ("rm", r"\brm(\s|$)", "file removal"),
    ("rmdir", r"\brmdir\b", "directory removal"),
    ("unlink", r"\bunlink\b", "unlink"),
    ("trash", r"\btrash\b", "move to trash"),
    ("move-to-trash", r"move\s+to\s+trash", "move to trash"),
    ("rmtree", r"shutil\.rmtree", "recursive tree removal"),
    ("os-remove", r"os\.(remove|unlink|rmdir)\b", "library file removal"),
    ("pathlib-unlink", r"pathlib.*\.unlink", "library file removal"),
    ("delete-file", r"\bdelete\b.*\bfiles?\b", "file deletion request"),
    ("find-delete", r"\bfind\s+.*-delete\b", "find with -delete"),
    ("dev-null-redirect", r">\s*/dev/null", "redirect to /dev/null"),
    ("truncate", r"\btruncate\b", "truncate to zero"),
    (
        "bare-redirect",
        r"(^|[;&|]\s*)(:\s*)?>\s*[^\s>&]",
        "truncate via bare redirection",
    ),
];

/// A policy rule matched during a guard check.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub name: String,
    pub action: PolicyAction,
    pub reason: String,
}

/// What to do when a policy rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Block,
}

/// A single deny rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct GuardRule {
    /// Short identifier used in logs.
    pub name: String,
    pub regex: Regex,
    pub reason: String,
}

/// Extensible deny-list over command text.
#[derive(Debug, Clone)]
pub struct DeletionGuard {
    rules: Vec<GuardRule>,
}

impl DeletionGuard {
    /// Create a guard with the default deletion patterns.
    pub fn default_rules() -> Self {
        let mut guard = Self::empty();
        for (name, pattern, reason) in DEFAULT_RULES {
            guard
                .add_rule(name, pattern, reason)
                .expect("default guard patterns are valid regexes");
        }
        guard
    }

    /// Create a guard with no rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a deny rule. Matching is always case-insensitive.
    pub fn add_rule(&mut self, name: &str, pattern: &str, reason: &str) -> Result<(), regex::Error> {
        let regex = Regex::new(&format!("(?i){pattern}"))?;
        self.rules.push(GuardRule {
            name: name.to_string(),
            regex,
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate `text` against every rule; the first match blocks.
    pub fn check(&self, text: &str) -> PolicyRule {
        for rule in &self.rules {
            if rule.regex.is_match(text) {
                warn!(rule = %rule.name, "Deletion guard blocked command");
                return PolicyRule {
                    name: rule.name.clone(),
                    action: PolicyAction::Block,
                    reason: rule.reason.clone(),
                };
            }
        }
        debug!("Deletion guard passed");
        PolicyRule {
            name: "default".into(),
            action: PolicyAction::Allow,
            reason: "no deletion pattern matched".into(),
        }
    }

    pub fn is_blocked(&self, text: &str) -> bool {
        self.check(text).action == PolicyAction::Block
    }
}

impl Default for DeletionGuard {
    fn default() -> Self {
        Self::default_rules()
    }
}

/// Replace text that looks like a password with [`REDACTED_CREDENTIAL`].
///
/// A probable credential is a single token of 8+ characters mixing letters,
/// digits and symbols.
pub fn redact_credential(text: &str) -> Cow<'_, str> {
    let trimmed = text.trim();
    let looks_secret = trimmed.chars().count() >= 8
        && !trimmed.chars().any(char::is_whitespace)
        && trimmed.chars().any(char::is_alphabetic)
        && trimmed.chars().any(|c| c.is_ascii_digit())
        && trimmed.chars().any(|c| !c.is_alphanumeric());
    if looks_secret {
        Cow::Borrowed(REDACTED_CREDENTIAL)
    } else {
        Cow::Borrowed(text)
    }
}
