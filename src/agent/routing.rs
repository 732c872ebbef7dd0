//! Routing decision for one inbound message.
//!
//! Evaluated in order, first match wins:
//! 1. self-echo without an explicit trigger: ignored
//! 2. explicit trigger (with or without attachments): new command
//! 3. open session: clarification answer
//! 4. store-poll channel: ignored
//! 5. bot channel with text or attachments: new command (trigger is implicit)

use crate::channels::{Message, SourceChannel};

/// How a channel recognizes commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerPolicy {
    /// Text must start with the prefix.
    Prefix(String),
    /// Every message is a command; the prefix is optional and, when present,
    /// forces a new command even while a session is open.
    AlwaysOn(String),
}

impl TriggerPolicy {
    pub fn prefix(&self) -> &str {
        match self {
            TriggerPolicy::Prefix(p) | TriggerPolicy::AlwaysOn(p) => p,
        }
    }

    /// Command text after an explicit trigger, or `None` without one.
    ///
    /// Trailing whitespace in the prefix matches any whitespace or end of
    /// text, so `/c` alone and `/c  ls` both match the prefix `/c `.
    pub fn strip_trigger<'a>(&self, text: &'a str) -> Option<&'a str> {
        let prefix = self.prefix();
        let head = prefix.trim_end();
        if head.is_empty() {
            return None;
        }
        let rest = text.strip_prefix(head)?;
        let needs_separator = head.len() != prefix.len();
        if needs_separator && !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
            return None;
        }
        Some(rest.trim())
    }
}

/// Why a message produced no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    SelfEcho,
    NoTrigger,
    /// Trigger present but nothing to do.
    EmptyCommand,
}

/// Routing outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Start a new command, resetting any open session.
    NewCommand { command: String },
    /// Answer to the open clarification question.
    Continuation,
    Ignore(IgnoreReason),
}

/// Decide what to do with `msg`. Pure; `session_open` is evaluated by the caller.
pub fn route(msg: &Message, policy: &TriggerPolicy, session_open: bool) -> Route {
    let triggered = policy.strip_trigger(&msg.text);

    if msg.is_self_echo && triggered.is_none() {
        return Route::Ignore(IgnoreReason::SelfEcho);
    }

    if let Some(command) = triggered {
        if command.is_empty() && !msg.has_attachments() {
            return Route::Ignore(IgnoreReason::EmptyCommand);
        }
        return Route::NewCommand {
            command: command.to_string(),
        };
    }

    if session_open {
        return Route::Continuation;
    }

    match (msg.source_channel, policy) {
        (SourceChannel::BotApi, _) | (_, TriggerPolicy::AlwaysOn(_)) => {
            if msg.text.is_empty() && !msg.has_attachments() {
                Route::Ignore(IgnoreReason::EmptyCommand)
            } else {
                Route::NewCommand {
                    command: msg.text.clone(),
                }
            }
        }
        (SourceChannel::StorePoll, TriggerPolicy::Prefix(_)) => Route::Ignore(IgnoreReason::NoTrigger),
    }
}
