//! Interactive session registry.
//!
//! Per identity: Idle -> Awaiting(expires_at) -> Idle. Absence from the map
//! is Idle. Expiry is evaluated lazily against the dispatch time; an expired
//! entry stays in the map until the next command or answer replaces it.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::identity::Identity;
use crate::store::Role;

/// How long a clarification question stays answerable, in seconds.
pub const SESSION_TIMEOUT_SECS: i64 = 5 * 60;

pub fn session_timeout() -> Duration {
    Duration::seconds(SESSION_TIMEOUT_SECS)
}

/// One line of an interactive exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTurn {
    pub role: Role,
    pub content: String,
}

/// An open clarification exchange.
#[derive(Debug, Clone)]
pub struct Session {
    pub awaiting_reply: bool,
    /// The request that started the exchange.
    pub original_prompt: String,
    /// The agent's last output including the question.
    pub question_context: String,
    pub history: Vec<SessionTurn>,
    pub opened_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn open(
        original_prompt: &str,
        history: Vec<SessionTurn>,
        question_context: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            awaiting_reply: true,
            original_prompt: original_prompt.to_string(),
            question_context: question_context.to_string(),
            history,
            opened_at: now,
            expires_at: now + session_timeout(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.awaiting_reply && !self.is_expired_at(now)
    }

    /// Prompt continuing the original request with the user's answer.
    /// The question being answered is always the last history line.
    pub fn followup_prompt(&self, reply: &str) -> String {
        let mut lines = vec![
            format!("Original request: {}", self.original_prompt),
            "Conversation history:".to_string(),
        ];
        for turn in &self.history {
            lines.push(format!("  {}: {}", turn.role.as_str(), turn.content));
        }
        lines.push(format!("  {}: {}", Role::Agent.as_str(), self.question_context));
        lines.push(format!(
            "\nThe user replied: '{reply}'. Continue the task."
        ));
        lines.join("\n")
    }
}

/// Observable session state for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Awaiting { expires_at: DateTime<Utc> },
    /// Still stored but past its expiry; behaves as Idle for routing.
    Expired,
}

/// Sessions keyed by identity.
///
/// Callers hold the identity's gate while mutating, so each operation only
/// needs the short map lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Identity, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<Identity, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, identity: &Identity, now: DateTime<Utc>) -> SessionState {
        match self.map().get(identity) {
            None => SessionState::Idle,
            Some(s) if !s.awaiting_reply => SessionState::Idle,
            Some(s) if s.is_expired_at(now) => SessionState::Expired,
            Some(s) => SessionState::Awaiting {
                expires_at: s.expires_at,
            },
        }
    }

    /// True when a reply from `identity` at `now` answers an open question.
    pub fn is_awaiting(&self, identity: &Identity, now: DateTime<Utc>) -> bool {
        matches!(self.state(identity, now), SessionState::Awaiting { .. })
    }

    /// Open (or replace) the session for `identity`.
    pub fn open(&self, identity: &Identity, session: Session) {
        info!(
            identity = %identity,
            expires_at = %session.expires_at,
            "Session awaiting reply"
        );
        self.map().insert(identity.clone(), session);
    }

    /// Remove and return the open session, if it is still answerable.
    pub fn take_open(&self, identity: &Identity, now: DateTime<Utc>) -> Option<Session> {
        let mut map = self.map();
        match map.remove(identity) {
            Some(session) if session.is_open_at(now) => Some(session),
            Some(_) => {
                debug!(identity = %identity, "Dropped expired session");
                None
            }
            None => None,
        }
    }

    /// Return `identity` to Idle. Returns whether anything was open.
    pub fn reset(&self, identity: &Identity) -> bool {
        let removed = self.map().remove(identity).is_some();
        if removed {
            debug!(identity = %identity, "Session reset");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
