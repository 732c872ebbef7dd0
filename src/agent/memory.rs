//! Conversation memory: per-identity context for the interpreter, and the
//! daily rollover that compacts finished days into summaries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tracing::{debug, info, warn};

use crate::agent::prompts;
use crate::identity::Identity;
use crate::interpreter::{Interpreter, InterpreterRequest};
use crate::store::{ConversationTurn, MemoryStore, Role};
use crate::tools::shell::floor_char_boundary;

/// Per-turn cap inside the context block, in characters.
const TURN_PREVIEW_CHARS: usize = 600;

/// Transcript cap handed to the summarizer, in bytes.
const TRANSCRIPT_MAX_BYTES: usize = 4000;

/// Outcome of one maintenance run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub summarized_days: usize,
    pub archived_turns: usize,
    /// Days left in place because summarization or compaction failed.
    pub failed_days: usize,
}

pub struct ConversationMemory {
    store: Arc<dyn MemoryStore>,
    interpreter: Arc<dyn Interpreter>,
    summary_timeout: Duration,
}

impl ConversationMemory {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        interpreter: Arc<dyn Interpreter>,
        summary_timeout: Duration,
    ) -> Self {
        Self {
            store,
            interpreter,
            summary_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// Append a turn dated today. Storage failures are logged, never raised.
    pub async fn record_turn(&self, identity: &Identity, role: Role, content: &str) {
        self.record_turn_on(identity, role, content, today()).await;
    }

    pub async fn record_turn_on(&self, identity: &Identity, role: Role, content: &str, day: NaiveDate) {
        let turn = ConversationTurn::new(identity.as_str(), role, content, day);
        if let Err(e) = self.store.append_turn(&turn).await {
            warn!(identity = %identity, error = %e, "Failed to record conversation turn");
        }
    }

    pub async fn build_context_prefix(&self, identity: &Identity) -> String {
        self.build_context_prefix_on(identity, today()).await
    }

    /// History block for `identity`: every summary, then today's turns.
    /// Empty when there is no history or the store is unreadable.
    pub async fn build_context_prefix_on(&self, identity: &Identity, today: NaiveDate) -> String {
        let summaries = self.store.summaries(identity.as_str()).await.unwrap_or_else(|e| {
            warn!(identity = %identity, error = %e, "Failed to load summaries");
            Vec::new()
        });
        let turns = self
            .store
            .turns_on(identity.as_str(), today)
            .await
            .unwrap_or_else(|e| {
                warn!(identity = %identity, error = %e, "Failed to load today's turns");
                Vec::new()
            });

        if summaries.is_empty() && turns.is_empty() {
            return String::new();
        }

        let mut lines = vec!["[Conversation history with this user:]".to_string()];
        if !summaries.is_empty() {
            lines.push("--- Past summaries ---".to_string());
            for s in &summaries {
                lines.push(format!("{}: {}", s.date, s.summary));
            }
        }
        if !turns.is_empty() {
            lines.push("--- Today's conversation (so far) ---".to_string());
            for turn in &turns {
                lines.push(format!(
                    "{}: {}",
                    speaker(turn.role),
                    preview(&turn.content, TURN_PREVIEW_CHARS)
                ));
            }
        }
        lines.push("--- End of history ---".to_string());
        lines.join("\n")
    }

    pub async fn run_daily_maintenance(&self) -> MaintenanceReport {
        self.run_daily_maintenance_on(today()).await
    }

    /// Summarize and archive every identity/day strictly before `today`.
    ///
    /// A day whose summarization fails or comes back empty is left intact so
    /// the next run retries it.
    pub async fn run_daily_maintenance_on(&self, today: NaiveDate) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let pending = match self.store.pending_rollover(today).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Failed to list days pending rollover");
                return report;
            }
        };
        if pending.is_empty() {
            debug!("No conversation days to roll over");
            return report;
        }

        for (identity, day) in pending {
            match self.roll_over(&identity, day).await {
                Some(archived) => {
                    report.summarized_days += 1;
                    report.archived_turns += archived;
                    info!(identity = %identity, day = %day, archived, "Rolled over conversation day");
                }
                None => report.failed_days += 1,
            }
        }
        report
    }

    async fn roll_over(&self, identity: &str, day: NaiveDate) -> Option<usize> {
        let turns = match self.store.turns_on(identity, day).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(identity, day = %day, error = %e, "Failed to load turns for rollover");
                return None;
            }
        };
        if turns.is_empty() {
            return Some(0);
        }

        let previous = match self.store.summary_for(identity, day).await {
            Ok(previous) => previous.map(|s| s.summary),
            Err(e) => {
                warn!(identity, day = %day, error = %e, "Failed to load existing summary");
                None
            }
        };
        let prompt = prompts::summary_prompt(&transcript(&turns), previous.as_deref());
        let summary = match self
            .interpreter
            .invoke(InterpreterRequest::text(&prompt, self.summary_timeout))
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!(identity, day = %day, "Summarizer returned nothing; keeping day");
                return None;
            }
            Err(e) => {
                warn!(identity, day = %day, error = %e, "Summarization failed; keeping day");
                return None;
            }
        };

        match self.store.compact_day(identity, day, &summary).await {
            Ok(archived) => Some(archived),
            Err(e) => {
                warn!(identity, day = %day, error = %e, "Compaction failed");
                None
            }
        }
    }
}

/// Local calendar day.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Agent => "Agent",
    }
}

fn preview(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &content[..cut]),
        None => content.to_string(),
    }
}

fn transcript(turns: &[ConversationTurn]) -> String {
    let full = turns
        .iter()
        .map(|t| format!("{}: {}", speaker(t.role), t.content))
        .collect::<Vec<_>>()
        .join("\n");
    if full.len() <= TRANSCRIPT_MAX_BYTES {
        full
    } else {
        full[..floor_char_boundary(&full, TRANSCRIPT_MAX_BYTES)].to_string()
    }
}
