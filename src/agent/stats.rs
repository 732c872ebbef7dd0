//! Process-wide command counters for the `status` command.
//!
//! Lives for the process lifetime only; a restart resets everything.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

/// Characters of the last command shown in the status report.
const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    last_command: Option<(String, DateTime<Utc>)>,
}

/// Uptime, command count and last command.
#[derive(Debug)]
pub struct AgentStats {
    started_at: DateTime<Utc>,
    counters: Mutex<Counters>,
}

impl AgentStats {
    pub fn new() -> Self {
        Self::started_at(Utc::now())
    }

    pub fn started_at(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Count a processed command.
    pub fn record(&self, command: &str, at: DateTime<Utc>) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.processed += 1;
        counters.last_command = Some((command.to_string(), at));
    }

    pub fn processed(&self) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .processed
    }

    /// Human-readable status block.
    pub fn report(&self, now: DateTime<Utc>) -> String {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let uptime = (now - self.started_at).num_seconds().max(0);
        let mut lines = vec![
            "🤖 Agent Status".to_string(),
            format!("Uptime: {}h {}m", uptime / 3600, (uptime % 3600) / 60),
            format!("Commands processed: {}", counters.processed),
        ];
        match &counters.last_command {
            Some((command, at)) => {
                let minutes = (now - *at).num_minutes().max(0);
                lines.push(format!("Last command: {} ({minutes}m ago)", preview(command)));
            }
            None => lines.push("Last command: none".to_string()),
        }
        lines.join("\n")
    }
}

impl Default for AgentStats {
    fn default() -> Self {
        Self::new()
    }
}

fn preview(command: &str) -> String {
    if command.chars().count() > PREVIEW_CHARS {
        format!("{}…", command.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        command.to_string()
    }
}
