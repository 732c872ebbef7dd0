//! `MemoryStore` trait: the async interface over the three memory tables.
//!
//! - today turns: append-only until the day rolls over
//! - daily summaries: one row per identity+date
//! - archive: verbatim copies of compacted turns, never pruned

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "agent" | "assistant" => Role::Agent,
            _ => Role::User,
        }
    }
}

/// One stored exchange in the "today" table.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub identity: String,
    pub role: Role,
    pub content: String,
    /// Local calendar day the turn belongs to.
    pub day: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(identity: &str, role: Role, content: &str, day: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            role,
            content: content.to_string(),
            day,
            created_at: Utc::now(),
        }
    }
}

/// Compacted summary of one identity's day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySummary {
    pub identity: String,
    pub date: NaiveDate,
    pub summary: String,
}

/// A turn moved into the permanent archive.
#[derive(Debug, Clone)]
pub struct ArchivedTurn {
    pub id: Uuid,
    pub identity: String,
    pub role: Role,
    pub content: String,
    pub original_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

/// Backend-agnostic store for conversation memory.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Append a turn to the today table.
    async fn append_turn(&self, turn: &ConversationTurn) -> Result<(), DatabaseError>;

    /// Turns for one identity on one day, oldest first.
    async fn turns_on(
        &self,
        identity: &str,
        day: NaiveDate,
    ) -> Result<Vec<ConversationTurn>, DatabaseError>;

    /// All summaries for an identity, oldest first.
    async fn summaries(&self, identity: &str) -> Result<Vec<DailySummary>, DatabaseError>;

    /// Existing summary for one identity+date, if any.
    async fn summary_for(
        &self,
        identity: &str,
        day: NaiveDate,
    ) -> Result<Option<DailySummary>, DatabaseError>;

    /// Distinct (identity, day) pairs with turns dated before `before`.
    async fn pending_rollover(
        &self,
        before: NaiveDate,
    ) -> Result<Vec<(String, NaiveDate)>, DatabaseError>;

    /// Atomically upsert the summary, archive the day's turns, and delete
    /// them from the today table. Returns the number of turns archived.
    async fn compact_day(
        &self,
        identity: &str,
        day: NaiveDate,
        summary: &str,
    ) -> Result<usize, DatabaseError>;

    /// Archived turns for an identity, oldest first.
    async fn archived_turns(&self, identity: &str) -> Result<Vec<ArchivedTurn>, DatabaseError>;
}
