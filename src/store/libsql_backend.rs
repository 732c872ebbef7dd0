//! libSQL backend: async `MemoryStore` implementation.
//!
//! Supports local file and in-memory databases. Reads share one connection;
//! writes additionally take `write_lock` so only one writer touches the
//! tables at a time.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{ArchivedTurn, ConversationTurn, DailySummary, MemoryStore, Role};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Memory database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn compact_in_transaction(
        &self,
        identity: &str,
        day: &str,
        summary: &str,
    ) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let now = format_timestamp(Utc::now());

        conn.execute(
            "INSERT INTO daily_summaries (identity, summary_date, summary, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identity, summary_date) DO UPDATE SET summary = excluded.summary",
            params![identity, day, summary, now.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("compact_day(summary): {e}")))?;

        conn.execute(
            "INSERT OR IGNORE INTO conversation_archive
                (id, identity, role, content, original_date, created_at, archived_at)
             SELECT id, identity, role, content, turn_date, created_at, ?3
             FROM conversation_turns
             WHERE identity = ?1 AND turn_date = ?2",
            params![identity, day, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("compact_day(archive): {e}")))?;

        let deleted = conn
            .execute(
                "DELETE FROM conversation_turns WHERE identity = ?1 AND turn_date = ?2",
                params![identity, day],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("compact_day(delete): {e}")))?;

        Ok(deleted as usize)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or(NaiveDate::MIN)
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

#[async_trait]
impl MemoryStore for LibSqlBackend {
    async fn append_turn(&self, turn: &ConversationTurn) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO conversation_turns (id, identity, role, content, turn_date, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    turn.id.to_string(),
                    turn.identity.as_str(),
                    turn.role.as_str(),
                    turn.content.as_str(),
                    turn.day.to_string(),
                    format_timestamp(turn.created_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_turn: {e}")))?;
        debug!(identity = %turn.identity, role = turn.role.as_str(), "Turn recorded");
        Ok(())
    }

    async fn turns_on(
        &self,
        identity: &str,
        day: NaiveDate,
    ) -> Result<Vec<ConversationTurn>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, identity, role, content, turn_date, created_at
                 FROM conversation_turns
                 WHERE identity = ?1 AND turn_date = ?2
                 ORDER BY rowid ASC",
                params![identity, day.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("turns_on: {e}")))?;

        let mut turns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let role_str: String = row.get(2).unwrap_or_default();
            let day_str: String = row.get(4).unwrap_or_default();
            let created_str: String = row.get(5).unwrap_or_default();
            turns.push(ConversationTurn {
                id: parse_uuid(&id_str),
                identity: row.get(1).unwrap_or_default(),
                role: Role::parse(&role_str),
                content: row.get(3).unwrap_or_default(),
                day: parse_date(&day_str),
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(turns)
    }

    async fn summaries(&self, identity: &str) -> Result<Vec<DailySummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT identity, summary_date, summary FROM daily_summaries
                 WHERE identity = ?1 ORDER BY summary_date ASC",
                params![identity],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("summaries: {e}")))?;

        let mut summaries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let date_str: String = row.get(1).unwrap_or_default();
            summaries.push(DailySummary {
                identity: row.get(0).unwrap_or_default(),
                date: parse_date(&date_str),
                summary: row.get(2).unwrap_or_default(),
            });
        }
        Ok(summaries)
    }

    async fn summary_for(
        &self,
        identity: &str,
        day: NaiveDate,
    ) -> Result<Option<DailySummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT summary FROM daily_summaries WHERE identity = ?1 AND summary_date = ?2",
                params![identity, day.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("summary_for: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(DailySummary {
                identity: identity.to_string(),
                date: day,
                summary: row.get(0).unwrap_or_default(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("summary_for: {e}"))),
        }
    }

    async fn pending_rollover(
        &self,
        before: NaiveDate,
    ) -> Result<Vec<(String, NaiveDate)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT identity, turn_date FROM conversation_turns
                 WHERE turn_date < ?1 ORDER BY identity, turn_date",
                params![before.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_rollover: {e}")))?;

        let mut pending = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let identity: String = row.get(0).unwrap_or_default();
            let day_str: String = row.get(1).unwrap_or_default();
            pending.push((identity, parse_date(&day_str)));
        }
        Ok(pending)
    }

    async fn compact_day(
        &self,
        identity: &str,
        day: NaiveDate,
        summary: &str,
    ) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        let day = day.to_string();

        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("compact_day(begin): {e}")))?;

        match self.compact_in_transaction(identity, &day, summary).await {
            Ok(archived) => {
                conn.execute("COMMIT", ())
                    .await
                    .map_err(|e| DatabaseError::Query(format!("compact_day(commit): {e}")))?;
                info!(identity, day = %day, archived, "Day compacted");
                Ok(archived)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }

    async fn archived_turns(&self, identity: &str) -> Result<Vec<ArchivedTurn>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, identity, role, content, original_date, created_at, archived_at
                 FROM conversation_archive
                 WHERE identity = ?1
                 ORDER BY original_date ASC, created_at ASC",
                params![identity],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("archived_turns: {e}")))?;

        let mut turns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let role_str: String = row.get(2).unwrap_or_default();
            let date_str: String = row.get(4).unwrap_or_default();
            let created_str: String = row.get(5).unwrap_or_default();
            let archived_str: String = row.get(6).unwrap_or_default();
            turns.push(ArchivedTurn {
                id: parse_uuid(&id_str),
                identity: row.get(1).unwrap_or_default(),
                role: Role::parse(&role_str),
                content: row.get(3).unwrap_or_default(),
                original_date: parse_date(&date_str),
                created_at: parse_datetime(&created_str),
                archived_at: parse_datetime(&archived_str),
            });
        }
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[tokio::test]
    async fn append_and_list_turns_in_order() {
        let db = test_db().await;
        db.append_turn(&ConversationTurn::new("alice", Role::User, "hi", day(1)))
            .await
            .unwrap();
        db.append_turn(&ConversationTurn::new("alice", Role::Agent, "hello", day(1)))
            .await
            .unwrap();
        db.append_turn(&ConversationTurn::new("bob", Role::User, "yo", day(1)))
            .await
            .unwrap();

        let turns = db.turns_on("alice", day(1)).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "hi");
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Agent);
        assert_eq!(turns[1].day, day(1));
    }

    #[tokio::test]
    async fn pending_rollover_excludes_today() {
        let db = test_db().await;
        db.append_turn(&ConversationTurn::new("alice", Role::User, "a", day(1)))
            .await
            .unwrap();
        db.append_turn(&ConversationTurn::new("alice", Role::User, "b", day(1)))
            .await
            .unwrap();
        db.append_turn(&ConversationTurn::new("bob", Role::User, "c", day(2)))
            .await
            .unwrap();
        db.append_turn(&ConversationTurn::new("alice", Role::User, "d", day(3)))
            .await
            .unwrap();

        let pending = db.pending_rollover(day(3)).await.unwrap();
        assert_eq!(
            pending,
            vec![("alice".to_string(), day(1)), ("bob".to_string(), day(2))]
        );
    }

    #[tokio::test]
    async fn compact_day_moves_turns_to_archive() {
        let db = test_db().await;
        let first = ConversationTurn::new("alice", Role::User, "a", day(1));
        db.append_turn(&first).await.unwrap();
        db.append_turn(&ConversationTurn::new("alice", Role::Agent, "b", day(1)))
            .await
            .unwrap();

        let archived = db.compact_day("alice", day(1), "Talked.").await.unwrap();
        assert_eq!(archived, 2);
        assert!(db.turns_on("alice", day(1)).await.unwrap().is_empty());

        let archive = db.archived_turns("alice").await.unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive[0].id, first.id);
        assert_eq!(archive[0].original_date, day(1));

        let summaries = db.summaries("alice").await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summary, "Talked.");
    }

    #[tokio::test]
    async fn summary_upsert_never_duplicates() {
        let db = test_db().await;
        db.append_turn(&ConversationTurn::new("alice", Role::User, "a", day(1)))
            .await
            .unwrap();
        db.compact_day("alice", day(1), "First.").await.unwrap();
        db.append_turn(&ConversationTurn::new("alice", Role::User, "late", day(1)))
            .await
            .unwrap();
        db.compact_day("alice", day(1), "Merged.").await.unwrap();

        let summaries = db.summaries("alice").await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summary, "Merged.");
        assert_eq!(db.archived_turns("alice").await.unwrap().len(), 2);
        assert_eq!(
            db.summary_for("alice", day(1)).await.unwrap().unwrap().summary,
            "Merged."
        );
        assert!(db.summary_for("alice", day(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn summaries_are_oldest_first() {
        let db = test_db().await;
        for d in [3, 1, 2] {
            db.append_turn(&ConversationTurn::new("alice", Role::User, "x", day(d)))
                .await
                .unwrap();
            db.compact_day("alice", day(d), &format!("day {d}"))
                .await
                .unwrap();
        }
        let dates: Vec<_> = db
            .summaries("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.date)
            .collect();
        assert_eq!(dates, vec![day(1), day(2), day(3)]);
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/memory.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.append_turn(&ConversationTurn::new("alice", Role::User, "kept", day(1)))
                .await
                .unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let turns = db.turns_on("alice", day(1)).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "kept");
    }
}
